//! Generation stage: fill every region volume once

use super::region_table::RegionTable;
use crate::core::Result;
use crate::gpu::{GpuBackend, Kernel, SyncCommandBatch};
use crate::voxel::REGION_WORKGROUPS;

/// Dispatch the generation kernel for every region in one batch and wait
///
/// Returns the number of regions generated; a second call generates nothing.
pub fn generate_regions<B: GpuBackend + ?Sized>(
    backend: &mut B,
    batch: &mut SyncCommandBatch,
    table: &mut RegionTable,
) -> Result<usize> {
    if table.is_generated() {
        log::warn!("Regions already generated, skipping");
        return Ok(0);
    }

    let generated = batch.run(backend, |_, rec| {
        for record in table.records() {
            rec.dispatch(Kernel::Generation, &[record.generation_binding()], REGION_WORKGROUPS);
        }
        Ok(rec.len())
    })?;
    table.mark_generated();

    log::info!("Generated {generated} regions");
    Ok(generated)
}
