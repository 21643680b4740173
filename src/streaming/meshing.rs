//! Meshing stage: dispatch up to one batch of pending regions into staging slots

use super::mesh_state::MeshState;
use super::region_table::{MeshingOrder, RegionTable};
use super::staging::{StagingPool, COUNTER_SIZE};
use crate::core::Result;
use crate::gpu::{GpuBackend, Kernel, SubmissionId, SyncCommandBatch};
use crate::voxel::{RegionId, REGION_WORKGROUPS};

/// Regions meshed into staging slots, waiting to be materialized
///
/// The slot-to-region pairing recorded at dispatch time; materialization
/// reads counts and source offsets through the same pairing.
#[must_use = "a meshed batch holds staging slots until it is materialized"]
#[derive(Debug)]
pub struct MeshedBatch {
    pairs: Vec<(u32, RegionId)>,
    submission: Option<SubmissionId>,
}

impl MeshedBatch {
    /// `(slot, region)` in dispatch order
    pub fn pairs(&self) -> &[(u32, RegionId)] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn submission(&self) -> Option<SubmissionId> {
        self.submission
    }

    pub(crate) fn into_pairs(self) -> Vec<(u32, RegionId)> {
        self.pairs
    }
}

/// Mesh up to `pool.slot_count()` pending regions
///
/// Returns `None` once no region is waiting for meshing. Each selected region
/// gets a freshly cleared slot counter, a meshing dispatch, and moves to
/// `AwaitVertexBufferCreation`; the used counters are then copied to the
/// readback buffer. The batch is submitted and awaited before returning.
pub fn mesh_next_batch<B: GpuBackend + ?Sized>(
    backend: &mut B,
    batch: &mut SyncCommandBatch,
    table: &mut RegionTable,
    pool: &mut StagingPool,
    order: MeshingOrder,
) -> Result<Option<MeshedBatch>> {
    let selected: Vec<RegionId> = table
        .pending(order)
        .into_iter()
        .take(pool.slot_count() as usize)
        .collect();
    if selected.is_empty() {
        return Ok(None);
    }

    let pairs = batch.run(backend, |_, rec| {
        let layout = *pool.layout();
        let mut pairs = Vec::with_capacity(selected.len());

        for (slot, &id) in (0u32..).zip(&selected) {
            pool.lease(slot, id)?;
            rec.clear_buffer(pool.counters(), layout.counter_offset(slot), COUNTER_SIZE);
            let region_binding = table.get(id)?.meshing_binding();
            rec.dispatch(Kernel::Meshing, &[pool.binding(slot)?, region_binding], REGION_WORKGROUPS);
            table.advance(id, MeshState::AwaitVertexBufferCreation)?;
            pairs.push((slot, id));
        }

        for &(slot, _) in &pairs {
            rec.copy_buffer(
                pool.counters(),
                layout.counter_offset(slot),
                pool.readback(),
                layout.readback_offset(slot),
                COUNTER_SIZE,
            );
        }
        Ok(pairs)
    })?;

    log::debug!(
        "Meshing batch: {} regions ({}..={})",
        pairs.len(),
        pairs.first().map_or(0, |p| p.1 .0),
        pairs.last().map_or(0, |p| p.1 .0)
    );
    Ok(Some(MeshedBatch {
        pairs,
        submission: batch.last_submission(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::core::Error;
    use crate::gpu::{Command, Fault, SoftwareBackend};
    use crate::streaming::test_support::Recording;

    fn setup(regions: u32, slots: u32) -> (SoftwareBackend, RegionTable, StagingPool, SyncCommandBatch) {
        let mut backend = SoftwareBackend::new();
        let world = WorldConfig { num_regions: regions, grid_width: 16, seed: 0 };
        let table = RegionTable::initialize(&mut backend, &world).unwrap();
        let pool = StagingPool::new(&mut backend, slots).unwrap();
        (backend, table, pool, SyncCommandBatch::new(None))
    }

    #[test]
    fn test_batch_takes_first_slots() {
        let (mut backend, mut table, mut pool, mut batch) = setup(10, 8);

        let meshed = mesh_next_batch(&mut backend, &mut batch, &mut table, &mut pool, MeshingOrder::Index)
            .unwrap()
            .unwrap();
        assert_eq!(meshed.len(), 8);
        for (i, &(slot, id)) in meshed.pairs().iter().enumerate() {
            assert_eq!(slot, i as u32);
            assert_eq!(id, RegionId(i as u32));
            assert_eq!(table.state(id).unwrap(), MeshState::AwaitVertexBufferCreation);
        }
        assert_eq!(table.count_in(MeshState::AwaitMeshingCompute), 2);
        assert_eq!(pool.leased(), 8);
        assert!(meshed.submission().is_some());
    }

    #[test]
    fn test_drained_returns_none() {
        let (mut backend, mut table, mut pool, mut batch) = setup(0, 4);
        let meshed = mesh_next_batch(&mut backend, &mut batch, &mut table, &mut pool, MeshingOrder::Index).unwrap();
        assert!(meshed.is_none());
        assert_eq!(backend.submissions(), 0);
    }

    #[test]
    fn test_partial_batch() {
        let (mut backend, mut table, mut pool, mut batch) = setup(3, 8);
        let meshed = mesh_next_batch(&mut backend, &mut batch, &mut table, &mut pool, MeshingOrder::Index)
            .unwrap()
            .unwrap();
        assert_eq!(meshed.pairs(), &[(0, RegionId(0)), (1, RegionId(1)), (2, RegionId(2))]);
        assert_eq!(pool.leased(), 3);
    }

    #[test]
    fn test_counter_cleared_before_each_dispatch() {
        let (mut backend, mut table, mut pool, mut batch) = setup(1, 1);
        let stale = 12345u32.to_le_bytes();
        backend.write_buffer(pool.counters(), 0, &stale).unwrap();

        let _ = mesh_next_batch(&mut backend, &mut batch, &mut table, &mut pool, MeshingOrder::Index)
            .unwrap()
            .unwrap();
        // Region was never generated: all air, so a cleared counter reads zero
        let bytes = backend.read_buffer(pool.readback(), 0, 4, None).unwrap();
        assert_eq!(bytes, 0u32.to_le_bytes());
    }

    #[test]
    fn test_failure_propagates_without_partial_recovery() {
        let (mut backend, mut table, mut pool, mut batch) = setup(4, 2);
        backend.inject_fault(Fault::Submission { nth: 0 });

        let result = mesh_next_batch(&mut backend, &mut batch, &mut table, &mut pool, MeshingOrder::Index);
        assert!(matches!(result, Err(Error::Submission(_))));
        assert!(batch.is_reset());
    }

    #[test]
    fn test_clear_precedes_each_dispatch() {
        let (backend, mut table, mut pool, mut batch) = setup(2, 2);
        let mut backend = Recording::new(backend);
        let _ = mesh_next_batch(&mut backend, &mut batch, &mut table, &mut pool, MeshingOrder::Index)
            .unwrap()
            .unwrap();

        let commands = &backend.submitted[0];
        assert_eq!(commands.len(), 6);
        for slot in 0..2u32 {
            let clear = &commands[slot as usize * 2];
            assert_eq!(
                *clear,
                Command::ClearBuffer {
                    buffer: pool.counters(),
                    offset: pool.layout().counter_offset(slot),
                    size: COUNTER_SIZE,
                }
            );
            let dispatch = &commands[slot as usize * 2 + 1];
            assert!(matches!(dispatch, Command::Dispatch { kernel: Kernel::Meshing, .. }));
        }
        assert!(matches!(commands[4], Command::CopyBuffer { .. }));
        assert!(matches!(commands[5], Command::CopyBuffer { .. }));
    }
}
