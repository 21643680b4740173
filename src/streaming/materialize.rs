//! Materialization stage: turn a meshed batch into exactly-sized vertex buffers

use std::time::Duration;

use super::meshing::MeshedBatch;
use super::region_table::RegionTable;
use super::staging::{StagingPool, COUNTER_SIZE};
use crate::core::{Error, Result};
use crate::gpu::{BufferDesc, BufferHandle, BufferKind, GpuBackend, SyncCommandBatch};
use crate::voxel::{RegionId, RegionVertex};

/// Outcome for one region of a materialized batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializedRegion {
    pub id: RegionId,
    pub slot: u32,
    pub vertex_count: u32,
    /// `None` for regions without geometry
    pub vertex_buffer: Option<BufferHandle>,
}

impl MaterializedRegion {
    pub fn byte_size(&self) -> u64 {
        self.vertex_count as u64 * RegionVertex::SIZE
    }
}

/// Read back slot counts for a meshed batch, in pairing order
///
/// `timeout` bounds the readback map like any other streaming wait.
pub fn read_counts<B: GpuBackend + ?Sized>(
    backend: &mut B,
    pool: &StagingPool,
    meshed: &MeshedBatch,
    timeout: Option<Duration>,
) -> Result<Vec<u32>> {
    let used = meshed.pairs().iter().map(|&(slot, _)| slot + 1).max().unwrap_or(0);
    if used == 0 {
        return Ok(Vec::new());
    }
    let bytes = backend.read_buffer(pool.readback(), 0, used as u64 * COUNTER_SIZE, timeout)?;
    let capacity = pool.layout().slot_capacity;

    meshed
        .pairs()
        .iter()
        .map(|&(slot, id)| {
            let at = pool.layout().readback_offset(slot) as usize;
            let count = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            if count > capacity {
                return Err(Error::Readback(format!(
                    "{id} in slot {slot} reported {count} vertices, slot holds {capacity}"
                )));
            }
            log::trace!("Slot {slot}: {id} has {count} vertices");
            Ok(count)
        })
        .collect()
}

/// Allocate, copy and complete every region of `meshed`, then free its slots
///
/// Waits for the meshing submission, reads the counts, allocates one vertex
/// buffer of exactly `count * vertex_size` bytes per non-empty region and
/// copies out of the region's staging range. The copies are awaited before
/// any region is marked completed. On failure the freshly allocated buffers
/// are released and the error returned.
pub fn materialize<B: GpuBackend + ?Sized>(
    backend: &mut B,
    batch: &mut SyncCommandBatch,
    table: &mut RegionTable,
    pool: &mut StagingPool,
    meshed: MeshedBatch,
) -> Result<Vec<MaterializedRegion>> {
    if let Some(submission) = meshed.submission() {
        backend.wait(submission, batch.timeout())?;
    }
    let counts = read_counts(backend, pool, &meshed, batch.timeout())?;
    let pairs = meshed.into_pairs();

    let mut created: Vec<BufferHandle> = Vec::new();
    let recorded = batch.run(backend, |backend, rec| {
        let layout = *pool.layout();
        let mut regions = Vec::with_capacity(pairs.len());

        for (&(slot, id), &count) in pairs.iter().zip(&counts) {
            let vertex_buffer = if count == 0 {
                None
            } else {
                let size = count as u64 * RegionVertex::SIZE;
                let buffer = backend.create_buffer(&BufferDesc {
                    label: format!("region_vertices_{}", id.0),
                    size,
                    kind: BufferKind::Vertex,
                })?;
                created.push(buffer);
                rec.copy_buffer(pool.vertices(), layout.vertex_offset(slot), buffer, 0, size);
                Some(buffer)
            };
            regions.push(MaterializedRegion { id, slot, vertex_count: count, vertex_buffer });
        }
        Ok(regions)
    });

    let regions = match recorded {
        Ok(regions) => regions,
        Err(e) => {
            for buffer in created {
                let _ = backend.destroy_buffer(buffer);
            }
            return Err(e);
        }
    };

    for (at, region) in regions.iter().enumerate() {
        if let Err(e) = table.complete(region.id, region.vertex_buffer, region.vertex_count) {
            // Buffers not yet attached to a region would leak
            for rest in &regions[at..] {
                if let Some(buffer) = rest.vertex_buffer {
                    let _ = backend.destroy_buffer(buffer);
                }
                pool.release_slot(rest.slot);
            }
            return Err(e);
        }
        pool.release_slot(region.slot);
    }

    log::debug!(
        "Materialized {} regions, {} vertices",
        regions.len(),
        regions.iter().map(|r| r.vertex_count as u64).sum::<u64>()
    );
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::gpu::{Fault, SoftwareBackend};
    use crate::streaming::meshing::mesh_next_batch;
    use crate::streaming::{MeshState, MeshingOrder};
    use crate::voxel::{voxel_index, VoxelType, REGION_VOLUME};

    struct Setup {
        backend: SoftwareBackend,
        table: RegionTable,
        pool: StagingPool,
        batch: SyncCommandBatch,
    }

    fn setup(regions: u32, slots: u32) -> Setup {
        let mut backend = SoftwareBackend::new();
        let world = WorldConfig { num_regions: regions, grid_width: 16, seed: 0 };
        let table = RegionTable::initialize(&mut backend, &world).unwrap();
        let pool = StagingPool::new(&mut backend, slots).unwrap();
        Setup { backend, table, pool, batch: SyncCommandBatch::new(None) }
    }

    fn fill(s: &mut Setup, id: RegionId, solid: &[(u32, u32, u32)]) {
        let mut texels = vec![VoxelType::Air.code(); REGION_VOLUME];
        for &(x, y, z) in solid {
            texels[voxel_index(x, y, z)] = VoxelType::Stone.code();
        }
        let volume = s.table.get(id).unwrap().volume();
        s.backend.write_volume(volume, &texels).unwrap();
    }

    fn mesh(s: &mut Setup) -> MeshedBatch {
        mesh_next_batch(&mut s.backend, &mut s.batch, &mut s.table, &mut s.pool, MeshingOrder::Index)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_exact_sizing_and_contents() {
        let mut s = setup(2, 2);
        fill(&mut s, RegionId(0), &[(1, 1, 1)]);
        fill(&mut s, RegionId(1), &[(1, 1, 1), (2, 1, 1)]);

        let meshed = mesh(&mut s);
        let regions = materialize(&mut s.backend, &mut s.batch, &mut s.table, &mut s.pool, meshed).unwrap();

        assert_eq!(regions[0].vertex_count, 36);
        assert_eq!(regions[1].vertex_count, 60);
        for region in &regions {
            let buffer = region.vertex_buffer.unwrap();
            assert_eq!(s.backend.buffer_size(buffer).unwrap(), region.vertex_count as u64 * 32);
            assert_eq!(s.table.state(region.id).unwrap(), MeshState::Completed);
            assert_eq!(s.table.get(region.id).unwrap().vertex_buffer(), Some(buffer));
        }

        let texels = s.backend.volume_texels(s.table.get(RegionId(1)).unwrap().volume()).unwrap().to_vec();
        let expected = crate::voxel::mesher::mesh_region(&texels);
        assert_eq!(s.backend.vertices(regions[1].vertex_buffer.unwrap()).unwrap(), expected);
        assert_eq!(s.pool.leased(), 0);
    }

    #[test]
    fn test_zero_vertex_region_completes_without_buffer() {
        let mut s = setup(1, 1);
        let before = s.backend.live_resources().buffers;

        let meshed = mesh(&mut s);
        let regions = materialize(&mut s.backend, &mut s.batch, &mut s.table, &mut s.pool, meshed).unwrap();

        assert_eq!(regions[0].vertex_count, 0);
        assert_eq!(regions[0].vertex_buffer, None);
        assert_eq!(s.table.state(RegionId(0)).unwrap(), MeshState::Completed);
        assert_eq!(s.table.draw_list().count(), 0);
        assert_eq!(s.backend.live_resources().buffers, before);
    }

    #[test]
    fn test_corrupt_count_is_readback_failure() {
        let mut s = setup(1, 1);
        let meshed = mesh(&mut s);
        let bogus = (s.pool.layout().slot_capacity + 1).to_le_bytes();
        s.backend.write_buffer(s.pool.readback(), 0, &bogus).unwrap();

        let result = materialize(&mut s.backend, &mut s.batch, &mut s.table, &mut s.pool, meshed);
        assert!(matches!(result, Err(Error::Readback(_))));
    }

    #[test]
    fn test_copy_submission_failure_releases_new_buffers() {
        let mut s = setup(2, 2);
        fill(&mut s, RegionId(0), &[(3, 3, 3)]);
        fill(&mut s, RegionId(1), &[(3, 3, 3)]);
        let meshed = mesh(&mut s);
        let before = s.backend.live_resources().buffers;

        let nth = s.backend.submissions();
        s.backend.inject_fault(Fault::Submission { nth });
        let result = materialize(&mut s.backend, &mut s.batch, &mut s.table, &mut s.pool, meshed);

        assert!(matches!(result, Err(Error::Submission(_))));
        assert_eq!(s.backend.live_resources().buffers, before);
        assert_eq!(s.table.count_in(MeshState::Completed), 0);
    }

    #[test]
    fn test_failed_completion_destroys_unattached_buffers() {
        let mut s = setup(2, 2);
        fill(&mut s, RegionId(0), &[(3, 3, 3)]);
        fill(&mut s, RegionId(1), &[(3, 3, 3)]);
        let meshed = mesh(&mut s);
        let before = s.backend.live_resources().buffers;
        // Region 1 reaches its terminal state behind the stage's back
        s.table.complete(RegionId(1), None, 0).unwrap();

        let result = materialize(&mut s.backend, &mut s.batch, &mut s.table, &mut s.pool, meshed);

        assert!(matches!(result, Err(Error::InvalidTransition { region: 1, .. })));
        let attached = s.table.get(RegionId(0)).unwrap().vertex_buffer().unwrap();
        assert_eq!(s.backend.buffer_size(attached).unwrap(), 36 * 32);
        assert_eq!(s.backend.live_resources().buffers, before + 1);
        assert_eq!(s.table.get(RegionId(1)).unwrap().vertex_buffer(), None);
        assert_eq!(s.pool.leased(), 0);
    }

    #[test]
    fn test_readback_failure_propagates() {
        let mut s = setup(1, 1);
        let meshed = mesh(&mut s);
        s.backend.inject_fault(Fault::Readback);

        let result = materialize(&mut s.backend, &mut s.batch, &mut s.table, &mut s.pool, meshed);
        assert!(matches!(result, Err(Error::Readback(_))));
    }
}
