//! Region streamer
//!
//! Owns the region table, the staging pool and the dedicated command batch,
//! and drives generation followed by lockstep meshing + materialization until
//! every region is completed. Fully synchronous: each batch is meshed,
//! awaited, materialized and awaited before the next one starts, so the
//! pipeline drains in exactly `ceil(num_regions / staging_slots)` batches.

use super::generation::generate_regions;
use super::materialize::{materialize, MaterializedRegion};
use super::mesh_state::MeshState;
use super::meshing::mesh_next_batch;
use super::region_table::{MeshingOrder, RegionDraw, RegionTable};
use super::staging::StagingPool;
use crate::config::{StreamingConfig, WorldConfig};
use crate::core::Result;
use crate::gpu::{GpuBackend, SyncCommandBatch};

/// One completed meshing + materialization round
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// 0-based batch number
    pub index: u32,
    pub regions: Vec<MaterializedRegion>,
}

impl BatchReport {
    pub fn vertex_count(&self) -> u64 {
        self.regions.iter().map(|r| r.vertex_count as u64).sum()
    }
}

/// Totals over a streaming run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamerStats {
    pub batches: u32,
    pub regions_completed: u32,
    pub empty_regions: u32,
    pub total_vertices: u64,
    pub vertex_bytes: u64,
    /// Largest number of regions awaiting vertex buffers at once
    pub peak_in_flight: u32,
}

/// Drives regions from generation to completed vertex buffers
pub struct RegionStreamer {
    table: RegionTable,
    pool: StagingPool,
    batch: SyncCommandBatch,
    order: MeshingOrder,
    stats: StreamerStats,
}

impl RegionStreamer {
    /// Allocate the region table and staging pool
    pub fn new<B: GpuBackend + ?Sized>(
        backend: &mut B,
        world: &WorldConfig,
        streaming: &StreamingConfig,
    ) -> Result<Self> {
        let table = RegionTable::initialize(backend, world)?;
        let pool = match StagingPool::new(backend, streaming.staging_slots) {
            Ok(pool) => pool,
            Err(e) => {
                let _ = table.release(backend);
                return Err(e);
            }
        };
        Ok(Self {
            table,
            pool,
            batch: SyncCommandBatch::new(streaming.fence_timeout()),
            order: streaming.order,
            stats: StreamerStats::default(),
        })
    }

    /// Build from pre-made parts (custom slot capacity, tests)
    pub fn from_parts(table: RegionTable, pool: StagingPool, batch: SyncCommandBatch, order: MeshingOrder) -> Self {
        Self {
            table,
            pool,
            batch,
            order,
            stats: StreamerStats::default(),
        }
    }

    /// Fill every region volume; done once before any meshing
    pub fn generate<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        generate_regions(backend, &mut self.batch, &mut self.table)?;
        Ok(())
    }

    /// Mesh and materialize one batch; `None` once drained
    pub fn step<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<Option<BatchReport>> {
        let Some(meshed) = mesh_next_batch(backend, &mut self.batch, &mut self.table, &mut self.pool, self.order)?
        else {
            return Ok(None);
        };

        let in_flight = self.table.count_in(MeshState::AwaitVertexBufferCreation) as u32;
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(in_flight);

        let regions = materialize(backend, &mut self.batch, &mut self.table, &mut self.pool, meshed)?;
        let report = BatchReport {
            index: self.stats.batches,
            regions,
        };

        self.stats.batches += 1;
        for region in &report.regions {
            self.stats.regions_completed += 1;
            self.stats.total_vertices += region.vertex_count as u64;
            self.stats.vertex_bytes += region.byte_size();
            if region.vertex_count == 0 {
                self.stats.empty_regions += 1;
            }
        }

        log::debug!(
            "Batch {}: {} regions, {} vertices ({}/{} completed)",
            report.index,
            report.regions.len(),
            report.vertex_count(),
            self.table.count_in(MeshState::Completed),
            self.table.len()
        );
        Ok(Some(report))
    }

    /// Generate if needed, then step until every region is completed
    pub fn run_to_completion<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<StreamerStats> {
        if !self.table.is_generated() {
            self.generate(backend)?;
        }
        while self.step(backend)?.is_some() {}

        log::info!(
            "Streaming complete: {} regions in {} batches, {} vertices ({:.1} MB)",
            self.stats.regions_completed,
            self.stats.batches,
            self.stats.total_vertices,
            self.stats.vertex_bytes as f64 / (1024.0 * 1024.0)
        );
        Ok(self.stats)
    }

    pub fn is_drained(&self) -> bool {
        self.table.is_complete()
    }

    pub fn stats(&self) -> StreamerStats {
        self.stats
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn pool(&self) -> &StagingPool {
        &self.pool
    }

    /// Regions ready to draw
    pub fn draw_list(&self) -> impl Iterator<Item = RegionDraw> + '_ {
        self.table.draw_list()
    }

    /// Free the staging pool, then every region resource
    pub fn release<B: GpuBackend + ?Sized>(self, backend: &mut B) -> Result<()> {
        let pool_result = self.pool.release(backend);
        let table_result = self.table.release(backend);
        pool_result.and(table_result)
    }
}

/// Batches needed to drain `regions` with `slots` staging slots
pub fn expected_batches(regions: u32, slots: u32) -> u32 {
    regions.div_ceil(slots.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::gpu::{Fault, SoftwareBackend};
    use crate::streaming::test_support::Recording;
    use crate::voxel::{voxel_index, RegionId, VoxelType, REGION_VOLUME};

    fn configs(regions: u32, slots: u32) -> (WorldConfig, StreamingConfig) {
        (
            WorldConfig { num_regions: regions, grid_width: 16, seed: 1 },
            StreamingConfig { staging_slots: slots, ..Default::default() },
        )
    }

    fn streamer(backend: &mut SoftwareBackend, regions: u32, slots: u32) -> RegionStreamer {
        let (world, streaming) = configs(regions, slots);
        RegionStreamer::new(backend, &world, &streaming).unwrap()
    }

    #[test]
    fn test_ten_regions_eight_slots() {
        let mut backend = SoftwareBackend::new();
        let mut streamer = streamer(&mut backend, 10, 8);
        streamer.generate(&mut backend).unwrap();

        let first = streamer.step(&mut backend).unwrap().unwrap();
        let meshed: Vec<_> = first.regions.iter().map(|r| (r.slot, r.id.0)).collect();
        assert_eq!(meshed, (0..8).map(|i| (i, i)).collect::<Vec<_>>());

        let second = streamer.step(&mut backend).unwrap().unwrap();
        let meshed: Vec<_> = second.regions.iter().map(|r| (r.slot, r.id.0)).collect();
        assert_eq!(meshed, vec![(0, 8), (1, 9)]);

        assert!(streamer.step(&mut backend).unwrap().is_none());
        assert!(streamer.is_drained());
        assert_eq!(streamer.table().count_in(MeshState::Completed), 10);
        assert_eq!(streamer.stats().batches, 2);
    }

    #[test]
    fn test_drains_in_ceil_batches() {
        for (regions, slots) in [(1, 8), (8, 8), (9, 8), (16, 8), (17, 4), (5, 1)] {
            let mut backend = SoftwareBackend::new();
            let mut streamer = streamer(&mut backend, regions, slots);
            let stats = streamer.run_to_completion(&mut backend).unwrap();
            assert_eq!(stats.batches, expected_batches(regions, slots), "{regions} regions / {slots} slots");
            assert_eq!(stats.regions_completed, regions);
            assert!(streamer.is_drained());
        }
    }

    #[test]
    fn test_bounded_concurrency() {
        let mut backend = SoftwareBackend::new();
        let mut streamer = streamer(&mut backend, 20, 3);
        streamer.generate(&mut backend).unwrap();

        while let Some(report) = streamer.step(&mut backend).unwrap() {
            assert!(report.regions.len() <= 3);
            assert_eq!(streamer.table().count_in(MeshState::AwaitVertexBufferCreation), 0);
            assert_eq!(streamer.pool().leased(), 0);
        }
        assert!(streamer.stats().peak_in_flight <= 3);
        assert_eq!(streamer.stats().peak_in_flight, 3);
    }

    #[test]
    fn test_slot_isolation() {
        // Region 0 is dense, region 1 empty; both pass through slot 0
        let mut backend = SoftwareBackend::new();
        let mut streamer = streamer(&mut backend, 2, 1);

        let mut checker = vec![VoxelType::Air.code(); REGION_VOLUME];
        for z in (0..16).step_by(2) {
            for y in (0..16).step_by(2) {
                for x in (0..16).step_by(2) {
                    checker[voxel_index(x, y, z)] = VoxelType::Stone.code();
                }
            }
        }
        let dense = streamer.table().get(RegionId(0)).unwrap().volume();
        backend.write_volume(dense, &checker).unwrap();

        let first = streamer.step(&mut backend).unwrap().unwrap();
        assert!(first.regions[0].vertex_count > 10_000);
        let second = streamer.step(&mut backend).unwrap().unwrap();
        assert_eq!(second.regions[0].slot, 0);
        assert_eq!(second.regions[0].vertex_count, 0);
        assert_eq!(streamer.stats().empty_regions, 1);
    }

    #[test]
    fn test_monotonic_state_per_region() {
        let mut backend = SoftwareBackend::new();
        let mut streamer = streamer(&mut backend, 6, 4);
        streamer.generate(&mut backend).unwrap();

        let mut history: Vec<Vec<MeshState>> = streamer.table().records().map(|r| vec![r.state()]).collect();
        while streamer.step(&mut backend).unwrap().is_some() {
            for (seen, record) in history.iter_mut().zip(streamer.table().records()) {
                if seen.last() != Some(&record.state()) {
                    seen.push(record.state());
                }
            }
        }
        for seen in history {
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
            assert_eq!(seen.first(), Some(&MeshState::AwaitMeshingCompute));
            assert_eq!(seen.last(), Some(&MeshState::Completed));
        }
    }

    #[test]
    fn test_generated_terrain_is_drawn() {
        let mut backend = SoftwareBackend::new();
        let mut streamer = streamer(&mut backend, 4, 2);
        let stats = streamer.run_to_completion(&mut backend).unwrap();

        let draws: Vec<_> = streamer.draw_list().collect();
        assert_eq!(draws.len(), 4);
        assert_eq!(draws.iter().map(|d| d.vertex_count as u64).sum::<u64>(), stats.total_vertices);
        for draw in draws {
            let size = backend.buffer_size(draw.vertex_buffer).unwrap();
            assert_eq!(size, draw.vertex_count as u64 * 32);
        }
    }

    #[test]
    fn test_nearest_first_order() {
        let mut backend = SoftwareBackend::new();
        let (world, mut streaming) = configs(8, 2);
        streaming.order = MeshingOrder::NearestFirst { origin: RegionId(7).center(16).to_array() };
        let mut streamer = RegionStreamer::new(&mut backend, &world, &streaming).unwrap();
        streamer.generate(&mut backend).unwrap();

        let first = streamer.step(&mut backend).unwrap().unwrap();
        assert_eq!(first.regions[0].id, RegionId(7));
        assert_eq!(first.regions[1].id, RegionId(6));
    }

    #[test]
    fn test_waits_use_configured_timeout() {
        let (world, mut streaming) = configs(3, 2);
        streaming.fence_timeout_ms = Some(250);
        let mut backend = Recording::new(SoftwareBackend::new());
        let mut streamer = RegionStreamer::new(&mut backend, &world, &streaming).unwrap();
        streamer.run_to_completion(&mut backend).unwrap();

        let configured = Some(std::time::Duration::from_millis(250));
        assert!(!backend.waits.is_empty());
        assert!(backend.waits.iter().all(|w| *w == configured));
        // One count readback per meshing batch
        assert_eq!(backend.reads.len(), 2);
        assert!(backend.reads.iter().all(|r| *r == configured));
        // Generation + 2 x (meshing + copies)
        assert_eq!(backend.submitted.len(), 5);
    }

    #[test]
    fn test_failure_during_meshing_is_fatal() {
        let mut backend = SoftwareBackend::new();
        let mut streamer = streamer(&mut backend, 5, 2);
        // Submissions: generation, mesh 1, copy 1, mesh 2 <- fails
        backend.inject_fault(Fault::Submission { nth: 3 });

        let result = streamer.run_to_completion(&mut backend);
        assert!(matches!(result, Err(Error::Submission(_))));
        assert_eq!(streamer.table().count_in(MeshState::Completed), 2);
    }

    #[test]
    fn test_release_frees_all_resources() {
        let mut backend = SoftwareBackend::new();
        let mut streamer = streamer(&mut backend, 5, 2);
        streamer.run_to_completion(&mut backend).unwrap();
        streamer.release(&mut backend).unwrap();
        assert_eq!(backend.live_resources(), Default::default());
    }

    #[test]
    fn test_pool_failure_releases_table() {
        let mut backend = SoftwareBackend::new();
        // 3 regions x 2 allocations, then staging counters, then staging vertices
        backend.inject_fault(Fault::Allocation { nth: 7 });
        let (world, streaming) = configs(3, 2);
        assert!(RegionStreamer::new(&mut backend, &world, &streaming).is_err());
        assert_eq!(backend.live_resources(), Default::default());
    }

    #[test]
    fn test_slot_overflow_is_readback_failure() {
        let mut backend = SoftwareBackend::new();
        let (world, _) = configs(2, 2);
        let table = RegionTable::initialize(&mut backend, &world).unwrap();
        // Generated terrain has far more than one voxel's worth of faces
        let pool = StagingPool::with_capacity(&mut backend, 2, 36).unwrap();
        let mut streamer =
            RegionStreamer::from_parts(table, pool, SyncCommandBatch::new(None), MeshingOrder::Index);

        let result = streamer.run_to_completion(&mut backend);
        assert!(matches!(result, Err(Error::Readback(_))));
        assert_eq!(streamer.table().count_in(MeshState::Completed), 0);
    }

    #[test]
    fn test_expected_batches() {
        assert_eq!(expected_batches(16, 8), 2);
        assert_eq!(expected_batches(17, 8), 3);
        assert_eq!(expected_batches(0, 8), 0);
        assert_eq!(expected_batches(3, 0), 3);
    }
}
