//! Region meshing pipeline
//!
//! Generation fills each region volume, meshing writes faces into a fixed
//! pool of staging slots, and materialization copies each slot's vertices
//! into an exactly-sized per-region buffer.

pub mod generation;
pub mod materialize;
pub mod mesh_state;
pub mod meshing;
pub mod pipeline;
pub mod region_table;
pub mod staging;

#[cfg(test)]
mod test_support;

pub use generation::generate_regions;
pub use materialize::{materialize, read_counts, MaterializedRegion};
pub use mesh_state::MeshState;
pub use meshing::{mesh_next_batch, MeshedBatch};
pub use pipeline::{expected_batches, BatchReport, RegionStreamer, StreamerStats};
pub use region_table::{MeshingOrder, RegionDraw, RegionRecord, RegionTable};
pub use staging::{StagingLayout, StagingPool, COUNTER_SIZE};
