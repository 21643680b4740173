//! Render pipelines

pub mod region_render;

pub use region_render::{RegionRenderPipeline, CLEAR_COLOR};
