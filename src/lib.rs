//! voxmesh - GPU voxel region meshing and streaming

pub mod core;
pub mod config;
pub mod voxel;
pub mod gpu;
pub mod streaming;
pub mod render;
