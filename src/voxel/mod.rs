//! Voxel data: type codes, region geometry and CPU reference algorithms

pub mod region;
pub mod terrain;
pub mod mesher;

pub use region::{RegionId, RegionUniform};
pub use mesher::{RegionVertex, MAX_VERTICES_PER_REGION, VERTICES_PER_FACE};

/// Edge length of a cubic region in voxels
pub const REGION_SIZE: u32 = 16;

/// Voxels per region
pub const REGION_VOLUME: usize = (REGION_SIZE * REGION_SIZE * REGION_SIZE) as usize;

/// Compute workgroup edge used by the generation and meshing shaders
pub const WORKGROUP_SIZE: u32 = 2;

/// Workgroups per axis needed to cover a region with one invocation per voxel
pub const REGION_WORKGROUPS: [u32; 3] = [
    REGION_SIZE / WORKGROUP_SIZE,
    REGION_SIZE / WORKGROUP_SIZE,
    REGION_SIZE / WORKGROUP_SIZE,
];

/// Voxel type codes stored in region volumes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoxelType {
    Air = 0,
    Grass = 1,
    Stone = 2,
    Dirt = 3,
}

impl VoxelType {
    /// Decode a raw volume value; unknown codes are treated as stone
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => VoxelType::Air,
            1 => VoxelType::Grass,
            3 => VoxelType::Dirt,
            _ => VoxelType::Stone,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_solid(self) -> bool {
        self != VoxelType::Air
    }
}

/// Linear index of a voxel inside a region volume (x fastest, then y, then z)
#[inline]
pub fn voxel_index(x: u32, y: u32, z: u32) -> usize {
    (x + y * REGION_SIZE + z * REGION_SIZE * REGION_SIZE) as usize
}
