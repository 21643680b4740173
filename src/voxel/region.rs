//! Region identity and placement

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Vec3};

use super::REGION_SIZE;

/// Stable index of a region in the region table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u32);

impl RegionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Grid position of this region's minimum corner
    ///
    /// Regions are laid out in rows of `grid_width` along +Z, rows stepping along +X.
    pub fn position(self, grid_width: u32) -> IVec3 {
        let size = REGION_SIZE as i32;
        let grid_width = grid_width.max(1);
        IVec3::new(
            size * (self.0 / grid_width) as i32,
            0,
            size * (self.0 % grid_width) as i32,
        )
    }

    /// World-space centre of the region
    pub fn center(self, grid_width: u32) -> Vec3 {
        self.position(grid_width).as_vec3() + Vec3::splat(REGION_SIZE as f32 * 0.5)
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Per-region uniform data (must match `RegionUniform` in the WGSL programs)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct RegionUniform {
    /// Minimum corner in voxels (12 bytes, offset 0)
    pub position: [i32; 3],
    /// Terrain seed (4 bytes, offset 12)
    pub seed: u32,
}

impl RegionUniform {
    pub fn new(id: RegionId, grid_width: u32, seed: u32) -> Self {
        Self {
            position: id.position(grid_width).to_array(),
            seed,
        }
    }
}
