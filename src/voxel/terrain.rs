//! Procedural heightmap terrain
//!
//! CPU mirror of `shaders/region_generation.wgsl`. Both use the same integer
//! hash so the software backend produces the same voxels as the GPU.

use glam::IVec3;
use rayon::prelude::*;

use super::{voxel_index, VoxelType, REGION_SIZE, REGION_VOLUME};

/// Lowest column height in voxels
pub const MIN_HEIGHT: u32 = 2;
/// Column heights lie in `[MIN_HEIGHT, MIN_HEIGHT + HEIGHT_RANGE)`
pub const HEIGHT_RANGE: u32 = 12;
/// Dirt layer thickness under the grass cap
pub const DIRT_DEPTH: u32 = 3;

#[inline]
fn hash(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

#[inline]
fn lattice(ix: i32, iz: i32, seed: u32) -> f32 {
    let h = hash(ix as u32 ^ hash(iz as u32 ^ hash(seed)));
    h as f32 / u32::MAX as f32
}

/// Smoothed 2D value noise in `[0, 1]`
pub fn value_noise(x: f32, z: f32, seed: u32) -> f32 {
    let (fx, fz) = (x.floor(), z.floor());
    let (ix, iz) = (fx as i32, fz as i32);
    let (tx, tz) = (x - fx, z - fz);
    let (sx, sz) = (tx * tx * (3.0 - 2.0 * tx), tz * tz * (3.0 - 2.0 * tz));

    let a = lattice(ix, iz, seed);
    let b = lattice(ix + 1, iz, seed);
    let c = lattice(ix, iz + 1, seed);
    let d = lattice(ix + 1, iz + 1, seed);

    let top = a + (b - a) * sx;
    let bottom = c + (d - c) * sx;
    top + (bottom - top) * sz
}

/// Terrain column height at a world x/z coordinate
pub fn column_height(wx: i32, wz: i32, seed: u32) -> u32 {
    let (x, z) = (wx as f32, wz as f32);
    let n = 0.65 * value_noise(x / 24.0, z / 24.0, seed)
        + 0.35 * value_noise(x / 8.0, z / 8.0, seed.wrapping_add(1));
    let h = MIN_HEIGHT + (n * HEIGHT_RANGE as f32) as u32;
    h.min(MIN_HEIGHT + HEIGHT_RANGE - 1)
}

/// Voxel type at height `y` of a column of height `height`
pub fn voxel_at(y: u32, height: u32) -> VoxelType {
    if y >= height {
        VoxelType::Air
    } else if y + 1 == height {
        VoxelType::Grass
    } else if y + 1 + DIRT_DEPTH >= height {
        VoxelType::Dirt
    } else {
        VoxelType::Stone
    }
}

/// Fill a region volume the way the generation shader does
pub fn generate_region(origin: IVec3, seed: u32) -> Vec<u32> {
    let mut voxels = vec![0u32; REGION_VOLUME];
    let slice = (REGION_SIZE * REGION_SIZE) as usize;

    voxels
        .par_chunks_mut(slice)
        .enumerate()
        .for_each(|(z, layer)| {
            let z = z as u32;
            for x in 0..REGION_SIZE {
                let height = column_height(origin.x + x as i32, origin.z + z as i32, seed);
                for y in 0..REGION_SIZE {
                    let wy = (origin.y + y as i32).max(0) as u32;
                    layer[voxel_index(x, y, 0)] = voxel_at(wy, height).code();
                }
            }
        });

    voxels
}
