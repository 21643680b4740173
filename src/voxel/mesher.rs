//! Face-culling region mesher
//!
//! CPU mirror of `shaders/region_meshing.wgsl`. Every solid voxel emits two
//! triangles for each face whose neighbour is air. Neighbours outside the
//! region are read clamped to the region edge, so region boundary faces are
//! culled.

use bytemuck::{Pod, Zeroable};

use super::{voxel_index, VoxelType, REGION_SIZE, REGION_VOLUME};

/// Vertices emitted per visible face
pub const VERTICES_PER_FACE: u32 = 6;

/// Vertices a fully exposed voxel would emit
pub const VERTICES_PER_VOXEL: u32 = 6 * VERTICES_PER_FACE;

/// Upper bound on the vertex count of one region
pub const MAX_VERTICES_PER_REGION: u32 = VERTICES_PER_VOXEL * REGION_VOLUME as u32;

/// Cube faces in shader order
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Face {
    PosX = 0,
    NegX = 1,
    PosY = 2,
    NegY = 3,
    PosZ = 4,
    NegZ = 5,
}

impl Face {
    pub const ALL: [Face; 6] = [Face::PosX, Face::NegX, Face::PosY, Face::NegY, Face::PosZ, Face::NegZ];

    pub fn normal(self) -> [i32; 3] {
        match self {
            Face::PosX => [1, 0, 0],
            Face::NegX => [-1, 0, 0],
            Face::PosY => [0, 1, 0],
            Face::NegY => [0, -1, 0],
            Face::PosZ => [0, 0, 1],
            Face::NegZ => [0, 0, -1],
        }
    }

    /// Quad corners as unit-cube offsets, counter-clockwise seen from outside
    fn corners(self) -> [[f32; 3]; 4] {
        match self {
            Face::PosX => [[1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [1.0, 1.0, 1.0], [1.0, 0.0, 1.0]],
            Face::NegX => [[0.0, 0.0, 1.0], [0.0, 1.0, 1.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]],
            Face::PosY => [[0.0, 1.0, 0.0], [0.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 0.0]],
            Face::NegY => [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0, 1.0], [0.0, 0.0, 1.0]],
            Face::PosZ => [[1.0, 0.0, 1.0], [1.0, 1.0, 1.0], [0.0, 1.0, 1.0], [0.0, 0.0, 1.0]],
            Face::NegZ => [[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0], [1.0, 0.0, 0.0]],
        }
    }
}

/// Quad corner order for the two triangles of a face
const QUAD_TRIANGLES: [usize; 6] = [0, 1, 2, 0, 2, 3];

/// Vertex produced by the meshing stage (must match `RegionVertex` in WGSL)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RegionVertex {
    /// Region-local position (12 bytes, offset 0)
    pub position: [f32; 3],
    /// Face index (4 bytes, offset 12)
    pub face: u32,
    /// Voxel type code (4 bytes, offset 16)
    pub voxel_type: u32,
    /// Padding to the 16-byte struct alignment of vec3 (12 bytes, offset 20)
    pub _pad: [u32; 3],
}

impl RegionVertex {
    /// Size in bytes of one vertex in staging and vertex buffers
    pub const SIZE: u64 = std::mem::size_of::<RegionVertex>() as u64;

    /// Vertex buffer layout for the render pipeline
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        const ATTRIBUTES: [wgpu::VertexAttribute; 3] = wgpu::vertex_attr_array![
            0 => Float32x3,
            1 => Uint32,
            2 => Uint32,
        ];
        wgpu::VertexBufferLayout {
            array_stride: RegionVertex::SIZE,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &ATTRIBUTES,
        }
    }
}

#[inline]
fn sample_clamped(voxels: &[u32], x: i32, y: i32, z: i32) -> u32 {
    let max = REGION_SIZE as i32 - 1;
    voxels[voxel_index(
        x.clamp(0, max) as u32,
        y.clamp(0, max) as u32,
        z.clamp(0, max) as u32,
    )]
}

/// Faces of voxel (x, y, z) that face air
pub fn visible_faces(voxels: &[u32], x: u32, y: u32, z: u32) -> impl Iterator<Item = Face> + '_ {
    let solid = VoxelType::from_code(voxels[voxel_index(x, y, z)]).is_solid();
    Face::ALL.into_iter().filter(move |face| {
        if !solid {
            return false;
        }
        let [dx, dy, dz] = face.normal();
        let neighbour = sample_clamped(voxels, x as i32 + dx, y as i32 + dy, z as i32 + dz);
        !VoxelType::from_code(neighbour).is_solid()
    })
}

/// Count the vertices the meshing shader would emit for a region
pub fn count_vertices(voxels: &[u32]) -> u32 {
    let mut count = 0;
    for z in 0..REGION_SIZE {
        for y in 0..REGION_SIZE {
            for x in 0..REGION_SIZE {
                count += visible_faces(voxels, x, y, z).count() as u32 * VERTICES_PER_FACE;
            }
        }
    }
    count
}

/// Append the vertices of one voxel to `out`
pub fn emit_voxel(voxels: &[u32], x: u32, y: u32, z: u32, out: &mut Vec<RegionVertex>) {
    let voxel_type = voxels[voxel_index(x, y, z)];
    let base = [x as f32, y as f32, z as f32];
    for face in visible_faces(voxels, x, y, z) {
        let corners = face.corners();
        for corner in QUAD_TRIANGLES {
            let c = corners[corner];
            out.push(RegionVertex {
                position: [base[0] + c[0], base[1] + c[1], base[2] + c[2]],
                face: face as u32,
                voxel_type,
                _pad: [0; 3],
            });
        }
    }
}

/// Mesh a full region volume
pub fn mesh_region(voxels: &[u32]) -> Vec<RegionVertex> {
    debug_assert_eq!(voxels.len(), REGION_VOLUME);
    let mut out = Vec::new();
    for z in 0..REGION_SIZE {
        for y in 0..REGION_SIZE {
            for x in 0..REGION_SIZE {
                emit_voxel(voxels, x, y, z, &mut out);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> Vec<u32> {
        vec![VoxelType::Air.code(); REGION_VOLUME]
    }

    #[test]
    fn test_vertex_size() {
        assert_eq!(RegionVertex::SIZE, 32);
    }

    #[test]
    fn test_air_region_is_empty() {
        assert_eq!(count_vertices(&empty()), 0);
        assert!(mesh_region(&empty()).is_empty());
    }

    #[test]
    fn test_single_voxel() {
        let mut voxels = empty();
        voxels[voxel_index(4, 4, 4)] = VoxelType::Stone.code();
        let mesh = mesh_region(&voxels);
        assert_eq!(mesh.len(), 36);
        assert_eq!(count_vertices(&voxels), 36);
        assert!(mesh.iter().all(|v| v.voxel_type == VoxelType::Stone.code()));
    }

    #[test]
    fn test_adjacent_voxels_share_hidden_faces() {
        let mut voxels = empty();
        voxels[voxel_index(4, 4, 4)] = VoxelType::Dirt.code();
        voxels[voxel_index(5, 4, 4)] = VoxelType::Dirt.code();
        assert_eq!(count_vertices(&voxels), 60);
    }

    #[test]
    fn test_boundary_faces_culled() {
        let mut voxels = empty();
        voxels[voxel_index(0, 4, 4)] = VoxelType::Grass.code();
        // -X neighbour clamps onto the voxel itself
        assert_eq!(count_vertices(&voxels), 30);

        let solid = vec![VoxelType::Stone.code(); REGION_VOLUME];
        assert_eq!(count_vertices(&solid), 0);
    }

    #[test]
    fn test_positions_within_region() {
        let voxels = super::super::terrain::generate_region(glam::IVec3::ZERO, 9);
        let mesh = mesh_region(&voxels);
        assert!(!mesh.is_empty());
        assert!(mesh.len() as u32 <= MAX_VERTICES_PER_REGION);
        for v in &mesh {
            for c in v.position {
                assert!((0.0..=REGION_SIZE as f32).contains(&c));
            }
        }
    }
}
