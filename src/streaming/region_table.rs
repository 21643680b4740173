//! Region table
//!
//! Owns every per-region resource (uniform buffer, voxel volume, binding
//! descriptors, materialized vertex buffer) and the authoritative mesh state.
//! Regions live in one contiguous arena indexed by [`RegionId`].

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::mesh_state::MeshState;
use crate::config::WorldConfig;
use crate::core::{Error, Result};
use crate::gpu::{
    BindingDesc, BindingHandle, BindingLayout, BindingResource, BufferDesc, BufferHandle,
    BufferKind, GpuBackend, VolumeAccess, VolumeDesc, VolumeHandle,
};
use crate::voxel::{RegionId, RegionUniform, REGION_SIZE};

/// Order pending regions are handed to the meshing stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MeshingOrder {
    /// Ascending region index
    #[default]
    Index,
    /// Closest region centre first, ties broken by index
    NearestFirst { origin: [f32; 3] },
}

/// One region's resources and state
#[derive(Debug)]
pub struct RegionRecord {
    pub id: RegionId,
    pub uniform: RegionUniform,
    uniform_buffer: BufferHandle,
    volume: VolumeHandle,
    generation_binding: BindingHandle,
    meshing_binding: BindingHandle,
    state: MeshState,
    vertex_buffer: Option<BufferHandle>,
    vertex_count: u32,
}

impl RegionRecord {
    pub fn state(&self) -> MeshState {
        self.state
    }

    pub fn uniform_buffer(&self) -> BufferHandle {
        self.uniform_buffer
    }

    pub fn volume(&self) -> VolumeHandle {
        self.volume
    }

    /// Uniform + writable volume, for the generation kernel
    pub fn generation_binding(&self) -> BindingHandle {
        self.generation_binding
    }

    /// Uniform + read-only volume, for the meshing kernel
    pub fn meshing_binding(&self) -> BindingHandle {
        self.meshing_binding
    }

    pub fn vertex_buffer(&self) -> Option<BufferHandle> {
        self.vertex_buffer
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }
}

/// What the render stage needs to draw one region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionDraw {
    pub id: RegionId,
    pub uniform_buffer: BufferHandle,
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
}

/// Resources created so far for one region, released on failure
#[derive(Default)]
struct Partial {
    buffers: Vec<BufferHandle>,
    volumes: Vec<VolumeHandle>,
    bindings: Vec<BindingHandle>,
}

impl Partial {
    fn release<B: GpuBackend + ?Sized>(self, backend: &mut B) {
        for binding in self.bindings {
            let _ = backend.destroy_binding(binding);
        }
        for buffer in self.buffers {
            let _ = backend.destroy_buffer(buffer);
        }
        for volume in self.volumes {
            let _ = backend.destroy_volume(volume);
        }
    }
}

/// All regions of the world
#[derive(Debug)]
pub struct RegionTable {
    records: Vec<RegionRecord>,
    grid_width: u32,
    generated: bool,
}

impl RegionTable {
    /// Allocate every region and write its uniform
    ///
    /// All-or-nothing: on the first failure everything allocated so far is
    /// released and the error returned.
    pub fn initialize<B: GpuBackend + ?Sized>(backend: &mut B, world: &WorldConfig) -> Result<Self> {
        let mut records = Vec::with_capacity(world.num_regions as usize);
        for index in 0..world.num_regions {
            match Self::allocate_region(backend, RegionId(index), world) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::error!("Region table allocation failed at region {index}: {e}");
                    let partial = Self {
                        records,
                        grid_width: world.grid_width,
                        generated: false,
                    };
                    // The allocation error is the one worth reporting
                    let _ = partial.release(backend);
                    return Err(e);
                }
            }
        }

        log::info!(
            "Region table: {} regions of {}^3 voxels",
            records.len(),
            REGION_SIZE
        );
        Ok(Self {
            records,
            grid_width: world.grid_width,
            generated: false,
        })
    }

    fn allocate_region<B: GpuBackend + ?Sized>(
        backend: &mut B,
        id: RegionId,
        world: &WorldConfig,
    ) -> Result<RegionRecord> {
        let mut partial = Partial::default();
        let result = Self::allocate_into(backend, id, world, &mut partial);
        if result.is_err() {
            partial.release(backend);
        }
        result
    }

    fn allocate_into<B: GpuBackend + ?Sized>(
        backend: &mut B,
        id: RegionId,
        world: &WorldConfig,
        partial: &mut Partial,
    ) -> Result<RegionRecord> {
        let uniform = RegionUniform::new(id, world.grid_width, world.seed);

        let uniform_buffer = backend.create_buffer(&BufferDesc {
            label: format!("region_uniform_{}", id.0),
            size: std::mem::size_of::<RegionUniform>() as u64,
            kind: BufferKind::Uniform,
        })?;
        partial.buffers.push(uniform_buffer);
        backend.write_buffer(uniform_buffer, 0, bytemuck::bytes_of(&uniform))?;

        let volume = backend.create_volume(&VolumeDesc {
            label: format!("region_volume_{}", id.0),
            extent: [REGION_SIZE; 3],
        })?;
        partial.volumes.push(volume);

        let generation_binding = backend.create_binding(&BindingDesc {
            label: format!("region_generation_{}", id.0),
            layout: BindingLayout::RegionGeneration,
            resources: vec![
                BindingResource::whole(uniform_buffer),
                BindingResource::Volume { volume, access: VolumeAccess::Write },
            ],
        })?;
        partial.bindings.push(generation_binding);

        let meshing_binding = backend.create_binding(&BindingDesc {
            label: format!("region_meshing_{}", id.0),
            layout: BindingLayout::RegionMeshing,
            resources: vec![
                BindingResource::whole(uniform_buffer),
                BindingResource::Volume { volume, access: VolumeAccess::Read },
            ],
        })?;
        partial.bindings.push(meshing_binding);

        Ok(RegionRecord {
            id,
            uniform,
            uniform_buffer,
            volume,
            generation_binding,
            meshing_binding,
            state: MeshState::AwaitMeshingCompute,
            vertex_buffer: None,
            vertex_count: 0,
        })
    }

    /// Free every resource: bindings first, then buffers and volumes
    ///
    /// Keeps going after a failure and returns the first error.
    pub fn release<B: GpuBackend + ?Sized>(self, backend: &mut B) -> Result<()> {
        let mut first_error = None;
        let mut note = |result: Result<()>| {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        };

        for record in &self.records {
            note(backend.destroy_binding(record.generation_binding));
            note(backend.destroy_binding(record.meshing_binding));
        }
        for record in &self.records {
            note(backend.destroy_buffer(record.uniform_buffer));
            if let Some(buffer) = record.vertex_buffer {
                note(backend.destroy_buffer(buffer));
            }
        }
        for record in &self.records {
            note(backend.destroy_volume(record.volume));
        }

        log::debug!("Released {} regions", self.records.len());
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn grid_width(&self) -> u32 {
        self.grid_width
    }

    pub fn get(&self, id: RegionId) -> Result<&RegionRecord> {
        self.records
            .get(id.index())
            .ok_or_else(|| Error::InvalidHandle(format!("{id} (table has {})", self.records.len())))
    }

    pub fn records(&self) -> impl Iterator<Item = &RegionRecord> {
        self.records.iter()
    }

    pub fn state(&self, id: RegionId) -> Result<MeshState> {
        Ok(self.get(id)?.state)
    }

    /// Move a region to the next lifecycle state; any other move is rejected
    pub fn advance(&mut self, id: RegionId, to: MeshState) -> Result<()> {
        let len = self.records.len();
        let record = self
            .records
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidHandle(format!("{id} (table has {len})")))?;
        if !record.state.can_advance_to(to) {
            return Err(Error::InvalidTransition {
                region: id.0,
                from: record.state,
                to,
            });
        }
        record.state = to;
        Ok(())
    }

    /// Attach the materialized vertex buffer and mark the region completed
    pub fn complete(&mut self, id: RegionId, vertex_buffer: Option<BufferHandle>, vertex_count: u32) -> Result<()> {
        self.advance(id, MeshState::Completed)?;
        let record = &mut self.records[id.index()];
        record.vertex_buffer = vertex_buffer;
        record.vertex_count = vertex_count;
        Ok(())
    }

    pub fn count_in(&self, state: MeshState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    /// True once every region is completed
    pub fn is_complete(&self) -> bool {
        self.records.iter().all(|r| r.state.is_terminal())
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }

    pub(crate) fn mark_generated(&mut self) {
        self.generated = true;
    }

    /// Regions waiting for meshing, in the requested order
    pub fn pending(&self, order: MeshingOrder) -> Vec<RegionId> {
        let mut pending: Vec<RegionId> = self
            .records
            .iter()
            .filter(|r| r.state == MeshState::AwaitMeshingCompute)
            .map(|r| r.id)
            .collect();

        if let MeshingOrder::NearestFirst { origin } = order {
            let origin = Vec3::from_array(origin);
            let grid_width = self.grid_width;
            pending.sort_by(|a, b| {
                let da = a.center(grid_width).distance_squared(origin);
                let db = b.center(grid_width).distance_squared(origin);
                da.total_cmp(&db).then(a.cmp(b))
            });
        }
        pending
    }

    /// Completed regions with at least one vertex
    pub fn draw_list(&self) -> impl Iterator<Item = RegionDraw> + '_ {
        self.records.iter().filter_map(|r| match (r.state, r.vertex_buffer) {
            (MeshState::Completed, Some(vertex_buffer)) if r.vertex_count > 0 => Some(RegionDraw {
                id: r.id,
                uniform_buffer: r.uniform_buffer,
                vertex_buffer,
                vertex_count: r.vertex_count,
            }),
            _ => None,
        })
    }
}
