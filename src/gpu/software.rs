//! CPU reference backend
//!
//! Executes submitted commands immediately, with the same semantics as the
//! WGSL programs: generation fills volumes from the terrain function, meshing
//! appends faces through the slot's counter. Counters are plain memory and
//! keep their value until cleared.

use std::time::Duration;

use super::arena::Arena;
use super::backend::{
    BindingDesc, BindingHandle, BindingLayout, BindingResource, BufferDesc, BufferHandle,
    BufferKind, Command, DeviceLimits, GpuBackend, Kernel, SubmissionId, VolumeDesc, VolumeHandle,
};
use crate::core::{Error, Result};
use crate::voxel::mesher::{emit_voxel, RegionVertex};
use crate::voxel::terrain::{column_height, voxel_at};
use crate::voxel::{voxel_index, RegionUniform, REGION_SIZE, REGION_VOLUME, WORKGROUP_SIZE};

/// Failure to inject into a [`SoftwareBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The nth allocation (0-based, counting buffers and volumes) fails
    Allocation { nth: u64 },
    /// The nth submission (0-based) fails
    Submission { nth: u64 },
    /// Every readback fails
    Readback,
}

struct SoftBuffer {
    kind: BufferKind,
    data: Vec<u8>,
}

struct SoftVolume {
    texels: Vec<u32>,
}

struct SoftBinding {
    layout: BindingLayout,
    resources: Vec<BindingResource>,
}

/// Resource counts, for leak checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub buffers: usize,
    pub volumes: usize,
    pub bindings: usize,
}

/// Software implementation of [`GpuBackend`]
pub struct SoftwareBackend {
    limits: DeviceLimits,
    buffers: Arena<SoftBuffer>,
    volumes: Arena<SoftVolume>,
    bindings: Arena<SoftBinding>,
    next_submission: u64,
    allocations: u64,
    faults: Vec<Fault>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            buffers: Arena::new("buffer"),
            volumes: Arena::new("volume"),
            bindings: Arena::new("binding"),
            next_submission: 0,
            allocations: 0,
            faults: Vec::new(),
        }
    }

    pub fn inject_fault(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Number of submissions accepted so far
    pub fn submissions(&self) -> u64 {
        self.next_submission
    }

    pub fn live_resources(&self) -> LiveResources {
        LiveResources {
            buffers: self.buffers.len(),
            volumes: self.volumes.len(),
            bindings: self.bindings.len(),
        }
    }

    /// Texels of a volume
    pub fn volume_texels(&self, volume: VolumeHandle) -> Result<&[u32]> {
        Ok(&self.volumes.get(volume.0)?.texels)
    }

    /// Vertices stored in a buffer
    pub fn vertices(&self, buffer: BufferHandle) -> Result<Vec<RegionVertex>> {
        let data = &self.buffers.get(buffer.0)?.data;
        Ok(data
            .chunks_exact(RegionVertex::SIZE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    fn allocate(&mut self, label: &str, size: u64) -> Result<()> {
        let nth = self.allocations;
        self.allocations += 1;
        if self.faults.contains(&Fault::Allocation { nth }) {
            return Err(Error::ResourceCreation(format!("'{label}': injected allocation failure")));
        }
        if size > self.limits.max_buffer_size {
            return Err(Error::ResourceCreation(format!(
                "'{label}': {size} bytes exceeds max_buffer_size {}",
                self.limits.max_buffer_size
            )));
        }
        Ok(())
    }

    fn buffer_range(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<std::ops::Range<usize>> {
        let size = self.buffers.get(buffer.0)?.data.len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(Error::Submission(format!(
                "range {offset}+{len} outside buffer of {size} bytes"
            ))),
        }
    }

    fn validate(&self, command: &Command) -> Result<()> {
        match command {
            Command::ClearBuffer { buffer, offset, size } => {
                self.buffer_range(*buffer, *offset, *size)?;
            }
            Command::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                self.buffer_range(*src, *src_offset, *size)?;
                self.buffer_range(*dst, *dst_offset, *size)?;
            }
            Command::Dispatch { kernel, bindings, .. } => {
                let layouts = kernel.layouts();
                if bindings.len() != layouts.len() {
                    return Err(Error::Submission(format!(
                        "{kernel:?} expects {} bind groups, got {}",
                        layouts.len(),
                        bindings.len()
                    )));
                }
                for (binding, expected) in bindings.iter().zip(layouts) {
                    let layout = self.bindings.get(binding.0)?.layout;
                    if layout != *expected {
                        return Err(Error::Submission(format!(
                            "{kernel:?} expects {expected:?}, got {layout:?}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::ClearBuffer { buffer, offset, size } => {
                let range = self.buffer_range(*buffer, *offset, *size)?;
                self.buffers.get_mut(buffer.0)?.data[range].fill(0);
            }
            Command::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                let from = self.buffer_range(*src, *src_offset, *size)?;
                let to = self.buffer_range(*dst, *dst_offset, *size)?;
                let bytes = self.buffers.get(src.0)?.data[from].to_vec();
                self.buffers.get_mut(dst.0)?.data[to].copy_from_slice(&bytes);
            }
            Command::Dispatch { kernel: Kernel::Generation, bindings, workgroups } => {
                self.run_generation(bindings[0], *workgroups)?;
            }
            Command::Dispatch { kernel: Kernel::Meshing, bindings, workgroups } => {
                self.run_meshing(bindings[0], bindings[1], *workgroups)?;
            }
        }
        Ok(())
    }

    fn read_uniform(&self, resource: &BindingResource) -> Result<RegionUniform> {
        let BindingResource::Buffer { buffer, offset, .. } = *resource else {
            return Err(Error::Submission("expected a uniform buffer binding".into()));
        };
        let range = self.buffer_range(buffer, offset, std::mem::size_of::<RegionUniform>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(&self.buffers.get(buffer.0)?.data[range]))
    }

    fn bound_volume(resource: &BindingResource) -> Result<VolumeHandle> {
        match *resource {
            BindingResource::Volume { volume, .. } => Ok(volume),
            _ => Err(Error::Submission("expected a volume binding".into())),
        }
    }

    /// Invocations covered by a dispatch, clipped to the region
    fn invocations(workgroups: [u32; 3]) -> impl Iterator<Item = (u32, u32, u32)> {
        let [wx, wy, wz] = workgroups.map(|w| (w * WORKGROUP_SIZE).min(REGION_SIZE));
        (0..wz).flat_map(move |z| (0..wy).flat_map(move |y| (0..wx).map(move |x| (x, y, z))))
    }

    fn run_generation(&mut self, binding: BindingHandle, workgroups: [u32; 3]) -> Result<()> {
        let resources = self.bindings.get(binding.0)?.resources.clone();
        let uniform = self.read_uniform(&resources[0])?;
        let volume = Self::bound_volume(&resources[1])?;
        let [ox, oy, oz] = uniform.position;

        let texels = &mut self.volumes.get_mut(volume.0)?.texels;
        for (x, y, z) in Self::invocations(workgroups) {
            let height = column_height(ox + x as i32, oz + z as i32, uniform.seed);
            let wy = (oy + y as i32).max(0) as u32;
            texels[voxel_index(x, y, z)] = voxel_at(wy, height).code();
        }
        Ok(())
    }

    fn run_meshing(&mut self, slot: BindingHandle, region: BindingHandle, workgroups: [u32; 3]) -> Result<()> {
        let slot_resources = self.bindings.get(slot.0)?.resources.clone();
        let region_resources = self.bindings.get(region.0)?.resources.clone();

        let (
            BindingResource::Buffer { buffer: counter, offset: counter_offset, .. },
            BindingResource::Buffer { buffer: vertices, offset: vertex_offset, size: vertex_size },
        ) = (slot_resources[0], slot_resources[1])
        else {
            return Err(Error::Submission("staging slot binding must hold two buffers".into()));
        };
        let volume = Self::bound_volume(&region_resources[1])?;

        let vertex_size = match vertex_size {
            Some(size) => size,
            None => self.buffer_size(vertices)? - vertex_offset,
        };
        let capacity = vertex_size / RegionVertex::SIZE;
        let counter_range = self.buffer_range(counter, counter_offset, 4)?;

        let voxels = self.volumes.get(volume.0)?.texels.clone();
        let mut count = {
            let data = &self.buffers.get(counter.0)?.data;
            u32::from_le_bytes([
                data[counter_range.start],
                data[counter_range.start + 1],
                data[counter_range.start + 2],
                data[counter_range.start + 3],
            ])
        };

        let mut emitted = Vec::new();
        for (x, y, z) in Self::invocations(workgroups) {
            emitted.clear();
            emit_voxel(&voxels, x, y, z, &mut emitted);
            for face in emitted.chunks(6) {
                // atomicAdd reserves the range even when it does not fit
                let first = count as u64;
                count = count.wrapping_add(face.len() as u32);
                if first + face.len() as u64 > capacity {
                    continue;
                }
                let start = vertex_offset + first * RegionVertex::SIZE;
                let range = self.buffer_range(vertices, start, face.len() as u64 * RegionVertex::SIZE)?;
                self.buffers.get_mut(vertices.0)?.data[range]
                    .copy_from_slice(bytemuck::cast_slice(face));
            }
        }

        self.buffers.get_mut(counter.0)?.data[counter_range].copy_from_slice(&count.to_le_bytes());
        Ok(())
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for SoftwareBackend {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        self.allocate(&desc.label, desc.size)?;
        let key = self.buffers.insert(SoftBuffer {
            kind: desc.kind,
            data: vec![0; desc.size as usize],
        });
        log::trace!("Software buffer '{}' ({:?}, {} bytes)", desc.label, desc.kind, desc.size);
        Ok(BufferHandle(key))
    }

    fn create_volume(&mut self, desc: &VolumeDesc) -> Result<VolumeHandle> {
        self.allocate(&desc.label, desc.texel_count() as u64 * 4)?;
        if desc.texel_count() != REGION_VOLUME {
            return Err(Error::ResourceCreation(format!(
                "'{}': volumes must be {REGION_SIZE}^3, got {:?}",
                desc.label, desc.extent
            )));
        }
        let key = self.volumes.insert(SoftVolume {
            texels: vec![0; desc.texel_count()],
        });
        Ok(VolumeHandle(key))
    }

    fn create_binding(&mut self, desc: &BindingDesc) -> Result<BindingHandle> {
        desc.validate()?;
        for resource in &desc.resources {
            match *resource {
                BindingResource::Buffer { buffer, offset, size } => {
                    let alignment = self.limits.min_storage_buffer_offset_alignment as u64;
                    if offset % alignment != 0 {
                        return Err(Error::ResourceCreation(format!(
                            "'{}': offset {offset} not aligned to {alignment}",
                            desc.label
                        )));
                    }
                    let len = match size {
                        Some(size) => size,
                        None => self.buffer_size(buffer)?.saturating_sub(offset),
                    };
                    self.buffer_range(buffer, offset, len)
                        .map_err(|e| Error::ResourceCreation(format!("'{}': {e}", desc.label)))?;
                }
                BindingResource::Volume { volume, .. } => {
                    self.volumes.get(volume.0)?;
                }
            }
        }
        let key = self.bindings.insert(SoftBinding {
            layout: desc.layout,
            resources: desc.resources.clone(),
        });
        Ok(BindingHandle(key))
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64> {
        Ok(self.buffers.get(buffer.0)?.data.len() as u64)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.buffer_range(buffer, offset, data.len() as u64)?;
        self.buffers.get_mut(buffer.0)?.data[range].copy_from_slice(data);
        Ok(())
    }

    fn write_volume(&mut self, volume: VolumeHandle, texels: &[u32]) -> Result<()> {
        let target = &mut self.volumes.get_mut(volume.0)?.texels;
        if target.len() != texels.len() {
            return Err(Error::Submission(format!(
                "volume write of {} texels into volume of {}",
                texels.len(),
                target.len()
            )));
        }
        target.copy_from_slice(texels);
        Ok(())
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        len: u64,
        _timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        if self.faults.contains(&Fault::Readback) {
            return Err(Error::Readback("injected map failure".into()));
        }
        let range = self
            .buffer_range(buffer, offset, len)
            .map_err(|e| Error::Readback(e.to_string()))?;
        Ok(self.buffers.get(buffer.0)?.data[range].to_vec())
    }

    fn submit(&mut self, commands: &[Command]) -> Result<SubmissionId> {
        let nth = self.next_submission;
        if self.faults.contains(&Fault::Submission { nth }) {
            return Err(Error::Submission(format!("injected failure on submission {nth}")));
        }
        // Validate everything first so a rejected submission has no effect
        for command in commands {
            self.validate(command)?;
        }
        for command in commands {
            self.execute(command)?;
        }
        self.next_submission += 1;
        Ok(SubmissionId(nth))
    }

    fn wait(&mut self, submission: SubmissionId, _timeout: Option<Duration>) -> Result<()> {
        if submission.0 >= self.next_submission {
            return Err(Error::Synchronization(format!(
                "submission {} was never made",
                submission.0
            )));
        }
        Ok(())
    }

    fn destroy_binding(&mut self, binding: BindingHandle) -> Result<()> {
        self.bindings.remove(binding.0).map(drop)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let removed = self.buffers.remove(buffer.0)?;
        log::trace!("Released {:?} buffer ({} bytes)", removed.kind, removed.data.len());
        Ok(())
    }

    fn destroy_volume(&mut self, volume: VolumeHandle) -> Result<()> {
        self.volumes.remove(volume.0).map(drop)
    }
}
