//! wgpu implementation of [`GpuBackend`]
//!
//! Buffers, volumes and bind groups live in generational arenas and are
//! addressed by the same handles the software backend hands out. Each
//! submission records into one command encoder, one compute pass per
//! dispatch, and is tracked by its `wgpu::SubmissionIndex` for `wait`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::path::Path;
use std::time::Duration;

use super::arena::Arena;
use super::backend::{
    BindingDesc, BindingHandle, BindingLayout, BindingResource, BufferDesc, BufferHandle,
    BufferKind, Command, DeviceLimits, GpuBackend, Kernel, SubmissionId, VolumeDesc, VolumeHandle,
};
use crate::core::{Error, Result};
use crate::voxel::RegionUniform;

const GENERATION_WGSL: &str = include_str!("../../shaders/region_generation.wgsl");
const MESHING_WGSL: &str = include_str!("../../shaders/region_meshing.wgsl");
const RENDER_WGSL: &str = include_str!("../../shaders/region_render.wgsl");

/// WGSL sources of the three pipeline programs
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub generation: Cow<'static, str>,
    pub meshing: Cow<'static, str>,
    pub render: Cow<'static, str>,
}

impl ShaderSet {
    pub const GENERATION_FILE: &'static str = "region_generation.wgsl";
    pub const MESHING_FILE: &'static str = "region_meshing.wgsl";
    pub const RENDER_FILE: &'static str = "region_render.wgsl";

    /// Programs compiled into the binary
    pub fn embedded() -> Self {
        Self {
            generation: Cow::Borrowed(GENERATION_WGSL),
            meshing: Cow::Borrowed(MESHING_WGSL),
            render: Cow::Borrowed(RENDER_WGSL),
        }
    }

    /// Load programs from `dir`; files that are missing keep the embedded source
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Config(format!("shader directory {} not found", dir.display())));
        }
        let mut set = Self::embedded();
        for (file, source) in [
            (Self::GENERATION_FILE, &mut set.generation),
            (Self::MESHING_FILE, &mut set.meshing),
            (Self::RENDER_FILE, &mut set.render),
        ] {
            let path = dir.join(file);
            if path.exists() {
                *source = Cow::Owned(std::fs::read_to_string(&path)?);
                log::info!("Loaded shader override {}", path.display());
            }
        }
        Ok(set)
    }

    /// Embedded programs, or overrides from the configured directory
    pub fn from_dir(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::load(dir),
            None => Ok(Self::embedded()),
        }
    }
}

/// Usage flags for each buffer kind
pub fn buffer_usages(kind: BufferKind) -> wgpu::BufferUsages {
    use wgpu::BufferUsages as U;
    match kind {
        BufferKind::Uniform => U::UNIFORM | U::COPY_DST,
        BufferKind::StagingCounter => U::STORAGE | U::COPY_SRC | U::COPY_DST,
        BufferKind::StagingVertices => U::STORAGE | U::COPY_SRC,
        BufferKind::Readback => U::MAP_READ | U::COPY_DST,
        BufferKind::Vertex => U::VERTEX | U::COPY_DST,
    }
}

/// Device limits requested for the streaming pipeline
pub fn required_limits(adapter: &wgpu::Adapter) -> wgpu::Limits {
    let adapter_limits = adapter.limits();
    wgpu::Limits {
        max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
        max_buffer_size: adapter_limits.max_buffer_size,
        ..Default::default()
    }
}

/// Map a failed blocking poll onto the streaming error taxonomy
fn poll_error(error: wgpu::PollError, timeout: Option<Duration>) -> Error {
    match error {
        wgpu::PollError::Timeout => Error::Timeout(timeout.unwrap_or_default()),
        other => Error::Synchronization(other.to_string()),
    }
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    kind: BufferKind,
}

struct GpuVolume {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct GpuBinding {
    layout: BindingLayout,
    group: wgpu::BindGroup,
}

struct BindGroupLayouts {
    region_generation: wgpu::BindGroupLayout,
    region_meshing: wgpu::BindGroupLayout,
    staging_slot: wgpu::BindGroupLayout,
}

impl BindGroupLayouts {
    fn new(device: &wgpu::Device) -> Self {
        let uniform = wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: NonZeroU64::new(std::mem::size_of::<RegionUniform>() as u64),
            },
            count: None,
        };
        let storage = |binding: u32, min_size: u64| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: NonZeroU64::new(min_size),
            },
            count: None,
        };

        let region_generation = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("region_generation_layout"),
            entries: &[
                uniform,
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::R32Uint,
                        view_dimension: wgpu::TextureViewDimension::D3,
                    },
                    count: None,
                },
            ],
        });

        let region_meshing = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("region_meshing_layout"),
            entries: &[
                uniform,
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Uint,
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let staging_slot = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("staging_slot_layout"),
            entries: &[storage(0, 4), storage(1, crate::voxel::RegionVertex::SIZE)],
        });

        Self {
            region_generation,
            region_meshing,
            staging_slot,
        }
    }

    fn get(&self, layout: BindingLayout) -> &wgpu::BindGroupLayout {
        match layout {
            BindingLayout::RegionGeneration => &self.region_generation,
            BindingLayout::RegionMeshing => &self.region_meshing,
            BindingLayout::StagingSlot => &self.staging_slot,
        }
    }
}

fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layouts: &[&wgpu::BindGroupLayout],
) -> wgpu::ComputePipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: layouts,
        immediate_size: 0,
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&layout),
        module: &shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Streaming backend on a real wgpu device
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: DeviceLimits,
    layouts: BindGroupLayouts,
    generation_pipeline: wgpu::ComputePipeline,
    meshing_pipeline: wgpu::ComputePipeline,
    buffers: Arena<GpuBuffer>,
    volumes: Arena<GpuVolume>,
    bindings: Arena<GpuBinding>,
    in_flight: BTreeMap<u64, wgpu::SubmissionIndex>,
    next_submission: u64,
}

impl WgpuBackend {
    /// Build on an existing device; the queue is shared with the caller
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, shaders: &ShaderSet) -> Self {
        let device_limits = device.limits();
        let limits = DeviceLimits {
            min_storage_buffer_offset_alignment: device_limits.min_storage_buffer_offset_alignment,
            max_storage_buffer_binding_size: u64::from(device_limits.max_storage_buffer_binding_size),
            max_buffer_size: device_limits.max_buffer_size,
        };

        let layouts = BindGroupLayouts::new(&device);
        let generation_pipeline = compute_pipeline(
            &device,
            "region_generation",
            &shaders.generation,
            &[&layouts.region_generation],
        );
        let meshing_pipeline = compute_pipeline(
            &device,
            "region_meshing",
            &shaders.meshing,
            &[&layouts.staging_slot, &layouts.region_meshing],
        );

        log::info!(
            "wgpu backend: storage offset alignment {}, max storage binding {}MB",
            limits.min_storage_buffer_offset_alignment,
            limits.max_storage_buffer_binding_size / 1024 / 1024
        );

        Self {
            device,
            queue,
            limits,
            layouts,
            generation_pipeline,
            meshing_pipeline,
            buffers: Arena::new("buffer"),
            volumes: Arena::new("volume"),
            bindings: Arena::new("binding"),
            in_flight: BTreeMap::new(),
            next_submission: 0,
        }
    }

    /// Create a device without a surface
    pub fn new_headless(shaders: &ShaderSet) -> Result<Self> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::PRIMARY,
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;

            log::info!("Headless adapter: {}", adapter.get_info().name);

            let (device, queue) = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("voxmesh_headless_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: required_limits(&adapter),
                    memory_hints: wgpu::MemoryHints::Performance,
                    experimental_features: Default::default(),
                    trace: Default::default(),
                })
                .await
                .map_err(|e| Error::Gpu(e.to_string()))?;

            Ok(Self::new(device, queue, shaders))
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Underlying buffer, for binding region data in the render stage
    pub fn buffer(&self, buffer: BufferHandle) -> Result<&wgpu::Buffer> {
        Ok(&self.buffers.get(buffer.0)?.buffer)
    }

    fn pipeline(&self, kernel: Kernel) -> &wgpu::ComputePipeline {
        match kernel {
            Kernel::Generation => &self.generation_pipeline,
            Kernel::Meshing => &self.meshing_pipeline,
        }
    }

    fn check_copy_range(&self, buffer: BufferHandle, offset: u64, size: u64) -> Result<()> {
        let len = self.buffers.get(buffer.0)?.buffer.size();
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::Submission(format!(
                "copy range {offset}+{size} not {}-byte aligned",
                wgpu::COPY_BUFFER_ALIGNMENT
            )));
        }
        if offset.checked_add(size).is_none_or(|end| end > len) {
            return Err(Error::Submission(format!("copy range {offset}+{size} exceeds buffer of {len} bytes")));
        }
        Ok(())
    }

    /// Validate a whole command list before encoding anything
    fn validate(&self, commands: &[Command]) -> Result<()> {
        for command in commands {
            match command {
                Command::ClearBuffer { buffer, offset, size } => {
                    self.check_copy_range(*buffer, *offset, *size)?;
                }
                Command::Dispatch { kernel, bindings, .. } => {
                    let expected = kernel.layouts();
                    if bindings.len() != expected.len() {
                        return Err(Error::Submission(format!(
                            "{kernel:?} takes {} bind groups, got {}",
                            expected.len(),
                            bindings.len()
                        )));
                    }
                    for (binding, layout) in bindings.iter().zip(expected) {
                        let actual = self.bindings.get(binding.0)?.layout;
                        if actual != *layout {
                            return Err(Error::Submission(format!(
                                "{kernel:?} expects {layout:?}, got {actual:?}"
                            )));
                        }
                    }
                }
                Command::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                    self.check_copy_range(*src, *src_offset, *size)?;
                    self.check_copy_range(*dst, *dst_offset, *size)?;
                }
            }
        }
        Ok(())
    }
}

impl GpuBackend for WgpuBackend {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size > self.limits.max_buffer_size {
            return Err(Error::ResourceCreation(format!(
                "'{}': {} bytes exceeds max_buffer_size {}",
                desc.label, desc.size, self.limits.max_buffer_size
            )));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: desc.size,
            usage: buffer_usages(desc.kind),
            mapped_at_creation: false,
        });
        Ok(BufferHandle(self.buffers.insert(GpuBuffer { buffer, kind: desc.kind })))
    }

    fn create_volume(&mut self, desc: &VolumeDesc) -> Result<VolumeHandle> {
        let [width, height, depth] = desc.extent;
        let max = self.device.limits().max_texture_dimension_3d;
        if desc.extent.iter().any(|&e| e == 0 || e > max) {
            return Err(Error::ResourceCreation(format!(
                "'{}': extent {:?} outside 1..={max}",
                desc.label, desc.extent
            )));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: depth,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: wgpu::TextureFormat::R32Uint,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(VolumeHandle(self.volumes.insert(GpuVolume { texture, view })))
    }

    fn create_binding(&mut self, desc: &BindingDesc) -> Result<BindingHandle> {
        desc.validate()?;
        let alignment = self.limits.min_storage_buffer_offset_alignment as u64;

        let mut entries = Vec::with_capacity(desc.resources.len());
        for (binding, resource) in (0u32..).zip(&desc.resources) {
            let resource = match *resource {
                BindingResource::Buffer { buffer, offset, size } => {
                    if offset % alignment != 0 {
                        return Err(Error::ResourceCreation(format!(
                            "'{}': offset {offset} not aligned to {alignment}",
                            desc.label
                        )));
                    }
                    let gpu = &self.buffers.get(buffer.0)?.buffer;
                    let len = size.unwrap_or_else(|| gpu.size().saturating_sub(offset));
                    if offset + len > gpu.size() {
                        return Err(Error::ResourceCreation(format!(
                            "'{}': range {offset}+{len} exceeds buffer of {} bytes",
                            desc.label,
                            gpu.size()
                        )));
                    }
                    if len > self.limits.max_storage_buffer_binding_size {
                        return Err(Error::ResourceCreation(format!(
                            "'{}': {len} bytes exceeds max_storage_buffer_binding_size",
                            desc.label
                        )));
                    }
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: gpu,
                        offset,
                        size: size.and_then(NonZeroU64::new),
                    })
                }
                BindingResource::Volume { volume, .. } => {
                    wgpu::BindingResource::TextureView(&self.volumes.get(volume.0)?.view)
                }
            };
            entries.push(wgpu::BindGroupEntry { binding, resource });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&desc.label),
            layout: self.layouts.get(desc.layout),
            entries: &entries,
        });
        Ok(BindingHandle(self.bindings.insert(GpuBinding {
            layout: desc.layout,
            group,
        })))
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64> {
        Ok(self.buffers.get(buffer.0)?.buffer.size())
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let gpu = self.buffers.get(buffer.0)?;
        if !buffer_usages(gpu.kind).contains(wgpu::BufferUsages::COPY_DST) {
            return Err(Error::ResourceCreation(format!("{:?} buffers are not host-writable", gpu.kind)));
        }
        self.queue.write_buffer(&gpu.buffer, offset, data);
        Ok(())
    }

    fn write_volume(&mut self, volume: VolumeHandle, texels: &[u32]) -> Result<()> {
        let gpu = self.volumes.get(volume.0)?;
        let size = gpu.texture.size();
        let expected = (size.width * size.height * size.depth_or_array_layers) as usize;
        if texels.len() != expected {
            return Err(Error::ResourceCreation(format!(
                "volume write of {} texels, volume holds {expected}",
                texels.len()
            )));
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &gpu.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * 4),
                rows_per_image: Some(size.height),
            },
            size,
        );
        Ok(())
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        len: u64,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let gpu = self.buffers.get(buffer.0)?;
        if gpu.kind != BufferKind::Readback {
            return Err(Error::Readback(format!("{:?} buffers are not host-readable", gpu.kind)));
        }
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= gpu.buffer.size())
            .ok_or_else(|| Error::Readback(format!("range {offset}+{len} exceeds buffer")))?;

        let slice = gpu.buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout })
            .map_err(|e| poll_error(e, timeout))?;

        rx.recv()
            .map_err(|_| Error::Readback("map callback dropped".into()))?
            .map_err(|e| Error::Readback(e.to_string()))?;

        let data = slice.get_mapped_range();
        let bytes = data[offset as usize..end as usize].to_vec();
        drop(data);
        gpu.buffer.unmap();
        Ok(bytes)
    }

    fn submit(&mut self, commands: &[Command]) -> Result<SubmissionId> {
        self.validate(commands)?;

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("streaming_batch"),
        });
        for command in commands {
            match command {
                Command::ClearBuffer { buffer, offset, size } => {
                    encoder.clear_buffer(&self.buffers.get(buffer.0)?.buffer, *offset, Some(*size));
                }
                Command::Dispatch { kernel, bindings, workgroups } => {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("streaming_dispatch"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(self.pipeline(*kernel));
                    for (group, binding) in (0u32..).zip(bindings) {
                        pass.set_bind_group(group, &self.bindings.get(binding.0)?.group, &[]);
                    }
                    pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
                }
                Command::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                    encoder.copy_buffer_to_buffer(
                        &self.buffers.get(src.0)?.buffer,
                        *src_offset,
                        &self.buffers.get(dst.0)?.buffer,
                        *dst_offset,
                        *size,
                    );
                }
            }
        }

        let index = self.queue.submit([encoder.finish()]);
        let id = SubmissionId(self.next_submission);
        self.next_submission += 1;
        self.in_flight.insert(id.0, index);
        log::trace!("Submitted {} commands as {:?}", commands.len(), id);
        Ok(id)
    }

    fn wait(&mut self, submission: SubmissionId, timeout: Option<Duration>) -> Result<()> {
        if submission.0 >= self.next_submission {
            return Err(Error::Synchronization(format!("{submission:?} was never submitted")));
        }
        // Completed submissions were already pruned
        let Some(index) = self.in_flight.get(&submission.0).cloned() else {
            return Ok(());
        };

        self.device
            .poll(wgpu::PollType::Wait { submission_index: Some(index), timeout })
            .map_err(|e| poll_error(e, timeout))?;

        // Queue order: everything up to this submission has completed
        self.in_flight = self.in_flight.split_off(&(submission.0 + 1));
        Ok(())
    }

    fn destroy_binding(&mut self, binding: BindingHandle) -> Result<()> {
        self.bindings.remove(binding.0)?;
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.buffers.remove(buffer.0)?.buffer.destroy();
        Ok(())
    }

    fn destroy_volume(&mut self, volume: VolumeHandle) -> Result<()> {
        self.volumes.remove(volume.0)?.texture.destroy();
        Ok(())
    }
}
