//! Forward pass over completed region vertex buffers

use std::collections::HashMap;
use std::num::NonZeroU64;

use crate::core::Result;
use crate::gpu::WgpuBackend;
use crate::render::texture::DepthTexture;
use crate::streaming::RegionDraw;
use crate::voxel::{RegionId, RegionUniform, RegionVertex};

/// Sky colour behind the terrain
pub const CLEAR_COLOR: wgpu::Color = wgpu::Color {
    r: 0.53,
    g: 0.72,
    b: 0.92,
    a: 1.0,
};

/// Draws each completed region with its uniform and vertex buffer
pub struct RegionRenderPipeline {
    pipeline: wgpu::RenderPipeline,
    region_layout: wgpu::BindGroupLayout,
    /// Per-region uniform bind groups, built on first draw
    region_groups: HashMap<RegionId, wgpu::BindGroup>,
}

impl RegionRenderPipeline {
    pub fn new(
        device: &wgpu::Device,
        surface_format: wgpu::TextureFormat,
        shader_source: &str,
        camera_layout: &wgpu::BindGroupLayout,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("region_render_shader"),
            source: wgpu::ShaderSource::Wgsl(shader_source.into()),
        });

        let region_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("region_render_layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(std::mem::size_of::<RegionUniform>() as u64),
                },
                count: None,
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("region_render_pipeline_layout"),
            bind_group_layouts: &[camera_layout, &region_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("region_render_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[RegionVertex::layout()],
                compilation_options: Default::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DepthTexture::FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            multiview_mask: None,
            cache: None,
        });

        Self {
            pipeline,
            region_layout,
            region_groups: HashMap::new(),
        }
    }

    /// Build uniform bind groups for regions drawn for the first time
    pub fn prepare(&mut self, backend: &WgpuBackend, draws: &[RegionDraw]) -> Result<()> {
        for draw in draws {
            if self.region_groups.contains_key(&draw.id) {
                continue;
            }
            let uniform = backend.buffer(draw.uniform_buffer)?;
            let group = backend.device().create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("region_render_bind_group"),
                layout: &self.region_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform.as_entire_binding(),
                }],
            });
            self.region_groups.insert(draw.id, group);
        }
        Ok(())
    }

    /// Clear the target and draw every prepared region
    pub fn render(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        depth: &DepthTexture,
        camera_group: &wgpu::BindGroup,
        backend: &WgpuBackend,
        draws: &[RegionDraw],
    ) -> Result<u32> {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("region_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(CLEAR_COLOR),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth.view(),
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });

        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, camera_group, &[]);

        let mut drawn = 0;
        for draw in draws {
            let Some(group) = self.region_groups.get(&draw.id) else {
                continue;
            };
            pass.set_bind_group(1, group, &[]);
            pass.set_vertex_buffer(0, backend.buffer(draw.vertex_buffer)?.slice(..));
            pass.draw(0..draw.vertex_count, 0..1);
            drawn += 1;
        }
        Ok(drawn)
    }
}
