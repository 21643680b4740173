//! Per-frame view data for the region pass (group 0)

use std::num::NonZeroU64;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::core::camera::Camera;

/// Layout of `CameraUniform` in region_render.wgsl
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    /// Column-major view-projection (offset 0)
    pub view_proj: [[f32; 4]; 4],
    /// Eye position for fog; w is 1 (offset 64)
    pub position: [f32; 4],
}

impl CameraUniform {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn from_camera(camera: &Camera) -> Self {
        Self {
            view_proj: camera.view_projection().to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
        }
    }
}

/// Uniform buffer and bind group shared by every region draw
pub struct CameraBuffer {
    buffer: wgpu::Buffer,
    layout: wgpu::BindGroupLayout,
    group: wgpu::BindGroup,
}

impl CameraBuffer {
    pub fn new(device: &wgpu::Device) -> Self {
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("region_pass_camera"),
            contents: bytemuck::bytes_of(&CameraUniform::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        // Vertex stage projects, fragment stage fogs by eye distance
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("region_pass_camera_layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(CameraUniform::SIZE),
                },
                count: None,
            }],
        });

        let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("region_pass_camera_group"),
            layout: &layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        Self { buffer, layout, group }
    }

    /// Queue this frame's view; lands before the next submit
    pub fn update(&self, queue: &wgpu::Queue, camera: &Camera) {
        let uniform = CameraUniform::from_camera(camera);
        queue.write_buffer(&self.buffer, 0, bytemuck::bytes_of(&uniform));
    }

    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_matches_shader_layout() {
        assert_eq!(CameraUniform::SIZE, 80);
        assert_eq!(std::mem::offset_of!(CameraUniform, position), 64);
    }

    #[test]
    fn test_tracks_camera_position() {
        let mut camera = Camera::default();
        camera.position = Vec3::new(8.0, 40.0, -12.0);
        let uniform = CameraUniform::from_camera(&camera);

        assert_eq!(uniform.position, [8.0, 40.0, -12.0, 1.0]);
        assert_eq!(uniform.view_proj, camera.view_projection().to_cols_array_2d());
    }
}
