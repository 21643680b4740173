//! Device abstraction used by the streaming pipeline
//!
//! The streaming stages only ever talk to a [`GpuBackend`]: they allocate
//! buffers and volumes, describe bindings, record [`Command`]s and wait on
//! submissions. [`crate::gpu::WgpuBackend`] runs them on a real device and
//! [`crate::gpu::SoftwareBackend`] executes them on the CPU.

use std::time::Duration;

use crate::core::Result;

/// Handle to a buffer owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) super::arena::Key);

/// Handle to a 3D voxel volume owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeHandle(pub(crate) super::arena::Key);

/// Handle to a binding descriptor (bind group) owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingHandle(pub(crate) super::arena::Key);

/// Identifies one submitted command list; increases monotonically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionId(pub u64);

/// What a buffer is used for; backends derive usage flags from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Small per-region constant data
    Uniform,
    /// Atomic vertex counters, one per staging slot
    StagingCounter,
    /// Shared vertex output of the meshing stage
    StagingVertices,
    /// Host-readable copy target
    Readback,
    /// Materialized per-region vertex buffer
    Vertex,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub kind: BufferKind,
}

/// A cubic `u32` voxel volume
#[derive(Debug, Clone)]
pub struct VolumeDesc {
    pub label: String,
    pub extent: [u32; 3],
}

impl VolumeDesc {
    pub fn texel_count(&self) -> usize {
        self.extent.iter().map(|&e| e as usize).product()
    }
}

/// Shape of a binding descriptor; each maps to one shader bind group layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingLayout {
    /// 0: region uniform, 1: volume (write)
    RegionGeneration,
    /// 0: region uniform, 1: volume (read)
    RegionMeshing,
    /// 0: slot vertex counter, 1: slot vertex range
    StagingSlot,
}

impl BindingLayout {
    /// Expected resource kind per binding slot, in binding order
    pub fn expected(self) -> &'static [ResourceKind] {
        match self {
            BindingLayout::RegionGeneration => &[ResourceKind::Buffer, ResourceKind::VolumeWrite],
            BindingLayout::RegionMeshing => &[ResourceKind::Buffer, ResourceKind::VolumeRead],
            BindingLayout::StagingSlot => &[ResourceKind::Buffer, ResourceKind::Buffer],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    VolumeRead,
    VolumeWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAccess {
    Read,
    Write,
}

/// A resource bound at one binding slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    /// A byte range of a buffer; `size: None` binds to the end
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Volume {
        volume: VolumeHandle,
        access: VolumeAccess,
    },
}

impl BindingResource {
    pub fn whole(buffer: BufferHandle) -> Self {
        BindingResource::Buffer { buffer, offset: 0, size: None }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            BindingResource::Buffer { .. } => ResourceKind::Buffer,
            BindingResource::Volume { access: VolumeAccess::Read, .. } => ResourceKind::VolumeRead,
            BindingResource::Volume { access: VolumeAccess::Write, .. } => ResourceKind::VolumeWrite,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindingDesc {
    pub label: String,
    pub layout: BindingLayout,
    /// Resources in binding order
    pub resources: Vec<BindingResource>,
}

impl BindingDesc {
    /// Check the resources against the layout's expected kinds
    pub fn validate(&self) -> Result<()> {
        let expected = self.layout.expected();
        let actual: Vec<_> = self.resources.iter().map(BindingResource::kind).collect();
        if actual != expected {
            return Err(crate::core::Error::ResourceCreation(format!(
                "binding '{}' does not match {:?}: got {:?}",
                self.label, self.layout, actual
            )));
        }
        Ok(())
    }
}

/// Compute programs the pipeline dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Bind groups: [RegionGeneration]
    Generation,
    /// Bind groups: [StagingSlot, RegionMeshing]
    Meshing,
}

impl Kernel {
    pub fn layouts(self) -> &'static [BindingLayout] {
        match self {
            Kernel::Generation => &[BindingLayout::RegionGeneration],
            Kernel::Meshing => &[BindingLayout::StagingSlot, BindingLayout::RegionMeshing],
        }
    }
}

/// One recorded GPU command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Zero `size` bytes at `offset`
    ClearBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    Dispatch {
        kernel: Kernel,
        /// Bind groups in group order
        bindings: Vec<BindingHandle>,
        workgroups: [u32; 3],
    },
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
}

/// Device limits relevant to staging layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_storage_buffer_offset_alignment: u32,
    pub max_storage_buffer_binding_size: u64,
    pub max_buffer_size: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_storage_buffer_offset_alignment: 256,
            max_storage_buffer_binding_size: 128 << 20,
            max_buffer_size: 256 << 20,
        }
    }
}

/// Round `value` up to a multiple of `alignment`
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Allocation, binding and submission capability of a device
pub trait GpuBackend {
    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle>;

    fn create_volume(&mut self, desc: &VolumeDesc) -> Result<VolumeHandle>;

    fn create_binding(&mut self, desc: &BindingDesc) -> Result<BindingHandle>;

    /// Size in bytes a buffer was created with
    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64>;

    /// Queue a host write; ordered before the next submission
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Queue a full-volume host write; ordered before the next submission
    fn write_volume(&mut self, volume: VolumeHandle, texels: &[u32]) -> Result<()>;

    /// Read a byte range once all submitted work touching it has completed
    ///
    /// `timeout` bounds the map wait the same way it bounds `wait`.
    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        len: u64,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>>;

    /// Submit commands as one unit
    fn submit(&mut self, commands: &[Command]) -> Result<SubmissionId>;

    /// Block until `submission` has completed; `None` waits forever
    fn wait(&mut self, submission: SubmissionId, timeout: Option<Duration>) -> Result<()>;

    fn destroy_binding(&mut self, binding: BindingHandle) -> Result<()>;

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    fn destroy_volume(&mut self, volume: VolumeHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::arena::Key;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(4, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn test_binding_validation() {
        let buffer = BufferHandle(Key::new(0, 0));
        let volume = VolumeHandle(Key::new(1, 0));

        let good = BindingDesc {
            label: "region".into(),
            layout: BindingLayout::RegionMeshing,
            resources: vec![
                BindingResource::whole(buffer),
                BindingResource::Volume { volume, access: VolumeAccess::Read },
            ],
        };
        assert!(good.validate().is_ok());

        let bad = BindingDesc {
            layout: BindingLayout::RegionGeneration,
            ..good
        };
        assert!(bad.validate().is_err());
    }
}
