//! Device abstraction for the streaming pipeline

pub mod arena;
pub mod backend;
pub mod batch;
pub mod software;
pub mod wgpu_backend;

pub use backend::{
    align_up, BindingDesc, BindingHandle, BindingLayout, BindingResource, BufferDesc,
    BufferHandle, BufferKind, Command, DeviceLimits, GpuBackend, Kernel, SubmissionId,
    VolumeAccess, VolumeDesc, VolumeHandle,
};
pub use batch::{Recorder, SyncCommandBatch};
pub use software::{Fault, SoftwareBackend};
pub use wgpu_backend::{ShaderSet, WgpuBackend};
