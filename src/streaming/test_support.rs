//! Backend wrapper that records every submission

use std::time::Duration;

use crate::core::Result;
use crate::gpu::{
    BindingDesc, BindingHandle, BufferDesc, BufferHandle, Command, DeviceLimits, GpuBackend,
    SoftwareBackend, SubmissionId, VolumeDesc, VolumeHandle,
};

pub struct Recording {
    pub inner: SoftwareBackend,
    /// Command lists in submission order
    pub submitted: Vec<Vec<Command>>,
    /// Timeouts passed to `wait`
    pub waits: Vec<Option<Duration>>,
    /// Timeouts passed to `read_buffer`
    pub reads: Vec<Option<Duration>>,
}

impl Recording {
    pub fn new(inner: SoftwareBackend) -> Self {
        Self { inner, submitted: Vec::new(), waits: Vec::new(), reads: Vec::new() }
    }
}

impl GpuBackend for Recording {
    fn limits(&self) -> DeviceLimits {
        self.inner.limits()
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        self.inner.create_buffer(desc)
    }

    fn create_volume(&mut self, desc: &VolumeDesc) -> Result<VolumeHandle> {
        self.inner.create_volume(desc)
    }

    fn create_binding(&mut self, desc: &BindingDesc) -> Result<BindingHandle> {
        self.inner.create_binding(desc)
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64> {
        self.inner.buffer_size(buffer)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_buffer(buffer, offset, data)
    }

    fn write_volume(&mut self, volume: VolumeHandle, texels: &[u32]) -> Result<()> {
        self.inner.write_volume(volume, texels)
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        len: u64,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.reads.push(timeout);
        self.inner.read_buffer(buffer, offset, len, timeout)
    }

    fn submit(&mut self, commands: &[Command]) -> Result<SubmissionId> {
        self.submitted.push(commands.to_vec());
        self.inner.submit(commands)
    }

    fn wait(&mut self, submission: SubmissionId, timeout: Option<Duration>) -> Result<()> {
        self.waits.push(timeout);
        self.inner.wait(submission, timeout)
    }

    fn destroy_binding(&mut self, binding: BindingHandle) -> Result<()> {
        self.inner.destroy_binding(binding)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.inner.destroy_buffer(buffer)
    }

    fn destroy_volume(&mut self, volume: VolumeHandle) -> Result<()> {
        self.inner.destroy_volume(volume)
    }
}
