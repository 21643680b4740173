//! Reusable synchronous command batch
//!
//! One command list, serially reused: record, submit, block until complete,
//! reset. The list is cleared on every exit path, including recording and
//! submission failures, so a failed batch never leaks commands into the next.

use std::time::Duration;

use super::backend::{BindingHandle, BufferHandle, Command, GpuBackend, Kernel, SubmissionId};
use crate::core::Result;

/// Appends commands to the batch being recorded
pub struct Recorder<'a> {
    commands: &'a mut Vec<Command>,
}

impl Recorder<'_> {
    pub fn clear_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) {
        self.commands.push(Command::ClearBuffer { buffer, offset, size });
    }

    pub fn dispatch(&mut self, kernel: Kernel, bindings: &[BindingHandle], workgroups: [u32; 3]) {
        self.commands.push(Command::Dispatch {
            kernel,
            bindings: bindings.to_vec(),
            workgroups,
        });
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.commands.push(Command::CopyBuffer { src, src_offset, dst, dst_offset, size });
    }

    /// Commands recorded so far
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

struct ResetOnDrop<'a>(&'a mut Vec<Command>);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Dedicated command batch for streaming work
pub struct SyncCommandBatch {
    commands: Vec<Command>,
    timeout: Option<Duration>,
    submissions: u64,
    last_submission: Option<SubmissionId>,
}

impl SyncCommandBatch {
    /// `timeout` bounds every wait; `None` waits forever
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            commands: Vec::new(),
            timeout,
            submissions: 0,
            last_submission: None,
        }
    }

    /// Record via `record`, then submit and wait for completion
    ///
    /// Nothing is submitted if `record` fails or records no commands.
    pub fn run<B, T, F>(&mut self, backend: &mut B, record: F) -> Result<T>
    where
        B: GpuBackend + ?Sized,
        F: FnOnce(&mut B, &mut Recorder<'_>) -> Result<T>,
    {
        let mut guard = ResetOnDrop(&mut self.commands);
        let value = record(backend, &mut Recorder { commands: &mut *guard.0 })?;
        if guard.0.is_empty() {
            return Ok(value);
        }

        log::trace!("Submitting streaming batch: {} commands", guard.0.len());
        let submission = backend.submit(guard.0.as_slice())?;
        self.submissions += 1;
        self.last_submission = Some(submission);
        backend.wait(submission, self.timeout)?;
        Ok(value)
    }

    /// Completed submissions so far
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    pub fn last_submission(&self) -> Option<SubmissionId> {
        self.last_submission
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True when no commands are pending
    pub fn is_reset(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::gpu::backend::{BufferDesc, BufferKind};
    use crate::gpu::SoftwareBackend;

    fn counter(backend: &mut SoftwareBackend) -> BufferHandle {
        backend
            .create_buffer(&BufferDesc {
                label: "counter".into(),
                size: 16,
                kind: BufferKind::StagingCounter,
            })
            .unwrap()
    }

    #[test]
    fn test_run_submits_and_resets() {
        let mut backend = SoftwareBackend::new();
        let buffer = counter(&mut backend);
        backend.write_buffer(buffer, 0, &[7; 16]).unwrap();

        let mut batch = SyncCommandBatch::new(None);
        let recorded = batch
            .run(&mut backend, |_, rec| {
                rec.clear_buffer(buffer, 4, 4);
                Ok(rec.len())
            })
            .unwrap();

        assert_eq!(recorded, 1);
        assert_eq!(batch.submissions(), 1);
        assert!(batch.is_reset());
        let bytes = backend.read_buffer(buffer, 0, 12, None).unwrap();
        assert_eq!(bytes, vec![7, 7, 7, 7, 0, 0, 0, 0, 7, 7, 7, 7]);
    }

    #[test]
    fn test_record_failure_resets_without_submitting() {
        let mut backend = SoftwareBackend::new();
        let buffer = counter(&mut backend);
        let mut batch = SyncCommandBatch::new(None);

        let result: Result<()> = batch.run(&mut backend, |_, rec| {
            rec.clear_buffer(buffer, 0, 4);
            Err(Error::ResourceCreation("out of memory".into()))
        });

        assert!(matches!(result, Err(Error::ResourceCreation(_))));
        assert!(batch.is_reset());
        assert_eq!(batch.submissions(), 0);
        assert_eq!(backend.submissions(), 0);
    }

    #[test]
    fn test_empty_batch_not_submitted() {
        let mut backend = SoftwareBackend::new();
        let mut batch = SyncCommandBatch::new(None);
        batch.run(&mut backend, |_, _| Ok(())).unwrap();
        assert_eq!(backend.submissions(), 0);
        assert_eq!(batch.last_submission(), None);
    }
}
