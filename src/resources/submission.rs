//! GPU work submitted without waiting, and the buffers it still reads.
//!
//! Copies and acceleration structure builds return as soon as the work is on
//! the queue. The staging, instance and scratch buffers they use must outlive
//! the GPU work, so they are handed to the [`Submission`] that owns it:
//!
//! ```text
//! copy_buffer / build_top_level -> Submission { handle, keep_alive: [..] }
//!
//! On Drop(Submission):
//!   1. Device waits on the submission fence (normally already signaled)
//!   2. Command buffer and fence are freed
//!   3. Kept buffers are destroyed
//! ```
//!
//! The scene builder stores its submissions in the generation of the frame
//! slot that made them, so they are dropped only after the caller has waited
//! on that slot's fence.

use std::sync::Arc;

use crate::backend::{GpuDevice, SubmissionHandle};
use crate::error::GraphicsResult;
use crate::resources::Buffer;

/// Owner of a fenced submission and the buffers its commands use.
pub struct Submission {
    device: Arc<dyn GpuDevice>,
    handle: SubmissionHandle,
    keep_alive: Vec<Buffer>,
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("handle", &self.handle)
            .field("kept_buffers", &self.keep_alive.len())
            .finish()
    }
}

impl Submission {
    pub(crate) fn new(device: Arc<dyn GpuDevice>, handle: SubmissionHandle) -> Self {
        Self {
            device,
            handle,
            keep_alive: Vec::new(),
        }
    }

    /// Hold `buffer` until the submission is dropped.
    pub fn keep_alive(&mut self, buffer: Buffer) {
        self.keep_alive.push(buffer);
    }

    /// True once the GPU has finished the submitted commands.
    pub fn is_complete(&self) -> bool {
        self.device.is_submission_complete(self.handle)
    }

    /// Block until the GPU has finished the submitted commands.
    pub fn wait(&self) -> GraphicsResult<()> {
        self.device.wait_submission(self.handle)
    }

    pub fn handle(&self) -> SubmissionHandle {
        self.handle
    }

    pub fn kept_buffer_count(&self) -> usize {
        self.keep_alive.len()
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        // Kept buffers drop after this body, once the fence has been waited on.
        self.device.release_submission(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferUsage, DummyDevice, MemoryProperties};

    #[test]
    fn test_kept_buffers_outlive_release() {
        let dummy = Arc::new(DummyDevice::new());
        let device: Arc<dyn GpuDevice> = dummy.clone();
        let src = Buffer::new(
            Arc::clone(&device),
            64,
            1,
            BufferUsage::TRANSFER_SRC,
            MemoryProperties::STAGING,
            1,
        )
        .unwrap();
        let dst = Buffer::new(
            Arc::clone(&device),
            64,
            1,
            BufferUsage::TRANSFER_DST,
            MemoryProperties::DEVICE_LOCAL,
            1,
        )
        .unwrap();

        let handle = device.copy_buffer(src.handle(), dst.handle(), 64).unwrap();
        let mut submission = Submission::new(Arc::clone(&device), handle);
        submission.keep_alive(src);
        assert!(submission.is_complete());
        submission.wait().unwrap();
        assert_eq!(submission.kept_buffer_count(), 1);
        assert_eq!(dummy.live_submission_count(), 1);

        drop(submission);
        assert_eq!(dummy.live_submission_count(), 0);
        assert_eq!(dummy.live_buffer_count(), 1);
        assert_eq!(dummy.premature_destroy_count(), 0);
        drop(dst);
    }
}
