//! Core device abstraction trait
//!
//! Everything above the backend layer talks to the GPU through [`GpuDevice`].
//! Objects receive the device as an `Arc<dyn GpuDevice>` when they are
//! created and keep it for their own destruction.

use std::ptr::NonNull;

use crate::backend::types::*;
use crate::error::GraphicsResult;

/// Capability provider for buffer, descriptor and acceleration structure
/// operations.
///
/// Methods take `&self`; implementations guard their handle tables
/// internally. Callers still drive a device from the single thread that owns
/// the graphics queue.
pub trait GpuDevice: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &'static str;

    // Limits

    fn min_uniform_buffer_offset_alignment(&self) -> u64;

    fn min_storage_buffer_offset_alignment(&self) -> u64;

    fn min_acceleration_structure_scratch_offset_alignment(&self) -> u64;

    // Buffers

    /// Create a buffer and bind freshly allocated memory to it.
    fn create_buffer(&self, desc: &BufferDescriptor) -> GraphicsResult<BufferHandle>;

    /// Destroy a buffer and free its memory.
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Map `size` bytes (or [`WHOLE_SIZE`]) starting at `offset`.
    ///
    /// The returned pointer addresses byte `offset` of the buffer and stays
    /// valid until [`GpuDevice::unmap_buffer`] or destruction. Fails with
    /// `MemoryNotHostVisible` for device-local memory.
    fn map_buffer(&self, buffer: BufferHandle, offset: u64, size: u64)
        -> GraphicsResult<NonNull<u8>>;

    fn unmap_buffer(&self, buffer: BufferHandle);

    /// Make host writes in the range visible to the device.
    fn flush_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> GraphicsResult<()>;

    /// Make device writes in the range visible to the host.
    fn invalidate_buffer(&self, buffer: BufferHandle, offset: u64, size: u64)
        -> GraphicsResult<()>;

    /// GPU virtual address of a buffer created with `SHADER_DEVICE_ADDRESS`.
    fn buffer_device_address(&self, buffer: BufferHandle) -> GraphicsResult<u64>;

    /// Submit a copy of `size` bytes between buffers without waiting for it.
    ///
    /// Both buffers must stay alive until the submission has completed.
    fn copy_buffer(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> GraphicsResult<SubmissionHandle>;

    // Descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> GraphicsResult<DescriptorSetLayoutHandle>;

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDescriptor,
    ) -> GraphicsResult<DescriptorPoolHandle>;

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);

    /// Allocate one set.
    ///
    /// A full or fragmented pool is reported as `OutOfPoolMemory` or
    /// `FragmentedPool` so callers can tell it apart from device failures.
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> GraphicsResult<DescriptorSet>;

    fn free_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        sets: &[DescriptorSet],
    ) -> GraphicsResult<()>;

    /// Return every set allocated from the pool in one operation.
    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> GraphicsResult<()>;

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Acceleration structures

    /// Sizes needed to build a top-level structure over `instance_count` instances.
    fn top_level_build_sizes(&self, instance_count: u32) -> AccelerationStructureBuildSizes;

    fn create_top_level_acceleration_structure(
        &self,
        buffer: BufferHandle,
        size: u64,
    ) -> GraphicsResult<AccelerationStructureHandle>;

    fn destroy_acceleration_structure(&self, acceleration_structure: AccelerationStructureHandle);

    fn acceleration_structure_device_address(
        &self,
        acceleration_structure: AccelerationStructureHandle,
    ) -> u64;

    /// Submit a top-level build without waiting for it.
    ///
    /// The instance and scratch buffers must stay alive until the submission
    /// has completed.
    fn build_top_level(&self, build: &TopLevelBuild) -> GraphicsResult<SubmissionHandle>;

    // Submissions

    fn is_submission_complete(&self, submission: SubmissionHandle) -> bool;

    /// Block until the submission has completed.
    fn wait_submission(&self, submission: SubmissionHandle) -> GraphicsResult<()>;

    /// Free the command buffer and fence of a submission, waiting for it first
    /// if it is still executing.
    fn release_submission(&self, submission: SubmissionHandle);
}
