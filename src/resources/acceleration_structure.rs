//! Top-level acceleration structure and its backing storage

use std::sync::Arc;

use crate::backend::{
    AccelerationStructureBuildSizes, AccelerationStructureHandle, BufferUsage, GpuDevice,
    MemoryProperties, TopLevelBuild,
};
use crate::error::GraphicsResult;
use crate::resources::{Buffer, Submission};

/// A top-level acceleration structure together with the buffer it lives in.
///
/// Dropping it destroys the structure before its backing buffer.
pub struct AccelerationStructure {
    device: Arc<dyn GpuDevice>,
    handle: AccelerationStructureHandle,
    sizes: AccelerationStructureBuildSizes,
    capacity: u32,
    buffer: Buffer,
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("handle", &self.handle)
            .field("capacity", &self.capacity)
            .field("sizes", &self.sizes)
            .finish()
    }
}

impl AccelerationStructure {
    /// Create an unbuilt top-level structure sized for `instance_count` instances.
    pub fn top_level(device: &Arc<dyn GpuDevice>, instance_count: u32) -> GraphicsResult<Self> {
        let sizes = device.top_level_build_sizes(instance_count);
        let buffer = Buffer::with_label(
            Arc::clone(device),
            "tlas",
            sizes.acceleration_structure_size,
            1,
            BufferUsage::ACCELERATION_STRUCTURE_STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            MemoryProperties::DEVICE_LOCAL,
            1,
        )?;
        let handle = device
            .create_top_level_acceleration_structure(buffer.handle(), sizes.acceleration_structure_size)?;
        log::debug!(
            "Created TLAS {:?} for {} instances ({} bytes, scratch {})",
            handle,
            instance_count,
            sizes.acceleration_structure_size,
            sizes.build_scratch_size
        );

        Ok(Self {
            device: Arc::clone(device),
            handle,
            sizes,
            capacity: instance_count,
            buffer,
        })
    }

    /// Build over the first `instance_count` records of `instances`.
    ///
    /// The build is submitted without waiting. The returned [`Submission`]
    /// owns the instance and scratch buffers until it is dropped.
    pub fn build(&self, instances: Buffer, instance_count: u32) -> GraphicsResult<Submission> {
        assert!(
            instance_count <= self.capacity,
            "{} instances exceed the TLAS capacity {}",
            instance_count,
            self.capacity
        );
        let alignment = self
            .device
            .min_acceleration_structure_scratch_offset_alignment()
            .max(1);
        // Over-allocate so the start can be rounded up to the scratch alignment.
        let scratch = Buffer::with_label(
            Arc::clone(&self.device),
            "tlas-scratch",
            self.sizes.build_scratch_size + alignment,
            1,
            BufferUsage::STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            MemoryProperties::DEVICE_LOCAL,
            1,
        )?;
        let scratch_address = Buffer::get_alignment(scratch.device_address()?, alignment);

        let handle = self.device.build_top_level(&TopLevelBuild {
            destination: self.handle,
            instance_buffer_address: instances.device_address()?,
            instance_count,
            scratch_address,
        })?;
        let mut submission = Submission::new(Arc::clone(&self.device), handle);
        submission.keep_alive(instances);
        submission.keep_alive(scratch);
        Ok(submission)
    }

    pub fn handle(&self) -> AccelerationStructureHandle {
        self.handle
    }

    pub fn device_address(&self) -> u64 {
        self.device.acceleration_structure_device_address(self.handle)
    }

    pub fn sizes(&self) -> AccelerationStructureBuildSizes {
        self.sizes
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        self.device.destroy_acceleration_structure(self.handle);
    }
}
