//! Fixed-capacity descriptor pools

use std::sync::Arc;

use crate::backend::{
    DescriptorPoolDescriptor, DescriptorPoolFlags, DescriptorPoolHandle, DescriptorSet,
    DescriptorType, GpuDevice, PoolSize,
};
use crate::descriptors::DescriptorSetLayout;
use crate::error::{GraphicsError, GraphicsResult};

/// Default number of sets a pool built without `set_max_sets` can hold.
pub const DEFAULT_MAX_SETS: u32 = 1000;

/// Builder for [`DescriptorPool`].
pub struct DescriptorPoolBuilder {
    device: Arc<dyn GpuDevice>,
    desc: DescriptorPoolDescriptor,
}

impl DescriptorPoolBuilder {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            desc: DescriptorPoolDescriptor {
                max_sets: DEFAULT_MAX_SETS,
                ..Default::default()
            },
        }
    }

    pub fn add_pool_size(mut self, descriptor_type: DescriptorType, count: u32) -> Self {
        self.desc.pool_sizes.push(PoolSize {
            descriptor_type,
            count,
        });
        self
    }

    pub fn set_pool_flags(mut self, flags: DescriptorPoolFlags) -> Self {
        self.desc.flags = flags;
        self
    }

    pub fn set_max_sets(mut self, max_sets: u32) -> Self {
        self.desc.max_sets = max_sets;
        self
    }

    pub fn build(self) -> GraphicsResult<DescriptorPool> {
        DescriptorPool::new(self.device, self.desc)
    }
}

/// A descriptor pool with a fixed capacity per descriptor type.
///
/// Sets allocated from the pool are plain handles; they become invalid when
/// the pool is reset or dropped.
pub struct DescriptorPool {
    device: Arc<dyn GpuDevice>,
    handle: DescriptorPoolHandle,
    desc: DescriptorPoolDescriptor,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .field("max_sets", &self.desc.max_sets)
            .finish()
    }
}

impl DescriptorPool {
    pub fn builder(device: Arc<dyn GpuDevice>) -> DescriptorPoolBuilder {
        DescriptorPoolBuilder::new(device)
    }

    pub fn new(device: Arc<dyn GpuDevice>, desc: DescriptorPoolDescriptor) -> GraphicsResult<Self> {
        let handle = device.create_descriptor_pool(&desc)?;
        Ok(Self {
            device,
            handle,
            desc,
        })
    }

    /// Allocate a set for `layout`.
    ///
    /// Returns `Ok(None)` when the pool has no room left; device failures are
    /// returned as errors.
    pub fn allocate_descriptor_set(
        &self,
        layout: &DescriptorSetLayout,
    ) -> GraphicsResult<Option<DescriptorSet>> {
        match self.device.allocate_descriptor_set(self.handle, layout.handle()) {
            Ok(set) => Ok(Some(set)),
            Err(e) if e.is_pool_exhaustion() => {
                log::trace!("Descriptor pool {:?} exhausted: {}", self.handle, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Return individual sets; requires [`DescriptorPoolFlags::FREE_DESCRIPTOR_SET`].
    pub fn free_descriptors(&self, sets: &[DescriptorSet]) -> GraphicsResult<()> {
        if !self.desc.flags.contains(DescriptorPoolFlags::FREE_DESCRIPTOR_SET) {
            return Err(GraphicsError::InvalidParameter(
                "descriptor pool was not created with FREE_DESCRIPTOR_SET".into(),
            ));
        }
        self.device.free_descriptor_sets(self.handle, sets)
    }

    /// Invalidate every set allocated from this pool.
    pub fn reset_pool(&self) -> GraphicsResult<()> {
        self.device.reset_descriptor_pool(self.handle)
    }

    pub fn handle(&self) -> DescriptorPoolHandle {
        self.handle
    }

    pub fn max_sets(&self) -> u32 {
        self.desc.max_sets
    }

    pub fn flags(&self) -> DescriptorPoolFlags {
        self.desc.flags
    }

    /// Total number of descriptors of `descriptor_type` the pool holds.
    pub fn capacity_of(&self, descriptor_type: DescriptorType) -> u32 {
        self.desc
            .pool_sizes
            .iter()
            .filter(|s| s.descriptor_type == descriptor_type)
            .map(|s| s.count)
            .sum()
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.handle);
    }
}
