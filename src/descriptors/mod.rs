//! Descriptor set layouts, pools, the growable allocator and the writer.

mod allocator;
mod layout;
mod pool;
mod writer;

pub use allocator::{
    DescriptorAllocatorConfig, DescriptorAllocatorStats, GrowableDescriptorAllocator,
    PoolSetStats, PoolSizeRatio,
};
pub use layout::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
pub use pool::{DescriptorPool, DescriptorPoolBuilder, DEFAULT_MAX_SETS};
pub use writer::DescriptorWriter;
