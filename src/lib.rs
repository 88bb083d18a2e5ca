//! Ray-tracing scene core
//!
//! GPU resource plumbing for a ray-traced renderer, written against the
//! [`GpuDevice`] trait:
//! - **Buffers** with aligned per-instance access, mapping and staging uploads
//! - **Descriptors**: set layouts, pools, a growable per-frame allocator and a writer
//! - **Scene builder** that rebuilds the top-level acceleration structure and
//!   the per-instance shader metadata every frame
//!
//! Two devices are provided: [`VulkanDevice`] (feature `vulkan-backend`) wraps
//! an application-created `ash::Device`, and [`DummyDevice`] simulates one in
//! memory for tests.

pub mod backend;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod resources;
pub mod scene;

pub use backend::{DummyDevice, GpuDevice};
#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::VulkanDevice;
pub use context::{CoreConfig, RayTracingContext};
pub use descriptors::{
    DescriptorAllocatorConfig, DescriptorPool, DescriptorSetLayout, DescriptorWriter,
    GrowableDescriptorAllocator,
};
pub use error::{GraphicsError, GraphicsResult};
pub use resources::{AccelerationStructure, Buffer, Submission};
pub use scene::{
    FrameInfo, MaterialHandle, MeshHandle, MeshInstanceData, RayTracingSceneManager, Renderable,
    SceneBuilderConfig,
};

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
