//! Per-frame orchestration of the allocator and the scene builder

use std::sync::Arc;

use crate::backend::GpuDevice;
use crate::descriptors::{DescriptorAllocatorConfig, GrowableDescriptorAllocator};
use crate::error::GraphicsResult;
use crate::scene::{BlasRegistry, FrameInfo, MaterialRegistry, RayTracingSceneManager, SceneBuilderConfig};

/// Configuration for [`RayTracingContext`].
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub descriptor_allocator: DescriptorAllocatorConfig,
    pub scene_builder: SceneBuilderConfig,
}

/// Owns the descriptor allocator and the scene builder and drives them
/// once per frame.
pub struct RayTracingContext {
    // Dropped before the allocator that owns its descriptor sets.
    scene: RayTracingSceneManager,
    allocator: GrowableDescriptorAllocator,
    frame_count: u64,
}

impl RayTracingContext {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        materials: Arc<dyn MaterialRegistry>,
        blas: Arc<dyn BlasRegistry>,
        config: CoreConfig,
    ) -> GraphicsResult<Self> {
        let mut allocator =
            GrowableDescriptorAllocator::new(Arc::clone(&device), config.descriptor_allocator)?;
        let scene = RayTracingSceneManager::new(
            device,
            materials,
            blas,
            &mut allocator,
            config.scene_builder,
        )?;

        Ok(Self {
            scene,
            allocator,
            frame_count: 0,
        })
    }

    /// Start `frame`: recycle the slot's transient descriptor sets and
    /// rebuild the scene for it.
    ///
    /// The caller must have waited on the slot's fence.
    pub fn begin_frame(&mut self, frame: &FrameInfo) -> GraphicsResult<()> {
        self.allocator.begin_frame(frame.slot())?;
        self.scene.create_tlas(frame)?;
        self.frame_count += 1;
        Ok(())
    }

    pub fn allocator(&self) -> &GrowableDescriptorAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut GrowableDescriptorAllocator {
        &mut self.allocator
    }

    pub fn scene(&self) -> &RayTracingSceneManager {
        &self.scene
    }

    /// Frames successfully started.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}
