//! Shared setup for the integration tests.
//!
//! Every test runs against [`DummyDevice`], which keeps buffer memory and
//! descriptor contents on the host so results can be inspected directly.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use rt_scene_core::backend::{
    AccelerationStructureHandle, DescriptorType, DummyDevice, GpuDevice, ShaderStages,
};
use rt_scene_core::scene::{BottomLevelEntry, MaterialHandle, MeshHandle};
use rt_scene_core::{
    CoreConfig, DescriptorAllocatorConfig, DescriptorSetLayout, GrowableDescriptorAllocator,
    RayTracingContext, SceneBuilderConfig,
};

/// Route `log` output through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Device
// ============================================================================

/// A dummy device seen both concretely, for inspection, and as a trait object.
pub struct TestContext {
    pub dummy: Arc<DummyDevice>,
    pub device: Arc<dyn GpuDevice>,
}

impl TestContext {
    pub fn new() -> Self {
        init_logging();
        let dummy = Arc::new(DummyDevice::new());
        let device: Arc<dyn GpuDevice> = dummy.clone();
        Self { dummy, device }
    }

    /// Layout with a single binding of `descriptor_type` at binding 0.
    pub fn single_binding_layout(
        &self,
        descriptor_type: DescriptorType,
        count: u32,
    ) -> Arc<DescriptorSetLayout> {
        DescriptorSetLayout::builder(Arc::clone(&self.device))
            .add_binding(0, descriptor_type, ShaderStages::RAYGEN | ShaderStages::CLOSEST_HIT, count)
            .build()
            .unwrap()
    }

    pub fn allocator(&self, config: DescriptorAllocatorConfig) -> GrowableDescriptorAllocator {
        GrowableDescriptorAllocator::new(Arc::clone(&self.device), config).unwrap()
    }

    /// Allocator and scene builder over the given registries, with default settings.
    pub fn scene_context(&self, registries: &Registries) -> RayTracingContext {
        self.scene_context_with(registries, SceneBuilderConfig::default())
    }

    /// Like [`Self::scene_context`] with custom instance settings.
    pub fn scene_context_with(
        &self,
        registries: &Registries,
        scene_builder: SceneBuilderConfig,
    ) -> RayTracingContext {
        RayTracingContext::new(
            Arc::clone(&self.device),
            Arc::new(registries.materials.clone()),
            Arc::new(registries.blas.clone()),
            CoreConfig {
                scene_builder,
                ..CoreConfig::default()
            },
        )
        .unwrap()
    }
}

// ============================================================================
// Registries
// ============================================================================

#[derive(Default)]
pub struct Registries {
    pub materials: HashMap<MaterialHandle, u32>,
    pub blas: HashMap<MeshHandle, BottomLevelEntry>,
}

impl Registries {
    /// Register `mesh` with distinct, recognisable addresses.
    pub fn with_mesh(mut self, mesh: u64) -> Self {
        self.blas.insert(MeshHandle(mesh), blas_entry(mesh));
        self
    }

    pub fn with_material(mut self, material: u64, index: u32) -> Self {
        self.materials.insert(MaterialHandle(material), index);
        self
    }
}

pub fn blas_entry(mesh: u64) -> BottomLevelEntry {
    BottomLevelEntry {
        handle: AccelerationStructureHandle::from_raw(1000 + mesh),
        device_address: 0xA000_0000 + mesh * 0x1000,
        vertex_buffer_address: 0xB000_0000 + mesh * 0x1000,
        index_buffer_address: 0xC000_0000 + mesh * 0x1000,
    }
}
