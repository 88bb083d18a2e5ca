//! Descriptor set layouts

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{
    DescriptorSetLayoutHandle, DescriptorType, GpuDevice, LayoutBinding, ShaderStages,
};
use crate::error::GraphicsResult;

/// Builder for [`DescriptorSetLayout`].
pub struct DescriptorSetLayoutBuilder {
    device: Arc<dyn GpuDevice>,
    bindings: BTreeMap<u32, LayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            bindings: BTreeMap::new(),
        }
    }

    /// Declare `count` descriptors of `descriptor_type` at `binding`.
    ///
    /// # Panics
    ///
    /// Panics if `binding` was already declared.
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: DescriptorType,
        stages: ShaderStages,
        count: u32,
    ) -> Self {
        assert!(
            !self.bindings.contains_key(&binding),
            "Binding {} already in use",
            binding
        );
        self.bindings.insert(
            binding,
            LayoutBinding {
                binding,
                descriptor_type,
                stages,
                count,
            },
        );
        self
    }

    pub fn build(self) -> GraphicsResult<Arc<DescriptorSetLayout>> {
        let bindings: Vec<LayoutBinding> = self.bindings.values().copied().collect();
        let handle = self.device.create_descriptor_set_layout(&bindings)?;
        log::trace!("Created descriptor set layout {:?} with {} bindings", handle, bindings.len());
        Ok(Arc::new(DescriptorSetLayout {
            device: self.device,
            handle,
            bindings: self.bindings,
        }))
    }
}

/// Immutable binding schema shared by set allocation and writer validation.
pub struct DescriptorSetLayout {
    device: Arc<dyn GpuDevice>,
    handle: DescriptorSetLayoutHandle,
    bindings: BTreeMap<u32, LayoutBinding>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl DescriptorSetLayout {
    pub fn builder(device: Arc<dyn GpuDevice>) -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::new(device)
    }

    pub fn handle(&self) -> DescriptorSetLayoutHandle {
        self.handle
    }

    pub fn binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings.get(&binding)
    }

    /// Bindings in ascending index order.
    pub fn bindings(&self) -> impl Iterator<Item = &LayoutBinding> {
        self.bindings.values()
    }

    pub(crate) fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyDevice;

    #[test]
    fn test_layout_bindings() {
        let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        let layout = DescriptorSetLayout::builder(device)
            .add_binding(1, DescriptorType::CombinedImageSampler, ShaderStages::FRAGMENT, 4)
            .add_binding(0, DescriptorType::UniformBuffer, ShaderStages::VERTEX, 1)
            .build()
            .unwrap();

        let binding = layout.binding(1).unwrap();
        assert_eq!(binding.descriptor_type, DescriptorType::CombinedImageSampler);
        assert_eq!(binding.count, 4);
        assert!(layout.binding(2).is_none());

        let order: Vec<u32> = layout.bindings().map(|b| b.binding).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    #[should_panic(expected = "Binding 0 already in use")]
    fn test_duplicate_binding_panics() {
        let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        let _ = DescriptorSetLayout::builder(device)
            .add_binding(0, DescriptorType::UniformBuffer, ShaderStages::VERTEX, 1)
            .add_binding(0, DescriptorType::StorageBuffer, ShaderStages::VERTEX, 1);
    }
}
