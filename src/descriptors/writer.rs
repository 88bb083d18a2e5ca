//! Batched descriptor set updates validated against a layout

use crate::backend::{
    AccelerationStructureHandle, BufferInfo, DescriptorClass, DescriptorResources, DescriptorSet,
    DescriptorType, DescriptorWrite, ImageInfo,
};
use crate::descriptors::{DescriptorPool, DescriptorSetLayout};
use crate::error::GraphicsResult;

/// Collects writes for sets of one layout and applies them in one update.
///
/// Every `write_*` call checks the binding against the layout; a missing
/// binding, a resource of the wrong kind or a wrong descriptor count panics.
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    writes: Vec<(u32, DescriptorType, DescriptorResources)>,
}

impl<'a> DescriptorWriter<'a> {
    pub fn new(layout: &'a DescriptorSetLayout) -> Self {
        Self {
            layout,
            writes: Vec::new(),
        }
    }

    fn push(&mut self, binding: u32, class: DescriptorClass, resources: DescriptorResources) {
        let Some(description) = self.layout.binding(binding) else {
            panic!("Layout does not contain binding {}", binding);
        };
        assert_eq!(
            description.descriptor_type.class(),
            class,
            "Binding {} expects {:?} descriptors",
            binding,
            description.descriptor_type
        );
        assert_eq!(
            description.count as usize,
            resources.len(),
            "Binding {} expects {} descriptors",
            binding,
            description.count
        );
        self.writes.push((binding, description.descriptor_type, resources));
    }

    pub fn write_buffer(&mut self, binding: u32, info: BufferInfo) -> &mut Self {
        self.push(binding, DescriptorClass::Buffer, DescriptorResources::Buffers(vec![info]));
        self
    }

    /// Fill every element of an array binding.
    pub fn write_buffers(&mut self, binding: u32, infos: &[BufferInfo]) -> &mut Self {
        self.push(
            binding,
            DescriptorClass::Buffer,
            DescriptorResources::Buffers(infos.to_vec()),
        );
        self
    }

    pub fn write_image(&mut self, binding: u32, info: ImageInfo) -> &mut Self {
        self.push(binding, DescriptorClass::Image, DescriptorResources::Images(vec![info]));
        self
    }

    /// Fill every element of an array binding.
    pub fn write_images(&mut self, binding: u32, infos: &[ImageInfo]) -> &mut Self {
        self.push(
            binding,
            DescriptorClass::Image,
            DescriptorResources::Images(infos.to_vec()),
        );
        self
    }

    pub fn write_acceleration_structure(
        &mut self,
        binding: u32,
        acceleration_structure: AccelerationStructureHandle,
    ) -> &mut Self {
        self.push(
            binding,
            DescriptorClass::AccelerationStructure,
            DescriptorResources::AccelerationStructures(vec![acceleration_structure]),
        );
        self
    }

    /// Allocate a set from `pool` and apply the pending writes to it.
    ///
    /// Returns `Ok(None)` if the pool is exhausted; the pending writes are kept
    /// in that case so the caller can retry with another pool.
    pub fn build(&mut self, pool: &DescriptorPool) -> GraphicsResult<Option<DescriptorSet>> {
        let Some(set) = pool.allocate_descriptor_set(self.layout)? else {
            return Ok(None);
        };
        self.overwrite(set);
        Ok(Some(set))
    }

    /// Apply the pending writes to an existing set of this layout.
    pub fn overwrite(&mut self, set: DescriptorSet) {
        let writes: Vec<DescriptorWrite> = self
            .writes
            .drain(..)
            .map(|(binding, descriptor_type, resources)| DescriptorWrite {
                set,
                binding,
                array_element: 0,
                descriptor_type,
                resources,
            })
            .collect();
        if !writes.is_empty() {
            self.layout.device().update_descriptor_sets(&writes);
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{
        BufferHandle, DummyDevice, GpuDevice, ImageLayout, ImageViewHandle, SamplerHandle,
        ShaderStages,
    };

    fn layout(device: &Arc<dyn GpuDevice>) -> Arc<DescriptorSetLayout> {
        DescriptorSetLayout::builder(Arc::clone(device))
            .add_binding(0, DescriptorType::UniformBuffer, ShaderStages::VERTEX, 1)
            .add_binding(1, DescriptorType::CombinedImageSampler, ShaderStages::FRAGMENT, 2)
            .build()
            .unwrap()
    }

    fn image(raw: u64) -> ImageInfo {
        ImageInfo {
            sampler: Some(SamplerHandle::from_raw(1)),
            view: ImageViewHandle::from_raw(raw),
            layout: ImageLayout::ShaderReadOnly,
        }
    }

    #[test]
    fn test_array_write() {
        let dummy = Arc::new(DummyDevice::new());
        let device: Arc<dyn GpuDevice> = dummy.clone();
        let layout = layout(&device);
        let pool = DescriptorPool::builder(device)
            .add_pool_size(DescriptorType::UniformBuffer, 1)
            .add_pool_size(DescriptorType::CombinedImageSampler, 2)
            .build()
            .unwrap();

        let images = [image(10), image(11)];
        let set = DescriptorWriter::new(&layout)
            .write_images(1, &images)
            .build(&pool)
            .unwrap()
            .unwrap();

        let contents = dummy.descriptor_set_contents(set).unwrap();
        assert_eq!(contents[&1], DescriptorResources::Images(images.to_vec()));
        assert!(!contents.contains_key(&0));
    }

    #[test]
    fn test_build_on_exhausted_pool_keeps_writes() {
        let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        let layout = layout(&device);
        let pool = DescriptorPool::builder(device)
            .add_pool_size(DescriptorType::UniformBuffer, 1)
            .build()
            .unwrap();

        let mut writer = DescriptorWriter::new(&layout);
        writer.write_buffer(
            0,
            BufferInfo {
                buffer: BufferHandle(1),
                offset: 0,
                range: 64,
            },
        );
        assert_eq!(writer.build(&pool).unwrap(), None);
        assert_eq!(writer.pending_writes(), 1);
    }

    #[test]
    #[should_panic(expected = "Layout does not contain binding 5")]
    fn test_unknown_binding_panics() {
        let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        let layout = layout(&device);
        DescriptorWriter::new(&layout).write_image(5, image(1));
    }

    #[test]
    #[should_panic(expected = "Binding 1 expects 2 descriptors")]
    fn test_single_write_to_array_binding_panics() {
        let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        let layout = layout(&device);
        DescriptorWriter::new(&layout).write_image(1, image(1));
    }

    #[test]
    #[should_panic(expected = "expects UniformBuffer descriptors")]
    fn test_wrong_resource_kind_panics() {
        let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        let layout = layout(&device);
        DescriptorWriter::new(&layout).write_image(0, image(1));
    }
}
