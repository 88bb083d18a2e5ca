//! Conversions from backend-agnostic types to Vulkan types

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::backend::types::*;
use crate::error::GraphicsError;

pub(super) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS) {
        flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    flags
}

/// Pick the gpu-allocator location that satisfies the requested properties.
pub(super) fn memory_location(memory: MemoryProperties) -> MemoryLocation {
    if memory.contains(MemoryProperties::HOST_VISIBLE) {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    }
}

pub(super) fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    if stages.contains(ShaderStages::RAYGEN) {
        flags |= vk::ShaderStageFlags::RAYGEN_KHR;
    }
    if stages.contains(ShaderStages::MISS) {
        flags |= vk::ShaderStageFlags::MISS_KHR;
    }
    if stages.contains(ShaderStages::CLOSEST_HIT) {
        flags |= vk::ShaderStageFlags::CLOSEST_HIT_KHR;
    }
    if stages.contains(ShaderStages::ANY_HIT) {
        flags |= vk::ShaderStageFlags::ANY_HIT_KHR;
    }
    if stages.contains(ShaderStages::INTERSECTION) {
        flags |= vk::ShaderStageFlags::INTERSECTION_KHR;
    }
    flags
}

pub(super) fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorType::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        DescriptorType::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    }
}

pub(super) fn pool_flags(flags: DescriptorPoolFlags) -> vk::DescriptorPoolCreateFlags {
    let mut vk_flags = vk::DescriptorPoolCreateFlags::empty();
    if flags.contains(DescriptorPoolFlags::FREE_DESCRIPTOR_SET) {
        vk_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
    }
    vk_flags
}

pub(super) fn image_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    }
}

/// Map a failed Vulkan call to the crate error, keeping pool exhaustion distinct.
pub(super) fn map_result(result: vk::Result, context: &str) -> GraphicsError {
    match result {
        vk::Result::ERROR_OUT_OF_POOL_MEMORY => GraphicsError::OutOfPoolMemory,
        vk::Result::ERROR_FRAGMENTED_POOL => GraphicsError::FragmentedPool,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            GraphicsError::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        other => GraphicsError::ResourceCreationFailed(format!("{}: {}", context, other)),
    }
}
