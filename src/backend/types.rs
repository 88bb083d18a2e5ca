//! Common types shared between backends

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// Sentinel size meaning "from the offset to the end of the resource".
pub const WHOLE_SIZE: u64 = u64::MAX;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
        /// Buffer exposes a GPU virtual address.
        const SHADER_DEVICE_ADDRESS = 1 << 6;
        /// Read-only input of an acceleration structure build (instances, geometry).
        const ACCELERATION_STRUCTURE_BUILD_INPUT = 1 << 7;
        /// Backing storage of an acceleration structure.
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 8;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Memory property flags requested for a buffer allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        /// Host writes are visible without an explicit flush.
        const HOST_COHERENT = 1 << 2;
    }
}

impl MemoryProperties {
    /// Host-visible, coherent memory used for staging and per-frame uploads.
    pub const STAGING: Self = Self::HOST_VISIBLE.union(Self::HOST_COHERENT);
}

bitflags! {
    /// Shader stages a descriptor binding is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const RAYGEN = 1 << 3;
        const MISS = 1 << 4;
        const CLOSEST_HIT = 1 << 5;
        const ANY_HIT = 1 << 6;
        const INTERSECTION = 1 << 7;
    }
}

bitflags! {
    /// Creation flags for descriptor pools.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorPoolFlags: u32 {
        /// Sets may be returned to the pool individually.
        const FREE_DESCRIPTOR_SET = 1 << 0;
    }
}

impl Default for DescriptorPoolFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor types supported by layouts and writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    AccelerationStructure,
}

/// The kind of resource info a descriptor type is written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorClass {
    Buffer,
    Image,
    AccelerationStructure,
}

impl DescriptorType {
    pub fn class(&self) -> DescriptorClass {
        match self {
            DescriptorType::UniformBuffer
            | DescriptorType::StorageBuffer
            | DescriptorType::UniformBufferDynamic
            | DescriptorType::StorageBufferDynamic => DescriptorClass::Buffer,
            DescriptorType::Sampler
            | DescriptorType::CombinedImageSampler
            | DescriptorType::SampledImage
            | DescriptorType::StorageImage => DescriptorClass::Image,
            DescriptorType::AccelerationStructure => DescriptorClass::AccelerationStructure,
        }
    }
}

/// Image layout a sampled or storage image is in when the shader reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    ShaderReadOnly,
    General,
    DepthStencilReadOnly,
}

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutHandle(pub(crate) u64);

/// Handle to a descriptor pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorPoolHandle(pub(crate) u64);

/// Handle to a descriptor set.
///
/// Sets are owned by the pool they were allocated from; this handle is a
/// non-owning reference that becomes invalid when that pool is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSet(pub(crate) u64);

/// Handle to an acceleration structure (top or bottom level)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccelerationStructureHandle(pub(crate) u64);

impl AccelerationStructureHandle {
    /// Wrap a raw handle created outside this crate (e.g. a BLAS built by the asset loader).
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Handle to GPU work submitted by the device without waiting for it.
///
/// The command buffer and fence behind it are freed by
/// [`GpuDevice::release_submission`](crate::backend::GpuDevice::release_submission).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionHandle(pub(crate) u64);

/// Handle to an image view created by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewHandle(pub(crate) u64);

impl ImageViewHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Handle to a sampler created by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

impl SamplerHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryProperties,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage, memory: MemoryProperties) -> Self {
        Self {
            label: None,
            size,
            usage,
            memory,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub stages: ShaderStages,
    pub count: u32,
}

/// Number of descriptors of one type a pool can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolSize {
    pub descriptor_type: DescriptorType,
    pub count: u32,
}

/// Descriptor for creating a descriptor pool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DescriptorPoolDescriptor {
    pub max_sets: u32,
    pub flags: DescriptorPoolFlags,
    pub pool_sizes: Vec<PoolSize>,
}

/// Buffer range bound to a buffer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferInfo {
    pub buffer: BufferHandle,
    pub offset: u64,
    /// Size of the range, or [`WHOLE_SIZE`].
    pub range: u64,
}

/// Image (and optional sampler) bound to an image descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageInfo {
    pub sampler: Option<SamplerHandle>,
    pub view: ImageViewHandle,
    pub layout: ImageLayout,
}

/// Resources written into consecutive array elements of one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorResources {
    Buffers(Vec<BufferInfo>),
    Images(Vec<ImageInfo>),
    AccelerationStructures(Vec<AccelerationStructureHandle>),
}

impl DescriptorResources {
    pub fn len(&self) -> usize {
        match self {
            DescriptorResources::Buffers(infos) => infos.len(),
            DescriptorResources::Images(infos) => infos.len(),
            DescriptorResources::AccelerationStructures(handles) => handles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single descriptor update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: DescriptorType,
    pub resources: DescriptorResources,
}

/// Memory requirements of an acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccelerationStructureBuildSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

/// A top-level build request over a device-resident instance array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopLevelBuild {
    pub destination: AccelerationStructureHandle,
    pub instance_buffer_address: u64,
    pub instance_count: u32,
    pub scratch_address: u64,
}

/// Disables back-face culling for an instance.
pub const INSTANCE_TRIANGLE_FACING_CULL_DISABLE: u8 = 0x01;
/// Forces every geometry of an instance to be treated as opaque.
pub const INSTANCE_FORCE_OPAQUE: u8 = 0x04;

/// One TLAS instance, bit-compatible with `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AccelerationStructureInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// Low 24 bits: custom index, high 8 bits: visibility mask.
    pub instance_custom_index_and_mask: u32,
    /// Low 24 bits: SBT record offset, high 8 bits: instance flags.
    pub instance_sbt_offset_and_flags: u32,
    /// Device address of the referenced bottom-level structure.
    pub acceleration_structure_reference: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<AccelerationStructureInstance>(), 64);

impl AccelerationStructureInstance {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(
        transform: [f32; 12],
        custom_index: u32,
        mask: u8,
        sbt_offset: u32,
        flags: u8,
        blas_address: u64,
    ) -> Self {
        Self {
            transform,
            instance_custom_index_and_mask: (custom_index & 0x00FF_FFFF) | ((mask as u32) << 24),
            instance_sbt_offset_and_flags: (sbt_offset & 0x00FF_FFFF) | ((flags as u32) << 24),
            acceleration_structure_reference: blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0x00FF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_record_offset(&self) -> u32 {
        self.instance_sbt_offset_and_flags & 0x00FF_FFFF
    }

    pub fn flags(&self) -> u8 {
        (self.instance_sbt_offset_and_flags >> 24) as u8
    }
}
