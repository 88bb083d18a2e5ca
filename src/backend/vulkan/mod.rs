//! Vulkan backend implementation using ash
//!
//! [`VulkanDevice`] wraps a logical device created by the application. It
//! owns every buffer, descriptor object and acceleration structure created
//! through it, but not the `ash::Device` itself: drop the `VulkanDevice`
//! before destroying the device.

mod conversion;

use std::collections::HashMap;
use std::ptr::NonNull;

use ash::khr::acceleration_structure;
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;

use crate::backend::traits::GpuDevice;
use crate::backend::types::*;
use crate::error::{GraphicsError, GraphicsResult};

use conversion::map_result;

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
    memory: MemoryProperties,
}

/// Submitted command buffer and the fence it signals.
struct PendingSubmission {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

#[derive(Debug, Clone, Copy)]
struct DeviceLimits {
    min_uniform_buffer_offset_alignment: u64,
    min_storage_buffer_offset_alignment: u64,
    min_acceleration_structure_scratch_offset_alignment: u64,
    non_coherent_atom_size: u64,
}

struct VulkanState {
    allocator: Option<Allocator>,
    buffers: HashMap<u64, VkBuffer>,
    layouts: HashMap<u64, vk::DescriptorSetLayout>,
    pools: HashMap<u64, vk::DescriptorPool>,
    /// Set id -> (owning pool id, set).
    sets: HashMap<u64, (u64, vk::DescriptorSet)>,
    acceleration_structures: HashMap<u64, vk::AccelerationStructureKHR>,
    submissions: HashMap<u64, PendingSubmission>,
    next_id: u64,
}

impl VulkanState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, buffer: BufferHandle) -> GraphicsResult<&VkBuffer> {
        self.buffers
            .get(&buffer.0)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown buffer {:?}", buffer)))
    }

    fn pool(&self, pool: DescriptorPoolHandle) -> GraphicsResult<vk::DescriptorPool> {
        self.pools
            .get(&pool.0)
            .copied()
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown pool {:?}", pool)))
    }
}

/// Vulkan implementation of [`GpuDevice`].
pub struct VulkanDevice {
    device: ash::Device,
    acceleration_structure_fn: acceleration_structure::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    limits: DeviceLimits,
    state: Mutex<VulkanState>,
}

impl VulkanDevice {
    /// Wrap an application-created device.
    ///
    /// The device must have `bufferDeviceAddress` and
    /// `VK_KHR_acceleration_structure` enabled, and `queue` must support
    /// compute or graphics work.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
    ) -> GraphicsResult<Self> {
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut as_properties);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };
        let device_limits = properties.properties.limits;
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: device_limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: device_limits.min_storage_buffer_offset_alignment,
            min_acceleration_structure_scratch_offset_alignment: as_properties
                .min_acceleration_structure_scratch_offset_alignment
                as u64,
            non_coherent_atom_size: device_limits.non_coherent_atom_size,
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings::default(),
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GraphicsError::InitializationFailed(e.to_string()))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| GraphicsError::InitializationFailed(e.to_string()))?
        };

        let acceleration_structure_fn = acceleration_structure::Device::new(instance, &device);

        log::info!(
            "Vulkan device ready (uniform align {}, storage align {}, scratch align {})",
            limits.min_uniform_buffer_offset_alignment,
            limits.min_storage_buffer_offset_alignment,
            limits.min_acceleration_structure_scratch_offset_alignment
        );

        Ok(Self {
            device,
            acceleration_structure_fn,
            queue,
            command_pool,
            limits,
            state: Mutex::new(VulkanState {
                allocator: Some(allocator),
                buffers: HashMap::new(),
                layouts: HashMap::new(),
                pools: HashMap::new(),
                sets: HashMap::new(),
                acceleration_structures: HashMap::new(),
                submissions: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Raw Vulkan buffer behind a handle.
    pub fn raw_buffer(&self, buffer: BufferHandle) -> Option<vk::Buffer> {
        self.state.lock().buffers.get(&buffer.0).map(|b| b.buffer)
    }

    /// Raw Vulkan descriptor set behind a handle, for binding in command buffers.
    pub fn raw_descriptor_set(&self, set: DescriptorSet) -> Option<vk::DescriptorSet> {
        self.state.lock().sets.get(&set.0).map(|(_, s)| *s)
    }

    /// Raw Vulkan layout behind a handle, for pipeline layout creation.
    pub fn raw_descriptor_set_layout(
        &self,
        layout: DescriptorSetLayoutHandle,
    ) -> Option<vk::DescriptorSetLayout> {
        self.state.lock().layouts.get(&layout.0).copied()
    }

    /// Record commands into a one-time command buffer and submit it with a
    /// fresh fence. Returns without waiting for the GPU.
    ///
    /// The caller passes the locked state, which also guards the command pool.
    fn submit_one_shot(
        &self,
        state: &mut VulkanState,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> GraphicsResult<SubmissionHandle> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| map_result(e, "allocate command buffer"))?[0];

            let fence = match self
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)
            {
                Ok(fence) => fence,
                Err(e) => {
                    self.device.free_command_buffers(self.command_pool, &[cmd]);
                    return Err(map_result(e, "create fence"));
                }
            };

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            let result = self
                .device
                .begin_command_buffer(cmd, &begin_info)
                .and_then(|_| {
                    record(cmd);
                    self.device.end_command_buffer(cmd)
                })
                .and_then(|_| {
                    let cmds = [cmd];
                    let submit_info = vk::SubmitInfo::default().command_buffers(&cmds);
                    self.device.queue_submit(self.queue, &[submit_info], fence)
                });

            if let Err(e) = result {
                self.device.destroy_fence(fence, None);
                self.device.free_command_buffers(self.command_pool, &[cmd]);
                return Err(map_result(e, "submit"));
            }

            let id = state.next_id();
            state.submissions.insert(
                id,
                PendingSubmission {
                    command_buffer: cmd,
                    fence,
                },
            );
            Ok(SubmissionHandle(id))
        }
    }

    fn top_level_geometry<'a>(instance_buffer_address: u64) -> vk::AccelerationStructureGeometryKHR<'a> {
        let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer_address,
            });
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn min_uniform_buffer_offset_alignment(&self) -> u64 {
        self.limits.min_uniform_buffer_offset_alignment
    }

    fn min_storage_buffer_offset_alignment(&self) -> u64 {
        self.limits.min_storage_buffer_offset_alignment
    }

    fn min_acceleration_structure_scratch_offset_alignment(&self) -> u64 {
        self.limits.min_acceleration_structure_scratch_offset_alignment
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> GraphicsResult<BufferHandle> {
        if desc.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".into(),
            ));
        }
        let mut state = self.state.lock();
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(desc.size)
                .usage(conversion::buffer_usage(desc.usage))
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| map_result(e, "create buffer"))?;

            let requirements = self.device.get_buffer_memory_requirements(buffer);

            let allocated = state
                .allocator
                .as_mut()
                .ok_or_else(|| GraphicsError::ResourceCreationFailed("Allocator not available".into()))
                .and_then(|allocator| {
                    allocator
                        .allocate(&AllocationCreateDesc {
                            name: desc.label.as_deref().unwrap_or("buffer"),
                            requirements,
                            location: conversion::memory_location(desc.memory),
                            linear: true,
                            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                        })
                        .map_err(|e| GraphicsError::ResourceCreationFailed(e.to_string()))
                });
            let allocation = match allocated {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };

            if let Err(e) =
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                if let Some(allocator) = state.allocator.as_mut() {
                    let _ = allocator.free(allocation);
                }
                return Err(map_result(e, "bind buffer memory"));
            }

            let id = state.next_id();
            state.buffers.insert(
                id,
                VkBuffer {
                    buffer,
                    allocation,
                    size: desc.size,
                    memory: desc.memory,
                },
            );
            log::trace!("Vulkan: created buffer {} ({:?}, {} bytes)", id, desc.label, desc.size);
            Ok(BufferHandle(id))
        }
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(vk_buffer) = state.buffers.remove(&buffer.0) {
            unsafe {
                self.device.destroy_buffer(vk_buffer.buffer, None);
            }
            if let Some(allocator) = state.allocator.as_mut() {
                let _ = allocator.free(vk_buffer.allocation);
            }
        }
    }

    fn map_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> GraphicsResult<NonNull<u8>> {
        let state = self.state.lock();
        let vk_buffer = state.buffer(buffer)?;
        if !vk_buffer.memory.contains(MemoryProperties::HOST_VISIBLE) {
            return Err(GraphicsError::MemoryNotHostVisible);
        }
        let in_range = offset <= vk_buffer.size
            && (size == WHOLE_SIZE || offset.checked_add(size).is_some_and(|end| end <= vk_buffer.size));
        if !in_range {
            return Err(GraphicsError::InvalidParameter(format!(
                "map range {}+{} exceeds buffer size {}",
                offset, size, vk_buffer.size
            )));
        }
        // gpu-allocator keeps host-visible blocks persistently mapped.
        let base = vk_buffer
            .allocation
            .mapped_ptr()
            .ok_or(GraphicsError::BufferNotMapped)?;
        let ptr = unsafe { base.cast::<u8>().as_ptr().add(offset as usize) };
        NonNull::new(ptr).ok_or(GraphicsError::BufferNotMapped)
    }

    fn unmap_buffer(&self, _buffer: BufferHandle) {}

    fn flush_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> GraphicsResult<()> {
        let state = self.state.lock();
        let vk_buffer = state.buffer(buffer)?;
        let allocation = &vk_buffer.allocation;
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let range = mapped_range(allocation, offset, size, self.limits.non_coherent_atom_size);
        unsafe {
            self.device
                .flush_mapped_memory_ranges(&[range])
                .map_err(|e| map_result(e, "flush"))
        }
    }

    fn invalidate_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> GraphicsResult<()> {
        let state = self.state.lock();
        let vk_buffer = state.buffer(buffer)?;
        let allocation = &vk_buffer.allocation;
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let range = mapped_range(allocation, offset, size, self.limits.non_coherent_atom_size);
        unsafe {
            self.device
                .invalidate_mapped_memory_ranges(&[range])
                .map_err(|e| map_result(e, "invalidate"))
        }
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> GraphicsResult<u64> {
        let state = self.state.lock();
        let vk_buffer = state.buffer(buffer)?;
        let info = vk::BufferDeviceAddressInfo::default().buffer(vk_buffer.buffer);
        Ok(unsafe { self.device.get_buffer_device_address(&info) })
    }

    fn copy_buffer(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> GraphicsResult<SubmissionHandle> {
        let mut state = self.state.lock();
        let src_buffer = state.buffer(src)?.buffer;
        let dst_buffer = state.buffer(dst)?.buffer;
        let region = vk::BufferCopy::default().size(size);
        // Later work on this queue sees the copied bytes.
        let memory_barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ);
        self.submit_one_shot(&mut state, |cmd| unsafe {
            self.device
                .cmd_copy_buffer(cmd, src_buffer, dst_buffer, std::slice::from_ref(&region));
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> GraphicsResult<DescriptorSetLayoutHandle> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(conversion::descriptor_type(b.descriptor_type))
                    .descriptor_count(b.count)
                    .stage_flags(conversion::shader_stages(b.stages))
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);

        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| map_result(e, "create descriptor set layout"))?
        };

        let mut state = self.state.lock();
        let id = state.next_id();
        state.layouts.insert(id, layout);
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        if let Some(vk_layout) = self.state.lock().layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(vk_layout, None) };
        }
    }

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDescriptor,
    ) -> GraphicsResult<DescriptorPoolHandle> {
        let sizes: Vec<vk::DescriptorPoolSize> = desc
            .pool_sizes
            .iter()
            .filter(|s| s.count > 0)
            .map(|s| vk::DescriptorPoolSize {
                ty: conversion::descriptor_type(s.descriptor_type),
                descriptor_count: s.count,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(conversion::pool_flags(desc.flags))
            .max_sets(desc.max_sets)
            .pool_sizes(&sizes);

        let pool = unsafe {
            self.device
                .create_descriptor_pool(&pool_info, None)
                .map_err(|e| map_result(e, "create descriptor pool"))?
        };

        let mut state = self.state.lock();
        let id = state.next_id();
        state.pools.insert(id, pool);
        log::trace!("Vulkan: created descriptor pool {} (max sets {})", id, desc.max_sets);
        Ok(DescriptorPoolHandle(id))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state.lock();
        if let Some(vk_pool) = state.pools.remove(&pool.0) {
            state.sets.retain(|_, (owner, _)| *owner != pool.0);
            unsafe { self.device.destroy_descriptor_pool(vk_pool, None) };
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> GraphicsResult<DescriptorSet> {
        let mut state = self.state.lock();
        let vk_pool = state.pool(pool)?;
        let vk_layout = state
            .layouts
            .get(&layout.0)
            .copied()
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown layout {:?}", layout)))?;

        let layouts = [vk_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk_pool)
            .set_layouts(&layouts);
        let set = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| map_result(e, "allocate descriptor set"))?[0]
        };

        let id = state.next_id();
        state.sets.insert(id, (pool.0, set));
        Ok(DescriptorSet(id))
    }

    fn free_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        sets: &[DescriptorSet],
    ) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let vk_pool = state.pool(pool)?;
        let vk_sets: Vec<vk::DescriptorSet> = sets
            .iter()
            .filter_map(|set| state.sets.remove(&set.0).map(|(_, s)| s))
            .collect();
        if vk_sets.is_empty() {
            return Ok(());
        }
        unsafe {
            self.device
                .free_descriptor_sets(vk_pool, &vk_sets)
                .map_err(|e| map_result(e, "free descriptor sets"))
        }
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let vk_pool = state.pool(pool)?;
        state.sets.retain(|_, (owner, _)| *owner != pool.0);
        unsafe {
            self.device
                .reset_descriptor_pool(vk_pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(|e| map_result(e, "reset descriptor pool"))
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let state = self.state.lock();

        // Info arrays must outlive the write structs that point at them.
        let mut buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::new();
        let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        let mut acceleration_structures: Vec<(vk::DescriptorSet, &DescriptorWrite, Vec<vk::AccelerationStructureKHR>)> =
            Vec::new();
        let mut targets: Vec<(vk::DescriptorSet, &DescriptorWrite)> = Vec::new();

        for write in writes {
            let Some(&(_, set)) = state.sets.get(&write.set.0) else {
                log::warn!("Vulkan: skipping write to unknown descriptor set {:?}", write.set);
                continue;
            };
            match &write.resources {
                DescriptorResources::Buffers(infos) => {
                    buffer_infos.push(
                        infos
                            .iter()
                            .filter_map(|info| {
                                state.buffers.get(&info.buffer.0).map(|b| vk::DescriptorBufferInfo {
                                    buffer: b.buffer,
                                    offset: info.offset,
                                    range: if info.range == WHOLE_SIZE {
                                        vk::WHOLE_SIZE
                                    } else {
                                        info.range
                                    },
                                })
                            })
                            .collect(),
                    );
                    targets.push((set, write));
                }
                DescriptorResources::Images(infos) => {
                    image_infos.push(
                        infos
                            .iter()
                            .map(|info| vk::DescriptorImageInfo {
                                sampler: info
                                    .sampler
                                    .map(|s| vk::Sampler::from_raw(s.0))
                                    .unwrap_or_else(vk::Sampler::null),
                                image_view: vk::ImageView::from_raw(info.view.0),
                                image_layout: conversion::image_layout(info.layout),
                            })
                            .collect(),
                    );
                    targets.push((set, write));
                }
                DescriptorResources::AccelerationStructures(handles) => {
                    let raw = handles
                        .iter()
                        .filter_map(|h| state.acceleration_structures.get(&h.0).copied())
                        .collect();
                    acceleration_structures.push((set, write, raw));
                }
            }
        }

        let mut next_buffer = buffer_infos.iter();
        let mut next_image = image_infos.iter();
        let vk_writes: Vec<vk::WriteDescriptorSet> = targets
            .iter()
            .filter_map(|(set, write)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(conversion::descriptor_type(write.descriptor_type));
                match write.resources {
                    DescriptorResources::Buffers(_) => next_buffer.next().map(|i| base.buffer_info(i)),
                    DescriptorResources::Images(_) => next_image.next().map(|i| base.image_info(i)),
                    DescriptorResources::AccelerationStructures(_) => None,
                }
            })
            .collect();

        unsafe {
            if !vk_writes.is_empty() {
                self.device.update_descriptor_sets(&vk_writes, &[]);
            }

            // Acceleration structure writes carry their payload in a pNext chain.
            for (set, write, raw) in &acceleration_structures {
                let mut as_write_info =
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(raw);
                let as_write = vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .descriptor_count(raw.len() as u32)
                    .push_next(&mut as_write_info);
                self.device.update_descriptor_sets(&[as_write], &[]);
            }
        }
    }

    fn top_level_build_sizes(&self, instance_count: u32) -> AccelerationStructureBuildSizes {
        let geometry = Self::top_level_geometry(0);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.acceleration_structure_fn.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
                &mut sizes,
            );
        }
        AccelerationStructureBuildSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }

    fn create_top_level_acceleration_structure(
        &self,
        buffer: BufferHandle,
        size: u64,
    ) -> GraphicsResult<AccelerationStructureHandle> {
        let mut state = self.state.lock();
        let vk_buffer = state.buffer(buffer)?.buffer;
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(vk_buffer)
            .offset(0)
            .size(size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);

        let acceleration_structure = unsafe {
            self.acceleration_structure_fn
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| map_result(e, "create acceleration structure"))?
        };

        let id = state.next_id();
        state.acceleration_structures.insert(id, acceleration_structure);
        Ok(AccelerationStructureHandle(id))
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: AccelerationStructureHandle) {
        if let Some(raw) = self
            .state
            .lock()
            .acceleration_structures
            .remove(&acceleration_structure.0)
        {
            unsafe {
                self.acceleration_structure_fn
                    .destroy_acceleration_structure(raw, None)
            };
        }
    }

    fn acceleration_structure_device_address(
        &self,
        acceleration_structure: AccelerationStructureHandle,
    ) -> u64 {
        let state = self.state.lock();
        let Some(&raw) = state.acceleration_structures.get(&acceleration_structure.0) else {
            return 0;
        };
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(raw);
        unsafe {
            self.acceleration_structure_fn
                .get_acceleration_structure_device_address(&info)
        }
    }

    fn build_top_level(&self, build: &TopLevelBuild) -> GraphicsResult<SubmissionHandle> {
        let mut state = self.state.lock();
        let destination = state
            .acceleration_structures
            .get(&build.destination.0)
            .copied()
            .ok_or_else(|| {
                GraphicsError::AccelerationStructureBuildFailed(format!(
                    "unknown destination {:?}",
                    build.destination
                ))
            })?;

        let geometry = Self::top_level_geometry(build.instance_buffer_address);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(destination)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: build.scratch_address,
            });
        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(build.instance_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        // Bottom-level builds and instance uploads must land before the TLAS reads them.
        let memory_barrier = vk::MemoryBarrier::default()
            .src_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags::TRANSFER_WRITE,
            )
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            );

        // Tracing work submitted after the build sees the finished TLAS.
        let build_barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR);

        let submission = self
            .submit_one_shot(&mut state, |cmd| unsafe {
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                        | vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[memory_barrier],
                    &[],
                    &[],
                );
                self.acceleration_structure_fn.cmd_build_acceleration_structures(
                    cmd,
                    std::slice::from_ref(&build_info),
                    &[std::slice::from_ref(&build_range)],
                );
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[build_barrier],
                    &[],
                    &[],
                );
            })
            .map_err(|e| GraphicsError::AccelerationStructureBuildFailed(e.to_string()))?;

        drop(state);
        log::trace!("Vulkan: submitted TLAS build over {} instances", build.instance_count);
        Ok(submission)
    }

    fn is_submission_complete(&self, submission: SubmissionHandle) -> bool {
        let state = self.state.lock();
        match state.submissions.get(&submission.0) {
            Some(pending) => unsafe { self.device.get_fence_status(pending.fence) }.unwrap_or(false),
            None => false,
        }
    }

    fn wait_submission(&self, submission: SubmissionHandle) -> GraphicsResult<()> {
        let fence = self
            .state
            .lock()
            .submissions
            .get(&submission.0)
            .map(|pending| pending.fence)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("unknown submission {:?}", submission))
            })?;
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(|e| map_result(e, "wait for submission"))
        }
    }

    fn release_submission(&self, submission: SubmissionHandle) {
        let mut state = self.state.lock();
        let Some(pending) = state.submissions.remove(&submission.0) else {
            return;
        };
        unsafe {
            if let Err(e) = self.device.wait_for_fences(&[pending.fence], true, u64::MAX) {
                log::error!("Vulkan: waiting on submission {:?} failed: {:?}", submission, e);
            }
            self.device.destroy_fence(pending.fence, None);
            self.device
                .free_command_buffers(self.command_pool, &[pending.command_buffer]);
        }
    }
}

/// Expand a buffer-relative range to a `vk::MappedMemoryRange` aligned to the
/// non-coherent atom size.
fn mapped_range(
    allocation: &Allocation,
    offset: u64,
    size: u64,
    atom: u64,
) -> vk::MappedMemoryRange<'static> {
    let atom = atom.max(1);
    let begin = allocation.offset() + offset;
    let start = begin / atom * atom;
    let size = if size == WHOLE_SIZE {
        vk::WHOLE_SIZE
    } else {
        (begin + size - start).div_ceil(atom) * atom
    };
    vk::MappedMemoryRange::default()
        .memory(unsafe { allocation.memory() })
        .offset(start)
        .size(size)
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, pending) in state.submissions.drain() {
                self.device.destroy_fence(pending.fence, None);
                self.device
                    .free_command_buffers(self.command_pool, &[pending.command_buffer]);
            }

            for (_, raw) in state.acceleration_structures.drain() {
                self.acceleration_structure_fn
                    .destroy_acceleration_structure(raw, None);
            }

            let buffers: Vec<VkBuffer> = state.buffers.drain().map(|(_, b)| b).collect();
            for buffer in buffers {
                self.device.destroy_buffer(buffer.buffer, None);
                if let Some(allocator) = state.allocator.as_mut() {
                    let _ = allocator.free(buffer.allocation);
                }
            }

            // Sets are released with their pools.
            state.sets.clear();
            for (_, pool) in state.pools.drain() {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, layout) in state.layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }

            // Drop the allocator before the application destroys the device
            drop(state.allocator.take());

            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
