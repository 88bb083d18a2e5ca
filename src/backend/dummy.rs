//! Dummy GPU device for testing and development.
//!
//! This device doesn't talk to a GPU. Buffers live in host memory with
//! synthetic device addresses, descriptor pools enforce their declared
//! capacities, and descriptor set contents and acceleration structure builds
//! are recorded so tests can inspect what the resource layer did.

use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::backend::traits::GpuDevice;
use crate::backend::types::*;
use crate::error::{GraphicsError, GraphicsResult};

/// First synthetic device address handed out.
const BASE_DEVICE_ADDRESS: u64 = 0x1_0000;
/// Spacing between synthetic buffer addresses.
const ADDRESS_ALIGNMENT: u64 = 256;

struct DummyBuffer {
    data: Box<[u8]>,
    desc: BufferDescriptor,
    address: u64,
    mapped: bool,
}

struct DummyPool {
    desc: DescriptorPoolDescriptor,
    remaining: HashMap<DescriptorType, u32>,
    live_sets: Vec<u64>,
}

impl DummyPool {
    fn new(desc: DescriptorPoolDescriptor) -> Self {
        let remaining = Self::capacity(&desc);
        Self {
            desc,
            remaining,
            live_sets: Vec::new(),
        }
    }

    fn capacity(desc: &DescriptorPoolDescriptor) -> HashMap<DescriptorType, u32> {
        let mut capacity = HashMap::new();
        for size in &desc.pool_sizes {
            *capacity.entry(size.descriptor_type).or_insert(0) += size.count;
        }
        capacity
    }
}

struct DummySet {
    pool: u64,
    layout: u64,
    bindings: HashMap<u32, DescriptorResources>,
}

struct DummyAccelerationStructure {
    size: u64,
    address: u64,
    built_instances: Option<Vec<AccelerationStructureInstance>>,
}

#[derive(Default)]
struct DummyState {
    buffers: HashMap<u64, DummyBuffer>,
    layouts: HashMap<u64, Vec<LayoutBinding>>,
    pools: HashMap<u64, DummyPool>,
    sets: HashMap<u64, DummySet>,
    acceleration_structures: HashMap<u64, DummyAccelerationStructure>,
    /// Unreleased submissions and the buffers they read or write.
    submissions: HashMap<u64, Vec<u64>>,
    next_id: u64,
    next_address: u64,
    copy_count: usize,
    flush_count: usize,
    invalidate_count: usize,
    build_count: usize,
    premature_destroy_count: usize,
}

impl DummyState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn next_address(&mut self, size: u64) -> u64 {
        if self.next_address == 0 {
            self.next_address = BASE_DEVICE_ADDRESS;
        }
        let address = self.next_address;
        self.next_address += size.div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT + ADDRESS_ALIGNMENT;
        address
    }

    fn buffer(&self, buffer: BufferHandle) -> GraphicsResult<&DummyBuffer> {
        self.buffers
            .get(&buffer.0)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown buffer {:?}", buffer)))
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> GraphicsResult<&mut DummyBuffer> {
        self.buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown buffer {:?}", buffer)))
    }

    /// Id and bytes of the buffer whose address range contains `address`.
    fn read_device_address(&self, address: u64, len: u64) -> GraphicsResult<(u64, &[u8])> {
        self.buffers
            .iter()
            .find(|(_, b)| address >= b.address && address + len <= b.address + b.desc.size)
            .map(|(id, b)| {
                let start = (address - b.address) as usize;
                (*id, &b.data[start..start + len as usize])
            })
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("no buffer backs address {:#x}", address))
            })
    }

    fn submit(&mut self, buffers: Vec<u64>) -> SubmissionHandle {
        let id = self.next_id();
        self.submissions.insert(id, buffers);
        SubmissionHandle(id)
    }
}

/// Resolve a `(offset, size)` pair with the [`WHOLE_SIZE`] convention.
fn resolve_range(total: u64, offset: u64, size: u64) -> GraphicsResult<(u64, u64)> {
    let size = if size == WHOLE_SIZE {
        total.saturating_sub(offset)
    } else {
        size
    };
    if offset.checked_add(size).map_or(true, |end| end > total) {
        return Err(GraphicsError::InvalidParameter(format!(
            "range {}+{} exceeds buffer size {}",
            offset, size, total
        )));
    }
    Ok((offset, size))
}

/// Dummy GPU device.
pub struct DummyDevice {
    state: Mutex<DummyState>,
    uniform_alignment: u64,
    storage_alignment: u64,
    scratch_alignment: u64,
}

impl std::fmt::Debug for DummyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DummyDevice")
            .field("buffers", &state.buffers.len())
            .field("pools", &state.pools.len())
            .field("sets", &state.sets.len())
            .field("acceleration_structures", &state.acceleration_structures.len())
            .finish()
    }
}

impl DummyDevice {
    /// Create a dummy device with typical desktop limits.
    pub fn new() -> Self {
        Self::with_limits(256, 16, 128)
    }

    /// Create a dummy device reporting the given alignment limits.
    pub fn with_limits(uniform_alignment: u64, storage_alignment: u64, scratch_alignment: u64) -> Self {
        Self {
            state: Mutex::new(DummyState::default()),
            uniform_alignment,
            storage_alignment,
            scratch_alignment,
        }
    }

    /// Contents of a buffer as the device sees them.
    pub fn read_buffer(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.0).map(|b| b.data.to_vec())
    }

    /// Memory properties a buffer was created with.
    pub fn buffer_memory(&self, buffer: BufferHandle) -> Option<MemoryProperties> {
        self.state.lock().buffers.get(&buffer.0).map(|b| b.desc.memory)
    }

    /// Bindings last written into a descriptor set.
    pub fn descriptor_set_contents(
        &self,
        set: DescriptorSet,
    ) -> Option<HashMap<u32, DescriptorResources>> {
        self.state.lock().sets.get(&set.0).map(|s| s.bindings.clone())
    }

    /// Layout a live descriptor set was allocated with.
    pub fn descriptor_set_layout_of(&self, set: DescriptorSet) -> Option<DescriptorSetLayoutHandle> {
        self.state
            .lock()
            .sets
            .get(&set.0)
            .map(|s| DescriptorSetLayoutHandle(s.layout))
    }

    /// Whether a descriptor set is still allocated.
    pub fn is_descriptor_set_live(&self, set: DescriptorSet) -> bool {
        self.state.lock().sets.contains_key(&set.0)
    }

    /// Instances recorded by the last build into `acceleration_structure`.
    pub fn built_instances(
        &self,
        acceleration_structure: AccelerationStructureHandle,
    ) -> Option<Vec<AccelerationStructureInstance>> {
        self.state
            .lock()
            .acceleration_structures
            .get(&acceleration_structure.0)
            .and_then(|a| a.built_instances.clone())
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn live_acceleration_structure_count(&self) -> usize {
        self.state.lock().acceleration_structures.len()
    }

    pub fn copy_count(&self) -> usize {
        self.state.lock().copy_count
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flush_count
    }

    pub fn invalidate_count(&self) -> usize {
        self.state.lock().invalidate_count
    }

    pub fn build_count(&self) -> usize {
        self.state.lock().build_count
    }

    /// Submissions not yet released.
    pub fn live_submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Buffers destroyed while an unreleased submission still used them.
    pub fn premature_destroy_count(&self) -> usize {
        self.state.lock().premature_destroy_count
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for DummyDevice {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn min_uniform_buffer_offset_alignment(&self) -> u64 {
        self.uniform_alignment
    }

    fn min_storage_buffer_offset_alignment(&self) -> u64 {
        self.storage_alignment
    }

    fn min_acceleration_structure_scratch_offset_alignment(&self) -> u64 {
        self.scratch_alignment
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> GraphicsResult<BufferHandle> {
        log::trace!(
            "DummyDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        if desc.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".into(),
            ));
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        let address = state.next_address(desc.size);
        state.buffers.insert(
            id,
            DummyBuffer {
                data: vec![0u8; desc.size as usize].into_boxed_slice(),
                desc: desc.clone(),
                address,
                mapped: false,
            },
        );
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        log::trace!("DummyDevice: destroying buffer {:?}", buffer);
        let mut state = self.state.lock();
        if state.submissions.values().any(|used| used.contains(&buffer.0)) {
            log::error!("DummyDevice: buffer {:?} destroyed while a submission uses it", buffer);
            state.premature_destroy_count += 1;
        }
        state.buffers.remove(&buffer.0);
    }

    fn map_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> GraphicsResult<NonNull<u8>> {
        let mut state = self.state.lock();
        let entry = state.buffer_mut(buffer)?;
        if !entry.desc.memory.contains(MemoryProperties::HOST_VISIBLE) {
            return Err(GraphicsError::MemoryNotHostVisible);
        }
        let (offset, _) = resolve_range(entry.desc.size, offset, size)?;
        entry.mapped = true;
        // The boxed slice never reallocates, so the pointer outlives map calls.
        let ptr = unsafe { entry.data.as_mut_ptr().add(offset as usize) };
        NonNull::new(ptr).ok_or(GraphicsError::BufferNotMapped)
    }

    fn unmap_buffer(&self, buffer: BufferHandle) {
        if let Some(entry) = self.state.lock().buffers.get_mut(&buffer.0) {
            entry.mapped = false;
        }
    }

    fn flush_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let entry = state.buffer(buffer)?;
        if !entry.mapped {
            return Err(GraphicsError::BufferNotMapped);
        }
        resolve_range(entry.desc.size, offset, size)?;
        state.flush_count += 1;
        Ok(())
    }

    fn invalidate_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let entry = state.buffer(buffer)?;
        if !entry.mapped {
            return Err(GraphicsError::BufferNotMapped);
        }
        resolve_range(entry.desc.size, offset, size)?;
        state.invalidate_count += 1;
        Ok(())
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> GraphicsResult<u64> {
        let state = self.state.lock();
        let entry = state.buffer(buffer)?;
        if !entry.desc.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS) {
            return Err(GraphicsError::InvalidParameter(
                "buffer was not created with SHADER_DEVICE_ADDRESS usage".into(),
            ));
        }
        Ok(entry.address)
    }

    fn copy_buffer(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> GraphicsResult<SubmissionHandle> {
        log::trace!("DummyDevice: copying {} bytes {:?} -> {:?}", size, src, dst);
        let mut state = self.state.lock();
        let source = state.buffer(src)?;
        if size > source.desc.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "copy of {} bytes exceeds source size {}",
                size, source.desc.size
            )));
        }
        let bytes = source.data[..size as usize].to_vec();
        let destination = state.buffer_mut(dst)?;
        if size > destination.desc.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "copy of {} bytes exceeds destination size {}",
                size, destination.desc.size
            )));
        }
        destination.data[..size as usize].copy_from_slice(&bytes);
        state.copy_count += 1;
        Ok(state.submit(vec![src.0, dst.0]))
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> GraphicsResult<DescriptorSetLayoutHandle> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.layouts.insert(id, bindings.to_vec());
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        self.state.lock().layouts.remove(&layout.0);
    }

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDescriptor,
    ) -> GraphicsResult<DescriptorPoolHandle> {
        log::trace!(
            "DummyDevice: creating descriptor pool (max sets: {})",
            desc.max_sets
        );
        if desc.max_sets == 0 {
            return Err(GraphicsError::InvalidParameter(
                "descriptor pool max_sets must be non-zero".into(),
            ));
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        state.pools.insert(id, DummyPool::new(desc.clone()));
        Ok(DescriptorPoolHandle(id))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state.lock();
        if let Some(removed) = state.pools.remove(&pool.0) {
            for set in removed.live_sets {
                state.sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> GraphicsResult<DescriptorSet> {
        let mut state = self.state.lock();
        let bindings = state
            .layouts
            .get(&layout.0)
            .cloned()
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown layout {:?}", layout)))?;
        let id = state.next_id();
        let entry = state
            .pools
            .get_mut(&pool.0)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown pool {:?}", pool)))?;

        if entry.live_sets.len() as u32 >= entry.desc.max_sets {
            return Err(GraphicsError::OutOfPoolMemory);
        }
        let mut needed: HashMap<DescriptorType, u32> = HashMap::new();
        for binding in &bindings {
            *needed.entry(binding.descriptor_type).or_insert(0) += binding.count;
        }
        let fits = needed
            .iter()
            .all(|(ty, count)| entry.remaining.get(ty).copied().unwrap_or(0) >= *count);
        if !fits {
            return Err(GraphicsError::OutOfPoolMemory);
        }
        for (ty, count) in &needed {
            if let Some(remaining) = entry.remaining.get_mut(ty) {
                *remaining -= count;
            }
        }
        entry.live_sets.push(id);
        state.sets.insert(
            id,
            DummySet {
                pool: pool.0,
                layout: layout.0,
                bindings: HashMap::new(),
            },
        );
        Ok(DescriptorSet(id))
    }

    fn free_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        sets: &[DescriptorSet],
    ) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let flags = state
            .pools
            .get(&pool.0)
            .map(|p| p.desc.flags)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown pool {:?}", pool)))?;
        if !flags.contains(DescriptorPoolFlags::FREE_DESCRIPTOR_SET) {
            return Err(GraphicsError::InvalidParameter(
                "pool was not created with FREE_DESCRIPTOR_SET".into(),
            ));
        }
        for set in sets {
            let Some(removed) = state.sets.remove(&set.0) else {
                continue;
            };
            let bindings = state.layouts.get(&removed.layout).cloned().unwrap_or_default();
            if let Some(entry) = state.pools.get_mut(&removed.pool) {
                entry.live_sets.retain(|id| *id != set.0);
                for binding in bindings {
                    *entry.remaining.entry(binding.descriptor_type).or_insert(0) += binding.count;
                }
            }
        }
        Ok(())
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .pools
            .get_mut(&pool.0)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown pool {:?}", pool)))?;
        entry.remaining = DummyPool::capacity(&entry.desc);
        let released: Vec<u64> = entry.live_sets.drain(..).collect();
        for set in released {
            state.sets.remove(&set);
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        for write in writes {
            match state.sets.get_mut(&write.set.0) {
                Some(set) => {
                    set.bindings.insert(write.binding, write.resources.clone());
                }
                None => log::warn!("DummyDevice: write to unknown set {:?}", write.set),
            }
        }
    }

    fn top_level_build_sizes(&self, instance_count: u32) -> AccelerationStructureBuildSizes {
        let count = instance_count as u64;
        AccelerationStructureBuildSizes {
            acceleration_structure_size: 1024 + count * 128,
            build_scratch_size: 512 + count * 64,
            update_scratch_size: 256 + count * 32,
        }
    }

    fn create_top_level_acceleration_structure(
        &self,
        buffer: BufferHandle,
        size: u64,
    ) -> GraphicsResult<AccelerationStructureHandle> {
        let mut state = self.state.lock();
        let backing = state.buffer(buffer)?;
        if !backing
            .desc
            .usage
            .contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE)
        {
            return Err(GraphicsError::InvalidParameter(
                "backing buffer lacks ACCELERATION_STRUCTURE_STORAGE usage".into(),
            ));
        }
        if size > backing.desc.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "acceleration structure size {} exceeds backing buffer size {}",
                size, backing.desc.size
            )));
        }
        let address = backing.address;
        let id = state.next_id();
        state.acceleration_structures.insert(
            id,
            DummyAccelerationStructure {
                size,
                address,
                built_instances: None,
            },
        );
        Ok(AccelerationStructureHandle(id))
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: AccelerationStructureHandle) {
        self.state
            .lock()
            .acceleration_structures
            .remove(&acceleration_structure.0);
    }

    fn acceleration_structure_device_address(
        &self,
        acceleration_structure: AccelerationStructureHandle,
    ) -> u64 {
        self.state
            .lock()
            .acceleration_structures
            .get(&acceleration_structure.0)
            .map(|a| a.address)
            .unwrap_or(0)
    }

    fn build_top_level(&self, build: &TopLevelBuild) -> GraphicsResult<SubmissionHandle> {
        log::trace!(
            "DummyDevice: building TLAS {:?} over {} instances",
            build.destination,
            build.instance_count
        );
        if build.scratch_address % self.scratch_alignment.max(1) != 0 {
            return Err(GraphicsError::AccelerationStructureBuildFailed(format!(
                "scratch address {:#x} is not {}-byte aligned",
                build.scratch_address, self.scratch_alignment
            )));
        }
        let mut state = self.state.lock();
        let required = self.top_level_build_sizes(build.instance_count);
        let mut used = Vec::new();
        let instances = if build.instance_count == 0 {
            Vec::new()
        } else {
            let len = build.instance_count as u64 * AccelerationStructureInstance::SIZE;
            let (id, bytes) = state.read_device_address(build.instance_buffer_address, len)?;
            used.push(id);
            bytes
                .chunks_exact(AccelerationStructureInstance::SIZE as usize)
                .map(bytemuck::pod_read_unaligned::<AccelerationStructureInstance>)
                .collect()
        };
        let (scratch, _) =
            state.read_device_address(build.scratch_address, required.build_scratch_size)?;
        used.push(scratch);
        let target = state
            .acceleration_structures
            .get_mut(&build.destination.0)
            .ok_or_else(|| {
                GraphicsError::AccelerationStructureBuildFailed(format!(
                    "unknown destination {:?}",
                    build.destination
                ))
            })?;
        if target.size < required.acceleration_structure_size {
            return Err(GraphicsError::AccelerationStructureBuildFailed(format!(
                "destination holds {} bytes, build needs {}",
                target.size, required.acceleration_structure_size
            )));
        }
        target.built_instances = Some(instances);
        state.build_count += 1;
        Ok(state.submit(used))
    }

    fn is_submission_complete(&self, submission: SubmissionHandle) -> bool {
        // Work executes inline, so every known submission has completed.
        self.state.lock().submissions.contains_key(&submission.0)
    }

    fn wait_submission(&self, submission: SubmissionHandle) -> GraphicsResult<()> {
        if self.state.lock().submissions.contains_key(&submission.0) {
            Ok(())
        } else {
            Err(GraphicsError::InvalidParameter(format!(
                "unknown submission {:?}",
                submission
            )))
        }
    }

    fn release_submission(&self, submission: SubmissionHandle) {
        self.state.lock().submissions.remove(&submission.0);
    }
}
