//! Growable descriptor allocator
//!
//! Pools are grouped in [`PoolSet`]s: one persistent set for descriptor sets
//! that live for the whole session and one per frame slot for transient
//! sets. When a pool runs out it is parked on the full list and the next
//! allocation comes from a recycled or freshly created, larger pool.

use std::sync::Arc;

use crate::backend::{DescriptorPoolDescriptor, DescriptorPoolFlags, DescriptorSet, DescriptorType, GpuDevice, PoolSize};
use crate::descriptors::{DescriptorPool, DescriptorSetLayout};
use crate::error::{GraphicsError, GraphicsResult};
use crate::MAX_FRAMES_IN_FLIGHT;

/// Descriptors of one type reserved per set in each pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSizeRatio {
    pub descriptor_type: DescriptorType,
    pub ratio: f32,
}

impl PoolSizeRatio {
    pub fn new(descriptor_type: DescriptorType, ratio: f32) -> Self {
        Self {
            descriptor_type,
            ratio,
        }
    }
}

/// Configuration for [`GrowableDescriptorAllocator`].
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorAllocatorConfig {
    /// Set capacity of the first pool in every pool set.
    pub initial_sets: u32,
    /// Multiplier applied to the set capacity each time a pool is created.
    pub growth_factor: f32,
    /// Upper bound on the set capacity of a single pool.
    pub max_sets_per_pool: u32,
    pub ratios: Vec<PoolSizeRatio>,
    pub pool_flags: DescriptorPoolFlags,
}

impl Default for DescriptorAllocatorConfig {
    fn default() -> Self {
        Self {
            initial_sets: MAX_FRAMES_IN_FLIGHT as u32,
            growth_factor: 1.5,
            max_sets_per_pool: 4092,
            ratios: vec![
                PoolSizeRatio::new(DescriptorType::UniformBuffer, 1.0),
                PoolSizeRatio::new(DescriptorType::CombinedImageSampler, 5.0),
                PoolSizeRatio::new(DescriptorType::StorageBuffer, 1.0),
                PoolSizeRatio::new(DescriptorType::AccelerationStructure, 1.0),
            ],
            pool_flags: DescriptorPoolFlags::empty(),
        }
    }
}

impl DescriptorAllocatorConfig {
    pub fn validate(&self) -> GraphicsResult<()> {
        if self.initial_sets == 0 {
            return Err(GraphicsError::InvalidConfiguration(
                "initial_sets must be non-zero".into(),
            ));
        }
        if self.growth_factor.is_nan() || self.growth_factor <= 1.0 {
            return Err(GraphicsError::InvalidConfiguration(format!(
                "growth_factor must exceed 1, got {}",
                self.growth_factor
            )));
        }
        if self.max_sets_per_pool < self.initial_sets {
            return Err(GraphicsError::InvalidConfiguration(format!(
                "max_sets_per_pool {} is below initial_sets {}",
                self.max_sets_per_pool, self.initial_sets
            )));
        }
        if self.ratios.is_empty() {
            return Err(GraphicsError::InvalidConfiguration(
                "at least one pool size ratio is required".into(),
            ));
        }
        if let Some(bad) = self.ratios.iter().find(|r| r.ratio.is_nan() || r.ratio <= 0.0) {
            return Err(GraphicsError::InvalidConfiguration(format!(
                "ratio for {:?} must be positive, got {}",
                bad.descriptor_type, bad.ratio
            )));
        }
        Ok(())
    }

    fn pool_descriptor(&self, max_sets: u32) -> DescriptorPoolDescriptor {
        DescriptorPoolDescriptor {
            max_sets,
            flags: self.pool_flags,
            pool_sizes: self
                .ratios
                .iter()
                .map(|r| PoolSize {
                    descriptor_type: r.descriptor_type,
                    count: ((r.ratio * max_sets as f32) as u32).max(1),
                })
                .collect(),
        }
    }

    fn grow(&self, sets: u32) -> u32 {
        let grown = (sets as f32 * self.growth_factor).ceil() as u32;
        grown.clamp(sets, self.max_sets_per_pool)
    }
}

/// Pool counts of one [`PoolSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSetStats {
    pub ready_pools: usize,
    pub full_pools: usize,
    /// Set capacity of the largest pool created so far.
    pub largest_pool_sets: u32,
    /// Set capacity the next created pool will get.
    pub next_pool_sets: u32,
}

/// Snapshot of the allocator's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorAllocatorStats {
    pub persistent: PoolSetStats,
    pub frames: [PoolSetStats; MAX_FRAMES_IN_FLIGHT],
}

impl DescriptorAllocatorStats {
    pub fn total_pools(&self) -> usize {
        std::iter::once(&self.persistent)
            .chain(self.frames.iter())
            .map(|s| s.ready_pools + s.full_pools)
            .sum()
    }
}

/// Ready and full pools plus the size of the next pool to create.
struct PoolSet {
    ready: Vec<DescriptorPool>,
    full: Vec<DescriptorPool>,
    next_pool_sets: u32,
    largest_pool_sets: u32,
}

impl PoolSet {
    fn new(initial_sets: u32) -> Self {
        Self {
            ready: Vec::new(),
            full: Vec::new(),
            next_pool_sets: initial_sets,
            largest_pool_sets: 0,
        }
    }

    fn take_pool(
        &mut self,
        device: &Arc<dyn GpuDevice>,
        config: &DescriptorAllocatorConfig,
    ) -> GraphicsResult<DescriptorPool> {
        if let Some(pool) = self.ready.pop() {
            return Ok(pool);
        }
        let sets = self.next_pool_sets;
        let pool = DescriptorPool::new(Arc::clone(device), config.pool_descriptor(sets))?;
        log::debug!("Created descriptor pool {:?} with {} sets", pool.handle(), sets);
        self.largest_pool_sets = self.largest_pool_sets.max(sets);
        self.next_pool_sets = config.grow(sets);
        Ok(pool)
    }

    /// Allocate from `pool` and file it back as ready or full. The pool is
    /// kept on every outcome, so its live sets survive a failed call.
    fn allocate_from(
        &mut self,
        pool: DescriptorPool,
        layout: &DescriptorSetLayout,
    ) -> GraphicsResult<Option<DescriptorSet>> {
        match pool.allocate_descriptor_set(layout) {
            Ok(Some(set)) => {
                self.ready.push(pool);
                Ok(Some(set))
            }
            Ok(None) => {
                self.full.push(pool);
                Ok(None)
            }
            Err(e) => {
                self.ready.push(pool);
                Err(e)
            }
        }
    }

    fn allocate(
        &mut self,
        device: &Arc<dyn GpuDevice>,
        config: &DescriptorAllocatorConfig,
        layout: &DescriptorSetLayout,
    ) -> GraphicsResult<DescriptorSet> {
        let pool = self.take_pool(device, config)?;
        if let Some(set) = self.allocate_from(pool, layout)? {
            return Ok(set);
        }

        let pool = self.take_pool(device, config)?;
        let sets = pool.max_sets();
        match self.allocate_from(pool, layout)? {
            Some(set) => Ok(set),
            None => Err(GraphicsError::DescriptorPoolExhausted(format!(
                "layout {:?} does not fit a fresh pool of {} sets",
                layout.handle(),
                sets
            ))),
        }
    }

    /// Reset every pool. A pool moves from full to ready only after its own
    /// reset succeeded, so an error leaves every pool owned.
    fn reset(&mut self) -> GraphicsResult<()> {
        for pool in &self.ready {
            pool.reset_pool()?;
        }
        while let Some(pool) = self.full.last() {
            pool.reset_pool()?;
            if let Some(pool) = self.full.pop() {
                self.ready.push(pool);
            }
        }
        Ok(())
    }

    fn stats(&self) -> PoolSetStats {
        PoolSetStats {
            ready_pools: self.ready.len(),
            full_pools: self.full.len(),
            largest_pool_sets: self.largest_pool_sets,
            next_pool_sets: self.next_pool_sets,
        }
    }
}

/// Descriptor allocator that grows its pools on exhaustion.
///
/// It is the sole owner of every pool it creates; callers only receive set
/// handles.
pub struct GrowableDescriptorAllocator {
    device: Arc<dyn GpuDevice>,
    config: DescriptorAllocatorConfig,
    persistent: PoolSet,
    frames: [PoolSet; MAX_FRAMES_IN_FLIGHT],
}

impl std::fmt::Debug for GrowableDescriptorAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableDescriptorAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl GrowableDescriptorAllocator {
    pub fn new(device: Arc<dyn GpuDevice>, config: DescriptorAllocatorConfig) -> GraphicsResult<Self> {
        config.validate()?;
        let initial_sets = config.initial_sets;
        Ok(Self {
            device,
            config,
            persistent: PoolSet::new(initial_sets),
            frames: std::array::from_fn(|_| PoolSet::new(initial_sets)),
        })
    }

    /// Allocate a set that stays valid for the allocator's lifetime.
    pub fn allocate(&mut self, layout: &DescriptorSetLayout) -> GraphicsResult<DescriptorSet> {
        self.persistent.allocate(&self.device, &self.config, layout)
    }

    /// Allocate a transient set recycled by the next `begin_frame(slot)`.
    pub fn allocate_for_frame(
        &mut self,
        slot: usize,
        layout: &DescriptorSetLayout,
    ) -> GraphicsResult<DescriptorSet> {
        self.frames[slot % MAX_FRAMES_IN_FLIGHT].allocate(&self.device, &self.config, layout)
    }

    /// Reset every pool of `slot` and make the full ones ready again.
    ///
    /// Call only after waiting for the GPU work last submitted from `slot`.
    pub fn begin_frame(&mut self, slot: usize) -> GraphicsResult<()> {
        self.frames[slot % MAX_FRAMES_IN_FLIGHT].reset()
    }

    pub fn stats(&self) -> DescriptorAllocatorStats {
        DescriptorAllocatorStats {
            persistent: self.persistent.stats(),
            frames: std::array::from_fn(|i| self.frames[i].stats()),
        }
    }

    pub fn config(&self) -> &DescriptorAllocatorConfig {
        &self.config
    }
}
