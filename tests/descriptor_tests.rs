//! Descriptor integration tests: pool capacity, allocator growth and writes.

mod common;

use std::sync::Arc;

use common::TestContext;
use rt_scene_core::backend::{
    BufferUsage, DescriptorResources, DescriptorType, ImageInfo, ImageLayout, ImageViewHandle,
    MemoryProperties, SamplerHandle, ShaderStages,
};
use rt_scene_core::descriptors::DescriptorAllocatorConfig;
use rt_scene_core::{Buffer, DescriptorPool, DescriptorSetLayout, DescriptorWriter, GraphicsError};

// ============================================================================
// Pools
// ============================================================================

#[test]
fn test_pool_capacity_boundary() {
    let ctx = TestContext::new();
    let layout = ctx.single_binding_layout(DescriptorType::UniformBuffer, 1);
    let pool = DescriptorPool::builder(Arc::clone(&ctx.device))
        .set_max_sets(3)
        .add_pool_size(DescriptorType::UniformBuffer, 3)
        .build()
        .unwrap();

    for _ in 0..3 {
        assert!(pool.allocate_descriptor_set(&layout).unwrap().is_some());
    }
    assert!(pool.allocate_descriptor_set(&layout).unwrap().is_none());

    pool.reset_pool().unwrap();
    assert!(pool.allocate_descriptor_set(&layout).unwrap().is_some());
}

// ============================================================================
// Growable allocator
// ============================================================================

#[test]
fn test_allocator_grows_past_exhausted_pool() {
    let ctx = TestContext::new();
    let layout = ctx.single_binding_layout(DescriptorType::StorageBuffer, 1);
    let mut allocator = ctx.allocator(DescriptorAllocatorConfig::default());

    let mut previous_largest = 0;
    for round in 0..4 {
        let before = allocator.stats().persistent;
        // Fill every set the allocator has reserved so far, plus one.
        let capacity = before.largest_pool_sets.max(before.next_pool_sets);
        for _ in 0..=capacity {
            allocator.allocate(&layout).unwrap();
        }
        let after = allocator.stats().persistent;
        if round > 0 {
            assert!(
                after.largest_pool_sets as f32 >= (previous_largest as f32 * 1.5).floor(),
                "pool of {} sets did not grow from {}",
                after.largest_pool_sets,
                previous_largest
            );
        }
        previous_largest = after.largest_pool_sets;
    }
    assert!(allocator.stats().persistent.full_pools > 0);
}

#[test]
fn test_allocator_reports_layout_that_never_fits() {
    let ctx = TestContext::new();
    let layout = ctx.single_binding_layout(DescriptorType::UniformBuffer, 64);
    let mut allocator = ctx.allocator(DescriptorAllocatorConfig::default());

    let result = allocator.allocate(&layout);
    assert!(matches!(result, Err(GraphicsError::DescriptorPoolExhausted(_))));
    // One original pool and exactly one retry.
    assert_eq!(allocator.stats().persistent.full_pools, 2);
}

#[test]
fn test_failed_allocation_keeps_pool_and_sets() {
    let ctx = TestContext::new();
    let layout = ctx.single_binding_layout(DescriptorType::UniformBuffer, 1);
    let mut allocator = ctx.allocator(DescriptorAllocatorConfig::default());
    let first = allocator.allocate(&layout).unwrap();
    let pools_before = ctx.dummy.live_pool_count();

    // A layout this device never created: its id is past every id handed out here.
    let other = TestContext::new();
    let foreign = (0..64)
        .map(|_| other.single_binding_layout(DescriptorType::UniformBuffer, 1))
        .last()
        .unwrap();
    let result = allocator.allocate(&foreign);
    assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));

    assert_eq!(ctx.dummy.live_pool_count(), pools_before);
    assert!(ctx.dummy.is_descriptor_set_live(first));
    assert_eq!(allocator.stats().persistent.ready_pools, 1);
    // The kept pool still serves allocations.
    allocator.allocate(&layout).unwrap();
    assert_eq!(ctx.dummy.live_pool_count(), pools_before);
}

#[test]
fn test_frame_sets_are_recycled() {
    let ctx = TestContext::new();
    let layout = ctx.single_binding_layout(DescriptorType::UniformBuffer, 1);
    let mut allocator = ctx.allocator(DescriptorAllocatorConfig::default());

    let first = allocator.allocate_for_frame(0, &layout).unwrap();
    assert!(ctx.dummy.is_descriptor_set_live(first));
    allocator.begin_frame(1).unwrap();
    assert!(ctx.dummy.is_descriptor_set_live(first));
    allocator.begin_frame(0).unwrap();
    assert!(!ctx.dummy.is_descriptor_set_live(first));
    assert_eq!(allocator.stats().frames[0].ready_pools, 1);
}

// ============================================================================
// Writer
// ============================================================================

fn material_layout(ctx: &TestContext) -> Arc<DescriptorSetLayout> {
    DescriptorSetLayout::builder(Arc::clone(&ctx.device))
        .add_binding(0, DescriptorType::UniformBuffer, ShaderStages::FRAGMENT, 1)
        .add_binding(1, DescriptorType::CombinedImageSampler, ShaderStages::FRAGMENT, 1)
        .build()
        .unwrap()
}

fn albedo() -> ImageInfo {
    ImageInfo {
        sampler: Some(SamplerHandle::from_raw(3)),
        view: ImageViewHandle::from_raw(9),
        layout: ImageLayout::ShaderReadOnly,
    }
}

#[test]
fn test_writer_builds_and_overwrites() {
    let ctx = TestContext::new();
    let layout = material_layout(&ctx);
    let pool = DescriptorPool::builder(Arc::clone(&ctx.device))
        .set_max_sets(4)
        .add_pool_size(DescriptorType::UniformBuffer, 4)
        .add_pool_size(DescriptorType::CombinedImageSampler, 4)
        .build()
        .unwrap();
    let uniforms = Buffer::new(
        Arc::clone(&ctx.device),
        64,
        1,
        BufferUsage::UNIFORM,
        MemoryProperties::STAGING,
        256,
    )
    .unwrap();
    let info = uniforms.descriptor_info(64, 0);

    let set = DescriptorWriter::new(&layout)
        .write_buffer(0, info)
        .write_image(1, albedo())
        .build(&pool)
        .unwrap()
        .unwrap();

    let contents = ctx.dummy.descriptor_set_contents(set).unwrap();
    assert_eq!(contents[&0], DescriptorResources::Buffers(vec![info]));
    assert_eq!(contents[&1], DescriptorResources::Images(vec![albedo()]));
    assert_eq!(ctx.dummy.descriptor_set_layout_of(set), Some(layout.handle()));

    for _ in 0..2 {
        DescriptorWriter::new(&layout)
            .write_buffer(0, info)
            .write_image(1, albedo())
            .overwrite(set);
        assert_eq!(ctx.dummy.descriptor_set_contents(set).unwrap(), contents);
    }
}

#[test]
fn test_writer_keeps_writes_when_pool_is_full() {
    let ctx = TestContext::new();
    let layout = material_layout(&ctx);
    let pool = DescriptorPool::builder(Arc::clone(&ctx.device))
        .set_max_sets(1)
        .add_pool_size(DescriptorType::UniformBuffer, 1)
        .add_pool_size(DescriptorType::CombinedImageSampler, 1)
        .build()
        .unwrap();
    let uniforms = Buffer::new(
        Arc::clone(&ctx.device),
        64,
        1,
        BufferUsage::UNIFORM,
        MemoryProperties::STAGING,
        0,
    )
    .unwrap();
    pool.allocate_descriptor_set(&layout).unwrap().unwrap();

    let mut writer = DescriptorWriter::new(&layout);
    writer
        .write_buffer(0, uniforms.descriptor_info(64, 0))
        .write_image(1, albedo());
    assert_eq!(writer.build(&pool).unwrap(), None);
    assert_eq!(writer.pending_writes(), 2);

    pool.reset_pool().unwrap();
    let set = writer.build(&pool).unwrap().unwrap();
    assert_eq!(writer.pending_writes(), 0);
    assert_eq!(ctx.dummy.descriptor_set_contents(set).unwrap().len(), 2);
}

#[test]
#[should_panic(expected = "Layout does not contain binding 5")]
fn test_writer_rejects_unknown_binding() {
    let ctx = TestContext::new();
    let layout = material_layout(&ctx);
    DescriptorWriter::new(&layout).write_image(5, albedo());
}
