//! Buffer integration tests: element alignment, indexed access and uploads.

mod common;

use std::sync::Arc;

use rstest::rstest;

use common::TestContext;
use rt_scene_core::backend::{BufferUsage, MemoryProperties, WHOLE_SIZE};
use rt_scene_core::{Buffer, DummyDevice, GpuDevice, GraphicsError};

// ============================================================================
// Alignment
// ============================================================================

#[rstest]
fn test_element_stride(
    #[values(1, 12, 48, 64, 100)] instance_size: u64,
    #[values(0, 1, 4, 16, 256)] min_offset_alignment: u64,
) {
    let ctx = TestContext::new();
    let buffer = Buffer::new(
        Arc::clone(&ctx.device),
        instance_size,
        3,
        BufferUsage::UNIFORM,
        MemoryProperties::STAGING,
        min_offset_alignment,
    )
    .unwrap();

    let stride = buffer.alignment_size();
    assert!(stride >= instance_size);
    if min_offset_alignment > 0 {
        assert_eq!(stride % min_offset_alignment, 0);
        assert!(stride < instance_size + min_offset_alignment);
    } else {
        assert_eq!(stride, instance_size);
    }
    assert_eq!(buffer.buffer_size(), stride * 3);
}

// ============================================================================
// Indexed access
// ============================================================================

#[test]
fn test_index_writes_do_not_overlap() {
    let ctx = TestContext::new();
    let mut buffer = Buffer::new(
        Arc::clone(&ctx.device),
        12,
        4,
        BufferUsage::STORAGE,
        MemoryProperties::STAGING,
        16,
    )
    .unwrap();
    buffer.map(WHOLE_SIZE, 0).unwrap();

    for index in 0..4u32 {
        buffer.write_to_index(&[index as u8 + 1; 12], index).unwrap();
    }
    buffer.write_to_index(&[0xEE; 12], 2).unwrap();

    assert_eq!(buffer.read_from_index(0).unwrap(), vec![1; 12]);
    assert_eq!(buffer.read_from_index(1).unwrap(), vec![2; 12]);
    assert_eq!(buffer.read_from_index(2).unwrap(), vec![0xEE; 12]);
    assert_eq!(buffer.read_from_index(3).unwrap(), vec![4; 12]);

    let info = buffer.descriptor_info_for_index(3);
    assert_eq!(info.offset, 48);
    assert_eq!(info.range, 16);

    buffer.unmap();
    let memory = ctx.dummy.read_buffer(buffer.handle()).unwrap();
    // Padding between elements is never written.
    assert!(memory[12..16].iter().all(|b| *b == 0));
    assert_eq!(&memory[32..44], &[0xEE; 12]);
}

#[test]
fn test_flush_requires_mapping() {
    let ctx = TestContext::new();
    let mut buffer = Buffer::new(
        Arc::clone(&ctx.device),
        64,
        1,
        BufferUsage::UNIFORM,
        MemoryProperties::HOST_VISIBLE,
        0,
    )
    .unwrap();

    assert_eq!(buffer.flush(WHOLE_SIZE, 0), Err(GraphicsError::BufferNotMapped));
    buffer.map(WHOLE_SIZE, 0).unwrap();
    buffer.write_to_buffer(&[7; 64], WHOLE_SIZE, 0).unwrap();
    buffer.flush_index(0).unwrap();
    assert_eq!(ctx.dummy.flush_count(), 1);
}

#[test]
fn test_invalidate_requires_mapping_and_range() {
    let ctx = TestContext::new();
    let mut buffer = Buffer::new(
        Arc::clone(&ctx.device),
        40,
        3,
        BufferUsage::STORAGE,
        MemoryProperties::STAGING,
        64,
    )
    .unwrap();

    assert_eq!(buffer.invalidate(WHOLE_SIZE, 0), Err(GraphicsError::BufferNotMapped));
    assert_eq!(buffer.invalidate_index(0), Err(GraphicsError::BufferNotMapped));

    buffer.map(WHOLE_SIZE, 0).unwrap();
    buffer.invalidate(WHOLE_SIZE, 0).unwrap();
    // Last element spans [128, 192) at a 64-byte stride.
    buffer.invalidate_index(2).unwrap();
    assert_eq!(ctx.dummy.invalidate_count(), 2);

    assert!(matches!(
        buffer.invalidate(64, buffer.buffer_size()),
        Err(GraphicsError::InvalidParameter(_))
    ));
    assert_eq!(ctx.dummy.invalidate_count(), 2);
}

#[test]
#[should_panic(expected = "out of range")]
fn test_invalidate_index_past_end_panics() {
    let ctx = TestContext::new();
    let mut buffer = Buffer::new(
        Arc::clone(&ctx.device),
        16,
        2,
        BufferUsage::STORAGE,
        MemoryProperties::STAGING,
        0,
    )
    .unwrap();
    buffer.map(WHOLE_SIZE, 0).unwrap();
    let _ = buffer.invalidate_index(2);
}

#[rstest]
#[case(BufferUsage::UNIFORM, 256)]
#[case(BufferUsage::STORAGE, 64)]
#[case(BufferUsage::UNIFORM | BufferUsage::STORAGE, 256)]
#[case(BufferUsage::TRANSFER_SRC, 1)]
fn test_descriptor_offset_alignment(#[case] usage: BufferUsage, #[case] expected: u64) {
    let dummy = Arc::new(DummyDevice::with_limits(256, 64, 128));
    let device: Arc<dyn GpuDevice> = dummy.clone();
    let alignment = Buffer::descriptor_offset_alignment(device.as_ref(), usage);
    assert_eq!(alignment, expected);

    let buffer = Buffer::new(device, 20, 4, usage, MemoryProperties::STAGING, alignment).unwrap();
    for index in 0..4 {
        assert_eq!(buffer.descriptor_info_for_index(index).offset % expected, 0);
    }
}

#[test]
fn test_device_local_memory_cannot_be_mapped() {
    let ctx = TestContext::new();
    let mut buffer = Buffer::new(
        Arc::clone(&ctx.device),
        64,
        1,
        BufferUsage::STORAGE,
        MemoryProperties::DEVICE_LOCAL,
        0,
    )
    .unwrap();
    assert_eq!(buffer.map(WHOLE_SIZE, 0), Err(GraphicsError::MemoryNotHostVisible));
    assert!(!buffer.is_mapped());
}

// ============================================================================
// Uploads
// ============================================================================

#[test]
fn test_upload_device_local_releases_staging() {
    let ctx = TestContext::new();
    let bytes: Vec<u8> = (0..96u8).collect();

    let (buffer, submission) =
        Buffer::upload_device_local(&ctx.device, &bytes, 48, 2, BufferUsage::STORAGE).unwrap();

    // Staging stays alive until the copy is released.
    assert_eq!(ctx.dummy.live_buffer_count(), 2);
    assert_eq!(ctx.dummy.live_submission_count(), 1);
    submission.wait().unwrap();
    drop(submission);
    assert_eq!(ctx.dummy.live_buffer_count(), 1);
    assert_eq!(ctx.dummy.live_submission_count(), 0);
    assert_eq!(ctx.dummy.premature_destroy_count(), 0);
    assert_eq!(ctx.dummy.copy_count(), 1);
    assert_eq!(ctx.dummy.buffer_memory(buffer.handle()), Some(MemoryProperties::DEVICE_LOCAL));
    assert!(buffer.usage().contains(BufferUsage::STORAGE | BufferUsage::TRANSFER_DST));
    assert_eq!(ctx.dummy.read_buffer(buffer.handle()).unwrap(), bytes);

    drop(buffer);
    assert_eq!(ctx.dummy.live_buffer_count(), 0);
}
