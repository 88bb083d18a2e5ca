//! GPU buffer with aligned per-element addressing

use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::{
    BufferDescriptor, BufferHandle, BufferInfo, BufferUsage, GpuDevice, MemoryProperties,
    WHOLE_SIZE,
};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::Submission;

/// Active host mapping of a buffer range.
#[derive(Debug, Clone, Copy)]
struct Mapping {
    ptr: NonNull<u8>,
    offset: u64,
    size: u64,
}

/// A buffer of `instance_count` elements, each `instance_size` bytes at a
/// stride of `alignment_size`.
///
/// The buffer exclusively owns its device memory and releases it on drop,
/// unmapping first if needed.
pub struct Buffer {
    device: Arc<dyn GpuDevice>,
    handle: BufferHandle,
    mapping: Option<Mapping>,
    instance_size: u64,
    instance_count: u32,
    alignment_size: u64,
    buffer_size: u64,
    usage: BufferUsage,
    memory: MemoryProperties,
}

// SAFETY: the mapped pointer is only dereferenced through `&mut self` or
// `&self` methods of the owning buffer, and backends are `Send + Sync`.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("instance_size", &self.instance_size)
            .field("instance_count", &self.instance_count)
            .field("alignment_size", &self.alignment_size)
            .field("mapped", &self.mapping.is_some())
            .finish()
    }
}

impl Buffer {
    /// Round `instance_size` up to a multiple of `min_offset_alignment`.
    ///
    /// An alignment of 0 leaves the size unchanged. Non-zero alignments are
    /// powers of two, as every device limit is.
    pub fn get_alignment(instance_size: u64, min_offset_alignment: u64) -> u64 {
        if min_offset_alignment > 0 {
            (instance_size + min_offset_alignment - 1) & !(min_offset_alignment - 1)
        } else {
            instance_size
        }
    }

    /// Smallest offset alignment that lets every element of a buffer with
    /// `usage` be bound as its own uniform or storage descriptor range.
    pub fn descriptor_offset_alignment(device: &dyn GpuDevice, usage: BufferUsage) -> u64 {
        let mut alignment = 1;
        if usage.contains(BufferUsage::UNIFORM) {
            alignment = alignment.max(device.min_uniform_buffer_offset_alignment());
        }
        if usage.contains(BufferUsage::STORAGE) {
            alignment = alignment.max(device.min_storage_buffer_offset_alignment());
        }
        alignment
    }

    pub fn new(
        device: Arc<dyn GpuDevice>,
        instance_size: u64,
        instance_count: u32,
        usage: BufferUsage,
        memory: MemoryProperties,
        min_offset_alignment: u64,
    ) -> GraphicsResult<Self> {
        Self::with_label(
            device,
            "buffer",
            instance_size,
            instance_count,
            usage,
            memory,
            min_offset_alignment,
        )
    }

    /// Create a buffer whose allocation carries a debug label.
    pub fn with_label(
        device: Arc<dyn GpuDevice>,
        label: &str,
        instance_size: u64,
        instance_count: u32,
        usage: BufferUsage,
        memory: MemoryProperties,
        min_offset_alignment: u64,
    ) -> GraphicsResult<Self> {
        let alignment_size = Self::get_alignment(instance_size, min_offset_alignment);
        let buffer_size = alignment_size * instance_count as u64;
        let handle = device.create_buffer(
            &BufferDescriptor::new(buffer_size, usage, memory).with_label(label),
        )?;
        log::trace!(
            "Created buffer '{}' ({} x {} bytes, stride {})",
            label,
            instance_count,
            instance_size,
            alignment_size
        );

        Ok(Self {
            device,
            handle,
            mapping: None,
            instance_size,
            instance_count,
            alignment_size,
            buffer_size,
            usage,
            memory,
        })
    }

    /// Upload `bytes` into a fresh device-local buffer through a staging buffer.
    ///
    /// `TRANSFER_DST` is added to `usage`. The copy is submitted without
    /// waiting; the returned [`Submission`] owns the staging buffer and must
    /// be kept until the GPU has consumed it.
    pub fn upload_device_local(
        device: &Arc<dyn GpuDevice>,
        bytes: &[u8],
        instance_size: u64,
        instance_count: u32,
        usage: BufferUsage,
    ) -> GraphicsResult<(Self, Submission)> {
        let mut staging = Buffer::with_label(
            Arc::clone(device),
            "staging",
            instance_size,
            instance_count,
            BufferUsage::TRANSFER_SRC,
            MemoryProperties::STAGING,
            1,
        )?;
        staging.map(WHOLE_SIZE, 0)?;
        staging.write_to_buffer(bytes, WHOLE_SIZE, 0)?;
        staging.unmap();

        let destination = Buffer::with_label(
            Arc::clone(device),
            "device-local",
            instance_size,
            instance_count,
            usage | BufferUsage::TRANSFER_DST,
            MemoryProperties::DEVICE_LOCAL,
            1,
        )?;
        let handle = device.copy_buffer(staging.handle, destination.handle, staging.buffer_size)?;
        let mut submission = Submission::new(Arc::clone(device), handle);
        submission.keep_alive(staging);
        Ok((destination, submission))
    }

    /// Map `size` bytes (or [`WHOLE_SIZE`]) starting at `offset`.
    pub fn map(&mut self, size: u64, offset: u64) -> GraphicsResult<()> {
        if self.mapping.is_some() {
            self.unmap();
        }
        let ptr = self.device.map_buffer(self.handle, offset, size)?;
        let size = if size == WHOLE_SIZE {
            self.buffer_size - offset
        } else {
            size
        };
        self.mapping = Some(Mapping { ptr, offset, size });
        Ok(())
    }

    pub fn unmap(&mut self) {
        if self.mapping.take().is_some() {
            self.device.unmap_buffer(self.handle);
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Pointer to byte `offset` of the buffer for `len` bytes inside the mapping.
    fn mapped_ptr(&self, offset: u64, len: u64) -> GraphicsResult<*mut u8> {
        let mapping = self.mapping.ok_or(GraphicsError::BufferNotMapped)?;
        assert!(
            offset >= mapping.offset && offset + len <= mapping.offset + mapping.size,
            "range {}+{} is outside the mapped range {}+{}",
            offset,
            len,
            mapping.offset,
            mapping.size
        );
        // SAFETY: the range was checked against the live mapping above.
        Ok(unsafe { mapping.ptr.as_ptr().add((offset - mapping.offset) as usize) })
    }

    /// Copy `data` into the mapped buffer.
    ///
    /// With `size == WHOLE_SIZE` the whole of `data` lands at the start of the
    /// buffer; otherwise the first `size` bytes of `data` land at `offset`.
    pub fn write_to_buffer(&mut self, data: &[u8], size: u64, offset: u64) -> GraphicsResult<()> {
        let (len, offset) = if size == WHOLE_SIZE {
            assert!(
                data.len() as u64 <= self.buffer_size,
                "{} bytes do not fit in a {} byte buffer",
                data.len(),
                self.buffer_size
            );
            (data.len() as u64, 0)
        } else {
            assert!(size <= data.len() as u64, "write of {} bytes from a {} byte slice", size, data.len());
            (size, offset)
        };
        let dst = self.mapped_ptr(offset, len)?;
        // SAFETY: `dst` addresses `len` mapped bytes and `data` holds at least `len` bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, len as usize) };
        Ok(())
    }

    /// Read `size` bytes (or the whole buffer) at `offset` from the mapping.
    pub fn read_from_buffer(&self, size: u64, offset: u64) -> GraphicsResult<Vec<u8>> {
        let (len, offset) = if size == WHOLE_SIZE {
            (self.buffer_size, 0)
        } else {
            (size, offset)
        };
        let src = self.mapped_ptr(offset, len)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: `src` addresses `len` mapped bytes.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len as usize) };
        Ok(out)
    }

    /// Make host writes visible to the device. Only needed for non-coherent memory.
    pub fn flush(&self, size: u64, offset: u64) -> GraphicsResult<()> {
        if self.mapping.is_none() {
            return Err(GraphicsError::BufferNotMapped);
        }
        self.device.flush_buffer(self.handle, offset, size)
    }

    /// Make device writes visible to the host. Only needed for non-coherent memory.
    pub fn invalidate(&self, size: u64, offset: u64) -> GraphicsResult<()> {
        if self.mapping.is_none() {
            return Err(GraphicsError::BufferNotMapped);
        }
        self.device.invalidate_buffer(self.handle, offset, size)
    }

    pub fn descriptor_info(&self, size: u64, offset: u64) -> BufferInfo {
        BufferInfo {
            buffer: self.handle,
            offset,
            range: size,
        }
    }

    fn index_offset(&self, index: u32) -> u64 {
        assert!(
            index < self.instance_count,
            "index {} out of range for {} instances",
            index,
            self.instance_count
        );
        index as u64 * self.alignment_size
    }

    /// Write one element at `index`; `data` may not exceed the element size.
    pub fn write_to_index(&mut self, data: &[u8], index: u32) -> GraphicsResult<()> {
        assert!(
            data.len() as u64 <= self.instance_size,
            "{} bytes exceed the element size {}",
            data.len(),
            self.instance_size
        );
        let offset = self.index_offset(index);
        self.write_to_buffer(data, data.len() as u64, offset)
    }

    /// Read the `instance_size` bytes of element `index`.
    pub fn read_from_index(&self, index: u32) -> GraphicsResult<Vec<u8>> {
        let offset = self.index_offset(index);
        self.read_from_buffer(self.instance_size, offset)
    }

    pub fn flush_index(&self, index: u32) -> GraphicsResult<()> {
        self.flush(self.alignment_size, self.index_offset(index))
    }

    pub fn invalidate_index(&self, index: u32) -> GraphicsResult<()> {
        self.invalidate(self.alignment_size, self.index_offset(index))
    }

    pub fn descriptor_info_for_index(&self, index: u32) -> BufferInfo {
        self.descriptor_info(self.alignment_size, self.index_offset(index))
    }

    /// GPU virtual address; requires `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> GraphicsResult<u64> {
        self.device.buffer_device_address(self.handle)
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn instance_size(&self) -> u64 {
        self.instance_size
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn alignment_size(&self) -> u64 {
        self.alignment_size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn memory_properties(&self) -> MemoryProperties {
        self.memory
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.unmap();
        self.device.destroy_buffer(self.handle);
    }
}
