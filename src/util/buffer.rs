//! Memory-aligned buffer allocation for O_DIRECT operations.

use std::alloc::{alloc, dealloc, Layout};

/// Heap buffer aligned to a filesystem's required block size, as reported by
/// [`crate::engine::platform::Capabilities::block_size`].
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// # Panics
    /// Panics if `alignment` is not a power of two or `size` is zero.
    pub fn new(size: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "alignment must be a power of 2");
        assert!(size > 0, "buffer size must be greater than 0");

        let layout = Layout::from_size_align(size, alignment).expect("invalid layout parameters");
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }

        AlignedBuffer { ptr, size, layout }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_aligned_to(&self, alignment: usize) -> bool {
        (self.ptr as usize) % alignment == 0
    }

    /// Consumes the buffer into a plain `Vec<u8>` copy, for handing off to
    /// [`crate::engine::FileHandle::write`], which takes owned buffers.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr, self.layout);
        }
    }
}

unsafe impl Send for AlignedBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_aligned_memory() {
        let buf = AlignedBuffer::new(4096, 512);
        assert_eq!(buf.len(), 4096);
        assert!(buf.is_aligned_to(512));
    }

    #[test]
    fn mutates_through_slice() {
        let mut buf = AlignedBuffer::new(1024, 512);
        buf.as_mut_slice().fill(0xab);
        assert!(buf.as_slice().iter().all(|&b| b == 0xab));
    }
}
