//! Transient uniform data for one frame slot.
//!
//! Each frame slot owns one host-visible [`UniformRingBuffer`]. Draws bump
//! allocate aligned ranges out of it during recording; the whole buffer is
//! rewound when the slot is reused, which only happens after the slot's
//! fence proved the GPU finished reading the previous contents.
//!
//! ```text
//! slot 0: [cam][obj0][obj1][obj2].........   <- frame N recording
//! slot 1: [cam][obj0]......................   <- frame N-1 in flight
//! ```

use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::error::{RhiError, RhiResult};
use crate::resource::Buffer;

/// A range handed out by [`UniformRingBuffer::allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformAllocation {
    pub offset: u64,
    pub size: u64,
}

impl UniformAllocation {
    /// Offset as a dynamic uniform buffer offset.
    pub fn dynamic_offset(&self) -> u32 {
        self.offset as u32
    }
}

/// Bump allocator over one host-visible uniform buffer.
#[derive(Debug)]
pub struct UniformRingBuffer {
    buffer: Arc<Buffer>,
    alignment: u64,
    head: Mutex<u64>,
}

impl UniformRingBuffer {
    /// Wraps `buffer`; every allocation starts at a multiple of `alignment`.
    pub fn new(buffer: Arc<Buffer>, alignment: u64) -> Self {
        Self {
            buffer,
            alignment: alignment.max(1),
            head: Mutex::new(0),
        }
    }

    /// Reserves `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::RingBufferExhausted`] when the remaining space is too small.
    pub fn allocate(&self, size: u64) -> RhiResult<UniformAllocation> {
        let mut head = self.head.lock();
        let offset = head.next_multiple_of(self.alignment);
        let capacity = self.buffer.size();
        if offset + size > capacity {
            return Err(RhiError::RingBufferExhausted {
                requested: size,
                available: capacity.saturating_sub(offset),
            });
        }
        *head = offset + size;
        Ok(UniformAllocation { offset, size })
    }

    /// Copies `value` into a fresh allocation.
    pub fn push<T: Pod>(&self, value: &T) -> RhiResult<UniformAllocation> {
        self.push_bytes(bytemuck::bytes_of(value))
    }

    /// Copies `values` contiguously into a fresh allocation.
    pub fn push_slice<T: Pod>(&self, values: &[T]) -> RhiResult<UniformAllocation> {
        self.push_bytes(bytemuck::cast_slice(values))
    }

    fn push_bytes(&self, bytes: &[u8]) -> RhiResult<UniformAllocation> {
        let allocation = self.allocate(bytes.len() as u64)?;
        self.buffer.write(allocation.offset, bytes)?;
        Ok(allocation)
    }

    /// Rewinds to the start. Only valid once the GPU is done with the contents.
    pub fn reset(&self) {
        *self.head.lock() = 0;
    }

    pub fn used(&self) -> u64 {
        *self.head.lock()
    }

    pub fn capacity(&self) -> u64 {
        self.buffer.size()
    }

    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::DeferredDeletionQueue;
    use crate::device::GpuDevice;
    use crate::headless::HeadlessDevice;
    use crate::resource::BufferUsage;

    fn ring(size: u64, alignment: u64) -> UniformRingBuffer {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
        let deletion = Arc::new(DeferredDeletionQueue::new());
        let buffer = Buffer::create(device, deletion, BufferUsage::Uniform.desc("ring", size)).unwrap();
        UniformRingBuffer::new(buffer, alignment)
    }

    #[test]
    fn test_allocations_are_aligned() {
        let ring = ring(1024, 256);
        let a = ring.allocate(16).unwrap();
        let b = ring.allocate(16).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(ring.used(), 272);
    }

    #[test]
    fn test_exhaustion_reports_remaining_space() {
        let ring = ring(512, 256);
        ring.allocate(300).unwrap();
        match ring.allocate(300) {
            Err(RhiError::RingBufferExhausted {
                requested,
                available,
            }) => {
                assert_eq!(requested, 300);
                assert_eq!(available, 0);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_rewinds() {
        let ring = ring(512, 64);
        ring.push(&[1.0f32; 4]).unwrap();
        ring.push(&7u32).unwrap();
        assert!(ring.used() > 0);
        ring.reset();
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.allocate(8).unwrap().offset, 0);
    }

    #[test]
    fn test_push_slice_size() {
        let ring = ring(512, 64);
        let allocation = ring.push_slice(&[0u32; 10]).unwrap();
        assert_eq!(allocation.size, 40);
        assert_eq!(allocation.dynamic_offset(), 0);
    }
}
