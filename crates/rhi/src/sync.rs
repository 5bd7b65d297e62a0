//! Pooled synchronization primitives.
//!
//! This module provides recyclable pools of synchronization objects:
//! - [`FenceManager`] - GPU-to-CPU completion flags handed to command buffers
//! - [`SemaphoreManager`] - binary GPU-to-GPU ordering semaphores
//! - [`TimelineSemaphore`] - a single monotonic counter that orders many submissions
//!
//! # Overview
//!
//! Fences and binary semaphores are cheap to keep around and expensive to
//! create in the hot path, so both managers keep a free list. `get_or_create`
//! pops from the free list or creates a fresh primitive; `return_*` moves a
//! primitive from the in-use set back to the free list.
//!
//! A fence is owned by exactly one command buffer while that buffer is in
//! flight; the [`CommandBufferManager`](crate::command::CommandBufferManager)
//! pairs each buffer with its own fence for the buffer's whole life.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::headless::HeadlessDevice;
//! use ember_rhi::sync::FenceManager;
//!
//! # fn example() -> Result<(), ember_rhi::RhiError> {
//! let device = Arc::new(HeadlessDevice::new());
//! let fences = FenceManager::new(device);
//!
//! let fence = fences.get_or_create()?;
//! assert!(fences.is_signaled(fence)?);
//! fences.return_fence(fence);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::types::SemaphoreKind;

/// Timeout used for steady-state waits. Device loss surfaces as an error instead.
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Free list plus in-use set shared by both managers.
#[derive(Default)]
struct Pool<H> {
    free: Vec<H>,
    in_use: HashSet<H>,
}

impl<H: Copy + Eq + std::hash::Hash> Pool<H> {
    fn pop_free(&mut self) -> Option<H> {
        let handle = self.free.pop()?;
        self.in_use.insert(handle);
        Some(handle)
    }

    fn release(&mut self, handle: H) -> bool {
        if self.in_use.remove(&handle) {
            self.free.push(handle);
            true
        } else {
            false
        }
    }

    fn drain(&mut self) -> impl Iterator<Item = H> + '_ {
        self.free.drain(..).chain(self.in_use.drain())
    }
}

/// Recycling pool of fences.
///
/// New fences are created in the signaled state so a buffer that has never
/// been submitted is immediately reclaimable.
///
/// # Thread Safety
///
/// Internally locked; a single manager is shared by every command buffer
/// manager of a context.
pub struct FenceManager {
    device: Arc<dyn GpuDevice>,
    pool: Mutex<Pool<vk::Fence>>,
}

impl FenceManager {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            pool: Mutex::new(Pool::default()),
        }
    }

    /// Pops a fence from the free list, or creates a new signaled one.
    ///
    /// # Errors
    ///
    /// Returns an error if native fence creation fails.
    pub fn get_or_create(&self) -> RhiResult<vk::Fence> {
        let mut pool = self.pool.lock();
        if let Some(fence) = pool.pop_free() {
            return Ok(fence);
        }

        let fence = self.device.create_fence(true)?;
        pool.in_use.insert(fence);
        debug!("Created fence {:?} ({} in use)", fence, pool.in_use.len());
        Ok(fence)
    }

    /// Moves `fence` from the in-use set back to the free list.
    pub fn return_fence(&self, fence: vk::Fence) {
        if !self.pool.lock().release(fence) {
            warn!("Returned fence {:?} that is not in use", fence);
        }
    }

    /// Non-blocking completion check.
    pub fn is_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.device.fence_status(fence)
    }

    /// Blocks until `fence` is signaled.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] if `timeout_ns` elapses first, or the
    /// device error if the device is lost.
    pub fn wait(&self, fence: vk::Fence, timeout_ns: u64) -> RhiResult<()> {
        self.device.wait_for_fences(&[fence], timeout_ns)
    }

    /// Unsignals `fence` ahead of a submission.
    pub fn reset(&self, fence: vk::Fence) -> RhiResult<()> {
        self.device.reset_fences(&[fence])
    }

    pub fn in_use_count(&self) -> usize {
        self.pool.lock().in_use.len()
    }

    pub fn free_count(&self) -> usize {
        self.pool.lock().free.len()
    }
}

impl Drop for FenceManager {
    fn drop(&mut self) {
        let mut pool = self.pool.lock();
        let mut count = 0;
        for fence in pool.drain() {
            self.device.destroy_fence(fence);
            count += 1;
        }
        info!("Fence manager destroyed ({} fences)", count);
    }
}

/// Recycling pool of binary semaphores, plus a factory for timeline semaphores.
pub struct SemaphoreManager {
    device: Arc<dyn GpuDevice>,
    pool: Mutex<Pool<vk::Semaphore>>,
}

impl SemaphoreManager {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            pool: Mutex::new(Pool::default()),
        }
    }

    /// Pops a binary semaphore from the free list, or creates a new one.
    pub fn get_or_create(&self) -> RhiResult<vk::Semaphore> {
        let mut pool = self.pool.lock();
        if let Some(semaphore) = pool.pop_free() {
            return Ok(semaphore);
        }

        let semaphore = self.device.create_semaphore(SemaphoreKind::Binary)?;
        pool.in_use.insert(semaphore);
        debug!("Created semaphore {:?}", semaphore);
        Ok(semaphore)
    }

    /// Moves `semaphore` from the in-use set back to the free list.
    ///
    /// The caller guarantees no pending submission still waits on it.
    pub fn return_semaphore(&self, semaphore: vk::Semaphore) {
        if !self.pool.lock().release(semaphore) {
            warn!("Returned semaphore {:?} that is not in use", semaphore);
        }
    }

    /// Creates a timeline semaphore. Timelines are not pooled: one object
    /// orders any number of submissions.
    ///
    /// # Errors
    ///
    /// Returns an error if the device lacks timeline support or creation fails.
    pub fn create_timeline(&self, initial_value: u64) -> RhiResult<TimelineSemaphore> {
        if !self.device.capabilities().timeline_semaphores {
            return Err(RhiError::InvalidHandle(
                "timeline semaphores are not supported by this device".into(),
            ));
        }
        let semaphore = self
            .device
            .create_semaphore(SemaphoreKind::Timeline { initial_value })?;
        debug!("Created timeline semaphore {:?} at {}", semaphore, initial_value);
        Ok(TimelineSemaphore {
            device: Arc::clone(&self.device),
            semaphore,
            next_value: AtomicU64::new(initial_value),
        })
    }

    pub fn in_use_count(&self) -> usize {
        self.pool.lock().in_use.len()
    }

    pub fn free_count(&self) -> usize {
        self.pool.lock().free.len()
    }
}

impl Drop for SemaphoreManager {
    fn drop(&mut self) {
        let mut pool = self.pool.lock();
        let mut count = 0;
        for semaphore in pool.drain() {
            self.device.destroy_semaphore(semaphore);
            count += 1;
        }
        info!("Semaphore manager destroyed ({} semaphores)", count);
    }
}

/// A timeline semaphore and the last value handed out for signaling.
///
/// [`TimelineSemaphore::signal`] reserves the next value for a submission to
/// signal; waiters block until the GPU (or host) reaches a given value.
pub struct TimelineSemaphore {
    device: Arc<dyn GpuDevice>,
    semaphore: vk::Semaphore,
    next_value: AtomicU64,
}

impl TimelineSemaphore {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Increments the counter and returns the new value, to be signaled by
    /// the next submission.
    pub fn signal(&self) -> u64 {
        self.next_value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Last value returned by [`TimelineSemaphore::signal`].
    pub fn last_signaled_value(&self) -> u64 {
        self.next_value.load(Ordering::Acquire)
    }

    /// Value the semaphore has actually reached.
    pub fn completed_value(&self) -> RhiResult<u64> {
        self.device.semaphore_counter_value(self.semaphore)
    }

    /// Signals the next value from the host and returns it.
    pub fn host_signal(&self) -> RhiResult<u64> {
        let value = self.signal();
        self.device.signal_semaphore(self.semaphore, value)?;
        Ok(value)
    }

    /// Blocks until the counter reaches `value`.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> RhiResult<()> {
        self.device.wait_semaphore(self.semaphore, value, timeout_ns)
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
        debug!("Destroyed timeline semaphore {:?}", self.semaphore);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn setup() -> (Arc<HeadlessDevice>, Arc<dyn GpuDevice>) {
        let headless = Arc::new(HeadlessDevice::new());
        let device: Arc<dyn GpuDevice> = headless.clone();
        (headless, device)
    }

    #[test]
    fn test_new_fences_start_signaled() {
        let (_, device) = setup();
        let fences = FenceManager::new(device);
        let fence = fences.get_or_create().unwrap();
        assert!(fences.is_signaled(fence).unwrap());
        assert_eq!(fences.in_use_count(), 1);
    }

    #[test]
    fn test_returned_fence_is_reused() {
        let (headless, device) = setup();
        let fences = FenceManager::new(device);
        let first = fences.get_or_create().unwrap();
        fences.return_fence(first);
        assert_eq!(fences.free_count(), 1);

        let second = fences.get_or_create().unwrap();
        assert_eq!(first, second);
        assert_eq!(headless.stats().fences_created, 1);
    }

    #[test]
    fn test_live_fences_are_distinct() {
        let (_, device) = setup();
        let fences = FenceManager::new(device);
        let a = fences.get_or_create().unwrap();
        let b = fences.get_or_create().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_semaphore_pool_recycles() {
        let (headless, device) = setup();
        let semaphores = SemaphoreManager::new(device);
        let a = semaphores.get_or_create().unwrap();
        semaphores.return_semaphore(a);
        let b = semaphores.get_or_create().unwrap();
        assert_eq!(a, b);
        assert_eq!(headless.stats().semaphores_created, 1);
    }

    #[test]
    fn test_timeline_signal_increments() {
        let (_, device) = setup();
        let semaphores = SemaphoreManager::new(device);
        let timeline = semaphores.create_timeline(10).unwrap();
        assert_eq!(timeline.signal(), 11);
        assert_eq!(timeline.signal(), 12);
        assert_eq!(timeline.last_signaled_value(), 12);
        assert_eq!(timeline.completed_value().unwrap(), 10);
    }

    #[test]
    fn test_timeline_host_signal_completes_wait() {
        let (_, device) = setup();
        let semaphores = SemaphoreManager::new(device);
        let timeline = semaphores.create_timeline(0).unwrap();
        let value = timeline.host_signal().unwrap();
        timeline.wait(value, WAIT_FOREVER).unwrap();
        assert_eq!(timeline.completed_value().unwrap(), 1);
    }

    #[test]
    fn test_managers_destroy_everything_on_drop() {
        let (headless, device) = setup();
        {
            let fences = FenceManager::new(Arc::clone(&device));
            let semaphores = SemaphoreManager::new(device);
            let fence = fences.get_or_create().unwrap();
            fences.get_or_create().unwrap();
            fences.return_fence(fence);
            semaphores.get_or_create().unwrap();
        }
        let stats = headless.stats();
        assert_eq!(stats.fences_created, stats.fences_destroyed);
        assert_eq!(stats.semaphores_created, stats.semaphores_destroyed);
    }

    #[test]
    fn test_managers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FenceManager>();
        assert_send_sync::<SemaphoreManager>();
        assert_send_sync::<TimelineSemaphore>();
    }
}
