//! Deferred destruction of GPU-referenced objects.
//!
//! Anything a submitted frame may still read (a freed multi-frame descriptor
//! set, a replaced image, an evicted pipeline) is not released immediately.
//! Instead the release is queued with the serial of the frame being recorded
//! and runs once the frame orchestrator has proven, through that frame's
//! fence, that the GPU finished every frame up to that serial.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

type Release = Box<dyn FnOnce() + Send>;

/// Queue of releases keyed by frame serial.
pub struct DeferredDeletionQueue {
    /// Serial of the frame currently being recorded.
    current_serial: AtomicU64,
    entries: Mutex<VecDeque<(u64, Release)>>,
}

impl DeferredDeletionQueue {
    pub fn new() -> Self {
        Self {
            current_serial: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues `release` behind the frame currently being recorded.
    pub fn defer(&self, release: impl FnOnce() + Send + 'static) {
        let serial = self.current_serial.load(Ordering::Acquire);
        self.entries.lock().push_back((serial, Box::new(release)));
    }

    /// Marks `serial` as the frame now being recorded.
    pub fn begin_frame(&self, serial: u64) {
        self.current_serial.store(serial, Ordering::Release);
    }

    #[inline]
    pub fn current_serial(&self) -> u64 {
        self.current_serial.load(Ordering::Acquire)
    }

    /// Runs every release queued during frames up to and including
    /// `completed_serial`. Returns how many ran.
    pub fn retire(&self, completed_serial: u64) -> usize {
        let ready: Vec<Release> = {
            let mut entries = self.entries.lock();
            let split = entries
                .iter()
                .position(|(serial, _)| *serial > completed_serial)
                .unwrap_or(entries.len());
            entries.drain(..split).map(|(_, release)| release).collect()
        };

        let count = ready.len();
        // Releases may queue further releases, so the lock is not held here.
        for release in ready {
            release();
        }
        if count > 0 {
            debug!("Retired {} deferred releases up to frame {}", count, completed_serial);
        }
        count
    }

    /// Runs every queued release. Only valid once all queues are idle.
    pub fn flush(&self) -> usize {
        let mut total = 0;
        loop {
            let ready: Vec<Release> = self
                .entries
                .lock()
                .drain(..)
                .map(|(_, release)| release)
                .collect();
            if ready.is_empty() {
                return total;
            }
            total += ready.len();
            for release in ready {
                release();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeferredDeletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferredDeletionQueue {
    fn drop(&mut self) {
        let leaked = self.entries.get_mut().len();
        if leaked > 0 {
            debug!("Deferred deletion queue dropped with {} pending releases", leaked);
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let make = move || -> Box<dyn FnOnce() + Send> {
            let c = Arc::clone(&c);
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    #[test]
    fn test_release_waits_for_its_frame() {
        let queue = DeferredDeletionQueue::new();
        let (count, make) = counter();

        queue.begin_frame(3);
        queue.defer(make());

        assert_eq!(queue.retire(2), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(queue.retire(3), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_retire_is_ordered_by_serial() {
        let queue = DeferredDeletionQueue::new();
        let (count, make) = counter();

        for serial in 1..=4 {
            queue.begin_frame(serial);
            queue.defer(make());
        }
        assert_eq!(queue.retire(2), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_flush_runs_nested_releases() {
        let queue = Arc::new(DeferredDeletionQueue::new());
        let (count, make) = counter();

        let inner = Arc::clone(&queue);
        let nested = make();
        queue.defer(move || inner.defer(nested));

        assert_eq!(queue.flush(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
