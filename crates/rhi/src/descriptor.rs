//! Descriptor pools backing shader binding instances.
//!
//! - [`SingleFrameDescriptorPool`] belongs to one frame slot. Sets are never
//!   freed individually; the whole pool is reset when the slot is reused.
//! - [`MultiFrameDescriptorPool`] is shared by every frame. Sets are freed one
//!   at a time, always through the deferred deletion queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ash::vk;
use tracing::{debug, error};

use crate::deferred::DeferredDeletionQueue;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::types::DescriptorPoolDesc;

/// Reset generation of a single-frame pool captured at allocation time.
#[derive(Clone, Debug)]
pub struct PoolEpoch {
    counter: Arc<AtomicU64>,
    value: u64,
}

impl PoolEpoch {
    /// Whether the pool has not been reset since the allocation.
    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::Acquire) == self.value
    }
}

fn exhausted(label: &str, max_sets: u32) -> RhiError {
    error!("{} descriptor pool exhausted ({} sets)", label, max_sets);
    RhiError::DescriptorPoolExhausted(format!("{} pool, {} sets", label, max_sets))
}

/// Per-frame descriptor pool, reset wholesale.
pub struct SingleFrameDescriptorPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::DescriptorPool,
    max_sets: u32,
    allocated: AtomicU32,
    epoch: Arc<AtomicU64>,
}

impl SingleFrameDescriptorPool {
    pub fn new(device: Arc<dyn GpuDevice>, max_sets: u32) -> RhiResult<Self> {
        let pool = device.create_descriptor_pool(&DescriptorPoolDesc::for_sets(max_sets, false))?;
        debug!("Created single-frame descriptor pool: max_sets={}", max_sets);
        Ok(Self {
            device,
            pool,
            max_sets,
            allocated: AtomicU32::new(0),
            epoch: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Allocates a set valid until the next [`reset`](Self::reset).
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DescriptorPoolExhausted`] once `max_sets` sets
    /// were allocated since the last reset.
    pub fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> RhiResult<(vk::DescriptorSet, PoolEpoch)> {
        if self.allocated.fetch_add(1, Ordering::AcqRel) >= self.max_sets {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
            return Err(exhausted("single-frame", self.max_sets));
        }

        match self.device.allocate_descriptor_set(self.pool, layout, variable_count) {
            Ok(set) => Ok((
                set,
                PoolEpoch {
                    counter: Arc::clone(&self.epoch),
                    value: self.epoch.load(Ordering::Acquire),
                },
            )),
            Err(err) => {
                self.allocated.fetch_sub(1, Ordering::AcqRel);
                if matches!(err, RhiError::DescriptorPoolExhausted(_)) {
                    error!("single-frame descriptor pool exhausted: {}", err);
                }
                Err(err)
            }
        }
    }

    /// Returns every set to the pool. Sets allocated before the reset become stale.
    ///
    /// The caller must know that no submitted work still references them.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_descriptor_pool(self.pool)?;
        self.allocated.store(0, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for SingleFrameDescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
        debug!("Destroyed single-frame descriptor pool");
    }
}

/// Long-lived descriptor pool with individually freed sets.
pub struct MultiFrameDescriptorPool {
    device: Arc<dyn GpuDevice>,
    deletion: Arc<DeferredDeletionQueue>,
    pool: vk::DescriptorPool,
    max_sets: u32,
    live: AtomicU32,
}

impl MultiFrameDescriptorPool {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        deletion: Arc<DeferredDeletionQueue>,
        max_sets: u32,
    ) -> RhiResult<Arc<Self>> {
        let pool = device.create_descriptor_pool(&DescriptorPoolDesc::for_sets(max_sets, true))?;
        debug!("Created multi-frame descriptor pool: max_sets={}", max_sets);
        Ok(Arc::new(Self {
            device,
            deletion,
            pool,
            max_sets,
            live: AtomicU32::new(0),
        }))
    }

    /// # Errors
    ///
    /// Returns [`RhiError::DescriptorPoolExhausted`] when `max_sets` sets are live.
    pub fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> RhiResult<vk::DescriptorSet> {
        if self.live.fetch_add(1, Ordering::AcqRel) >= self.max_sets {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(exhausted("multi-frame", self.max_sets));
        }
        self.device
            .allocate_descriptor_set(self.pool, layout, variable_count)
            .inspect_err(|_| {
                self.live.fetch_sub(1, Ordering::AcqRel);
            })
    }

    /// Frees `set` once every frame recorded so far has completed.
    pub fn free_deferred(self: &Arc<Self>, set: vk::DescriptorSet) {
        let pool = Arc::clone(self);
        self.deletion.defer(move || pool.release(set));
    }

    fn release(&self, set: vk::DescriptorSet) {
        if let Err(err) = self.device.free_descriptor_set(self.pool, set) {
            error!("Failed to free descriptor set {:?}: {}", set, err);
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Sets allocated and not yet released, including pending deferred frees.
    pub fn live_count(&self) -> u32 {
        self.live.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for MultiFrameDescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
        debug!("Destroyed multi-frame descriptor pool");
    }
}
