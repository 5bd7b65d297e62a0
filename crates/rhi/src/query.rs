//! GPU timestamp queries.
//!
//! Each frame slot owns one [`TimestampQueries`] pool. Timestamps are reset
//! and written while the slot's command buffer records; results are read
//! back the next time the slot comes around, after its fence has signaled.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::command::CommandBuffer;
use crate::device::GpuDevice;
use crate::error::RhiResult;

/// A fixed-size pool of timestamp queries.
pub struct TimestampQueries {
    device: Arc<dyn GpuDevice>,
    pool: vk::QueryPool,
    capacity: u32,
    written: u32,
    /// Nanoseconds per tick.
    period_ns: f32,
    whole_readback: bool,
}

impl TimestampQueries {
    pub fn new(device: Arc<dyn GpuDevice>, capacity: u32) -> RhiResult<Self> {
        let pool = device.create_timestamp_query_pool(capacity)?;
        let caps = device.capabilities();
        let period_ns = caps.timestamp_period;
        let whole_readback = caps.whole_query_readback;
        debug!(
            "Created timestamp query pool: {} queries, {} ns/tick",
            capacity, period_ns
        );

        Ok(Self {
            device,
            pool,
            capacity,
            written: 0,
            period_ns,
            whole_readback,
        })
    }

    /// Records a reset of every query and rewinds the write cursor.
    pub fn reset(&mut self, cmd: &mut CommandBuffer) {
        cmd.device()
            .cmd_reset_query_pool(cmd.handle(), self.pool, 0, self.capacity);
        self.written = 0;
    }

    /// Records a timestamp after `stage` completes. Returns the query index,
    /// or `None` once every query of this frame is used.
    pub fn write_timestamp(
        &mut self,
        cmd: &mut CommandBuffer,
        stage: vk::PipelineStageFlags,
    ) -> Option<u32> {
        if self.written >= self.capacity {
            warn!("Timestamp query pool full ({} queries)", self.capacity);
            return None;
        }
        let query = self.written;
        cmd.device()
            .cmd_write_timestamp(cmd.handle(), stage, self.pool, query);
        self.written += 1;
        Some(query)
    }

    /// Raw tick values of every written query, or `None` if any result is
    /// not available yet.
    pub fn read_ticks(&self) -> RhiResult<Option<Vec<u64>>> {
        let mut ticks = vec![0u64; self.written as usize];
        if ticks.is_empty() {
            return Ok(Some(ticks));
        }

        if self.whole_readback {
            if !self.device.query_results(self.pool, 0, &mut ticks)? {
                return Ok(None);
            }
        } else {
            for (query, tick) in ticks.iter_mut().enumerate() {
                if !self
                    .device
                    .query_results(self.pool, query as u32, std::slice::from_mut(tick))?
                {
                    return Ok(None);
                }
            }
        }
        Ok(Some(ticks))
    }

    /// Milliseconds between the first and last written timestamp.
    pub fn elapsed_ms(&self) -> RhiResult<Option<f64>> {
        let Some(ticks) = self.read_ticks()? else {
            return Ok(None);
        };
        match (ticks.first(), ticks.last()) {
            (Some(first), Some(last)) if ticks.len() > 1 => {
                Ok(Some(self.ticks_to_ms(last.saturating_sub(*first))))
            }
            _ => Ok(None),
        }
    }

    /// Converts a tick delta to milliseconds using the device period.
    pub fn ticks_to_ms(&self, ticks: u64) -> f64 {
        ticks as f64 * self.period_ns as f64 / 1_000_000.0
    }

    pub fn written(&self) -> u32 {
        self.written
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for TimestampQueries {
    fn drop(&mut self) {
        self.device.destroy_query_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBufferManager;
    use crate::headless::HeadlessDevice;
    use crate::sync::FenceManager;
    use crate::types::{DeviceCapabilities, QueueType};

    fn run(caps: Option<DeviceCapabilities>) -> Option<f64> {
        let headless = Arc::new(match caps {
            Some(caps) => HeadlessDevice::with_capabilities(caps),
            None => HeadlessDevice::new(),
        });
        let device: Arc<dyn GpuDevice> = headless.clone();
        let fences = Arc::new(FenceManager::new(Arc::clone(&device)));
        let mut manager =
            CommandBufferManager::create_pool(Arc::clone(&device), QueueType::Graphics, fences)
                .unwrap();
        let mut queries = TimestampQueries::new(device, 4).unwrap();

        let mut cmd = manager.get_or_create_command_buffer().unwrap();
        queries.reset(&mut cmd);
        queries.write_timestamp(&mut cmd, vk::PipelineStageFlags::TOP_OF_PIPE);
        cmd.draw(3, 1, 0, 0);
        queries.write_timestamp(&mut cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        manager.submit_and_wait(&mut cmd).unwrap();
        manager.return_command_buffer(cmd);

        queries.elapsed_ms().unwrap()
    }

    #[test]
    fn test_elapsed_after_completion() {
        let elapsed = run(None).unwrap();
        assert!(elapsed > 0.0);
    }

    #[test]
    fn test_per_query_readback_matches_whole() {
        let caps = DeviceCapabilities {
            whole_query_readback: false,
            ..HeadlessDevice::default_capabilities()
        };
        assert_eq!(run(Some(caps)), run(None));
    }

    #[test]
    fn test_results_unavailable_before_completion() {
        let headless = Arc::new(HeadlessDevice::new());
        headless.set_auto_complete(false);
        let device: Arc<dyn GpuDevice> = headless.clone();
        let fences = Arc::new(FenceManager::new(Arc::clone(&device)));
        let mut manager =
            CommandBufferManager::create_pool(Arc::clone(&device), QueueType::Graphics, fences)
                .unwrap();
        let mut queries = TimestampQueries::new(device, 2).unwrap();

        let mut cmd = manager.get_or_create_command_buffer().unwrap();
        queries.reset(&mut cmd);
        queries.write_timestamp(&mut cmd, vk::PipelineStageFlags::TOP_OF_PIPE);
        queries.write_timestamp(&mut cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert_eq!(queries.write_timestamp(&mut cmd, vk::PipelineStageFlags::TOP_OF_PIPE), None);
        manager.submit(&mut cmd, &[], &[]).unwrap();

        assert!(queries.read_ticks().unwrap().is_none());
        headless.complete_all();
        assert_eq!(queries.read_ticks().unwrap().map(|t| t.len()), Some(2));
    }
}
