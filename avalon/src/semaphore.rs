//! Recycling pool of binary semaphores.

use crate::{context::SubmissionTimeline, error::Result, pool::GrowingPool, serial::Serial};
use ash::{version::DeviceV1_0, vk};

/// Pool of binary semaphores recycled by submission serial.
///
/// Unlike descriptor sets or queries, semaphores carry no per-entry device
/// state to hand out lazily, so growth creates a whole sub-pool of semaphores
/// up front and [`allocate_semaphore`](Self::allocate_semaphore) just picks
/// the next one. A binary semaphore resets when waited on, so recycling a
/// fully freed sub-pool needs no reset work.
pub struct DynamicSemaphorePool {
    pools: GrowingPool<Vec<vk::Semaphore>>,
}

impl DynamicSemaphorePool {
    pub fn new(pool_size: u32) -> DynamicSemaphorePool {
        DynamicSemaphorePool {
            pools: GrowingPool::new(pool_size),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.pool_count()
    }

    pub fn allocate_semaphore(
        &mut self,
        device: &ash::Device,
        timeline: &SubmissionTimeline,
    ) -> Result<PooledSemaphore> {
        let (pool_index, entry) = loop {
            match self.pools.allocate_entries(1) {
                Some(found) => break found,
                None => self.grow(device, timeline)?,
            }
        };
        let semaphore = self.pools.pool(pool_index)[entry as usize];
        Ok(PooledSemaphore {
            pool_index,
            semaphore,
            last_used_serial: Serial::invalid(),
        })
    }

    /// Returns a semaphore to its sub-pool. The handle must not be used in
    /// batches recorded after this call.
    pub fn free_semaphore(&mut self, semaphore: PooledSemaphore, timeline: &SubmissionTimeline) {
        self.pools.free_entry(semaphore.pool_index, timeline);
    }

    fn grow(&mut self, device: &ash::Device, timeline: &SubmissionTimeline) -> Result<()> {
        let pool_size = self.pools.pool_size();
        self.pools.grow(
            timeline,
            || {
                let create_info = vk::SemaphoreCreateInfo::default();
                let mut semaphores = Vec::with_capacity(pool_size as usize);
                for _ in 0..pool_size {
                    match unsafe { device.create_semaphore(&create_info, None) } {
                        Ok(semaphore) => semaphores.push(semaphore),
                        Err(err) => {
                            for semaphore in semaphores {
                                unsafe { device.destroy_semaphore(semaphore, None) };
                            }
                            return Err(err.into());
                        }
                    }
                }
                Ok(semaphores)
            },
            |_| Ok(()),
        )
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.pools.destroy(|semaphores| {
            for semaphore in semaphores {
                unsafe { device.destroy_semaphore(semaphore, None) };
            }
        });
    }
}

/// One semaphore checked out of a [`DynamicSemaphorePool`]. Uses stamp the
/// current serial so the caller can tell when the device might still signal
/// or wait on it.
pub struct PooledSemaphore {
    pool_index: usize,
    semaphore: vk::Semaphore,
    last_used_serial: Serial,
}

impl PooledSemaphore {
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn last_used_serial(&self) -> Serial {
        self.last_used_serial
    }

    /// Records that the current batch signals this semaphore.
    pub fn on_signal(&mut self, timeline: &SubmissionTimeline) {
        self.last_used_serial = timeline.current_serial();
    }

    /// Records that the current batch waits on this semaphore.
    pub fn on_wait(&mut self, timeline: &SubmissionTimeline) {
        self.last_used_serial = timeline.current_serial();
    }

    pub fn has_pending_work(&self, timeline: &SubmissionTimeline) -> bool {
        timeline.is_serial_in_use(self.last_used_serial)
    }
}
