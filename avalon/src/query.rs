//! Recycling query allocation.

use crate::{
    command::CommandEncoder,
    context::SubmissionTimeline,
    error::Result,
    pool::GrowingPool,
    serial::Serial,
};
use ash::{version::DeviceV1_0, vk};

/// Hands out single queries from `vk::QueryPool` objects of a fixed size,
/// recycling each pool once all its queries were freed and the last free's
/// serial completed.
pub struct DynamicQueryPool {
    pools: GrowingPool<vk::QueryPool>,
    query_type: vk::QueryType,
}

impl DynamicQueryPool {
    pub fn new(query_type: vk::QueryType, pool_size: u32) -> DynamicQueryPool {
        DynamicQueryPool {
            pools: GrowingPool::new(pool_size),
            query_type,
        }
    }

    pub fn query_type(&self) -> vk::QueryType {
        self.query_type
    }

    pub fn pool_count(&self) -> usize {
        self.pools.pool_count()
    }

    pub fn allocate_query(
        &mut self,
        device: &ash::Device,
        timeline: &SubmissionTimeline,
    ) -> Result<PooledQuery> {
        let (pool_index, query) = match self.pools.allocate_entries(1) {
            Some(entry) => entry,
            None => {
                self.grow(device, timeline)?;
                match self.pools.allocate_entries(1) {
                    Some(entry) => entry,
                    None => unreachable!("growth always leaves room for one entry"),
                }
            }
        };
        Ok(PooledQuery {
            pool_index,
            pool: *self.pools.pool(pool_index),
            query,
            last_used_serial: Serial::invalid(),
        })
    }

    /// Returns a query's slot to its pool. The query results must have been
    /// read (or abandoned) by the caller.
    pub fn free_query(&mut self, query: PooledQuery, timeline: &SubmissionTimeline) {
        self.pools.free_entry(query.pool_index, timeline);
    }

    fn grow(&mut self, device: &ash::Device, timeline: &SubmissionTimeline) -> Result<()> {
        let query_type = self.query_type;
        let query_count = self.pools.pool_size();
        self.pools.grow(
            timeline,
            || {
                let create_info = vk::QueryPoolCreateInfo {
                    query_type,
                    query_count,
                    ..Default::default()
                };
                let pool = unsafe { device.create_query_pool(&create_info, None) }?;
                Ok(pool)
            },
            // Queries are reset individually before each use; pool reuse
            // needs no device work.
            |_| Ok(()),
        )
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.pools
            .destroy(|pool| unsafe { device.destroy_query_pool(pool, None) });
    }
}

/// One query checked out of a [`DynamicQueryPool`]. Every recorded use stamps
/// the current serial, so completion can be answered without blocking.
pub struct PooledQuery {
    pool_index: usize,
    pool: vk::QueryPool,
    query: u32,
    last_used_serial: Serial,
}

impl PooledQuery {
    pub fn pool(&self) -> vk::QueryPool {
        self.pool
    }

    pub fn query(&self) -> u32 {
        self.query
    }

    pub fn last_used_serial(&self) -> Serial {
        self.last_used_serial
    }

    pub fn begin<E: CommandEncoder>(&mut self, encoder: &mut E, timeline: &SubmissionTimeline) {
        encoder.reset_query_pool(self.pool, self.query, 1);
        encoder.begin_query(self.pool, self.query);
        self.last_used_serial = timeline.current_serial();
    }

    pub fn end<E: CommandEncoder>(&mut self, encoder: &mut E, timeline: &SubmissionTimeline) {
        encoder.end_query(self.pool, self.query);
        self.last_used_serial = timeline.current_serial();
    }

    pub fn write_timestamp<E: CommandEncoder>(
        &mut self,
        encoder: &mut E,
        timeline: &SubmissionTimeline,
    ) {
        encoder.reset_query_pool(self.pool, self.query, 1);
        encoder.write_timestamp(vk::PipelineStageFlags::BOTTOM_OF_PIPE, self.pool, self.query);
        self.last_used_serial = timeline.current_serial();
    }

    /// True while the batch that last used this query has not completed,
    /// including while it is still being recorded. Results may be available
    /// once this returns false.
    pub fn has_pending_work(&self, timeline: &SubmissionTimeline) -> bool {
        timeline.is_serial_in_use(self.last_used_serial)
    }
}
