//! Recycling rules of the growable sub-pool scheme shared by descriptor set,
//! query and semaphore pools.

use avalon::{GrowingPool, Serial, SubmissionTimeline};

#[test]
fn frees_count_under_the_serial_at_free_time() {
    let mut timeline = SubmissionTimeline::new();
    let mut pool: GrowingPool<u32> = GrowingPool::new(2);
    pool.grow(&timeline, || Ok(0), |_| Ok(())).unwrap();
    pool.allocate_entries(2).unwrap();

    // The entries were handed out under serial 1, but the frees land while
    // serial 3 is being recorded. That is the serial that gates recycling.
    timeline.advance();
    timeline.advance();
    pool.free_entry(0, &timeline);
    pool.free_entry(0, &timeline);

    // Serials 1 and 2 completing is not enough.
    timeline.retire(Serial::from_raw(2));
    pool.grow(&timeline, || Ok(1), |_| Ok(())).unwrap();
    assert_eq!(pool.pool_count(), 2);

    timeline.advance();
    timeline.retire(Serial::from_raw(3));
    pool.grow(&timeline, || panic!("pool 0 should recycle"), |_| Ok(()))
        .unwrap();
    assert_eq!(pool.current_pool_index(), 0);
    assert_eq!(pool.pool_count(), 2);
    pool.destroy(|_| {});
}

#[test]
fn retire_current_lets_a_partially_used_pool_recycle() {
    let mut timeline = SubmissionTimeline::new();
    let mut pool: GrowingPool<u32> = GrowingPool::new(4);
    pool.grow(&timeline, || Ok(0), |_| Ok(())).unwrap();
    pool.allocate_entries(1).unwrap();

    // The underlying pool reported exhaustion early; write off the remainder
    // and free the one entry that was handed out.
    pool.retire_current(&timeline);
    pool.free_entry(0, &timeline);

    timeline.advance();
    timeline.retire(Serial::from_raw(1));
    pool.grow(&timeline, || panic!("expected recycling"), |_| Ok(()))
        .unwrap();
    assert_eq!(pool.current_pool_index(), 0);
    assert_eq!(pool.allocate_entries(4), Some((0, 0)));
    pool.destroy(|_| {});
}

#[test]
fn recycling_resets_the_pool_before_handing_out_entries() {
    let mut timeline = SubmissionTimeline::new();
    let mut pool: GrowingPool<Vec<u32>> = GrowingPool::new(2);
    pool.grow(&timeline, || Ok(vec![1, 2]), |_| Ok(())).unwrap();
    pool.allocate_entries(2).unwrap();
    pool.free_entry(0, &timeline);
    pool.free_entry(0, &timeline);

    timeline.advance();
    timeline.retire(Serial::from_raw(1));
    pool.grow(
        &timeline,
        || panic!("expected recycling"),
        |entries| {
            entries.clear();
            Ok(())
        },
    )
    .unwrap();
    assert!(pool.pool(0).is_empty());
    assert_eq!(pool.allocate_entries(1), Some((0, 0)));
    pool.destroy(|_| {});
}

#[test]
fn growth_prefers_the_first_recyclable_pool() {
    let mut timeline = SubmissionTimeline::new();
    let mut pool: GrowingPool<u32> = GrowingPool::new(1);
    for value in 0..3 {
        pool.grow(&timeline, || Ok(value), |_| Ok(())).unwrap();
        pool.allocate_entries(1).unwrap();
    }

    // Pools 1 and 2 free under serial 1; pool 0 stays handed out.
    pool.free_entry(1, &timeline);
    pool.free_entry(2, &timeline);
    timeline.advance();
    timeline.retire(Serial::from_raw(1));

    pool.grow(&timeline, || panic!("expected recycling"), |_| Ok(()))
        .unwrap();
    assert_eq!(pool.current_pool_index(), 1);
    pool.destroy(|_| {});
}

#[test]
#[should_panic]
fn allocating_more_than_a_pool_holds_panics() {
    let mut pool: GrowingPool<u32> = GrowingPool::new(2);
    pool.allocate_entries(3);
}
