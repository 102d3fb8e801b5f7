//! One 4 x 64-byte pool: exhaustion, slot reuse, and a capacity-3 FIFO.

use std::sync::Arc;

use chunkpipe::{
    AllocationError, ChunkQueueConfig, MePooConfig, MePooEntry, PushOutcome, QueueFullPolicy,
    Segment, SegmentConfig, SegmentRegistry,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn four_slot_pool_and_three_slot_fifo() {
    init_tracing();
    let registry = Arc::new(SegmentRegistry::new());
    let config = SegmentConfig {
        segment_id: 1,
        pools: MePooConfig::from_entries([MePooEntry::new(64, 4)]).unwrap(),
        port_area_size: 4096,
    };
    let segment = Segment::create_in_memory(registry, &config).unwrap();
    let mm = segment.memory_manager();

    let c1 = mm.allocate_default(64).unwrap();
    let c2 = mm.allocate_default(64).unwrap();
    let c3 = mm.allocate_default(64).unwrap();
    let c4 = mm.allocate_default(64).unwrap();

    assert!(matches!(
        mm.allocate_default(64),
        Err(AllocationError::RunningOutOfChunks { pool_index: 0, .. })
    ));

    let c2_slot = c2.header().slot_index;
    drop(c2);
    let c2_again = mm.allocate_default(64).unwrap();
    assert_eq!(c2_again.header().slot_index, c2_slot);

    let (mut pusher, mut popper) = segment
        .create_receiver_queue(&ChunkQueueConfig::new(3, QueueFullPolicy::RejectNewest))
        .unwrap();
    for chunk in [&c1, &c3, &c4] {
        assert_eq!(pusher.push(chunk.clone()), PushOutcome::Queued);
    }
    for expected in [&c1, &c3, &c4] {
        let popped = popper.try_pop().unwrap().unwrap();
        assert!(popped.ptr_eq(expected));
    }
    assert!(popper.try_pop().unwrap().is_none());

    drop((c1, c2_again, c3, c4));
    assert_eq!(mm.pool_info(0).unwrap().used_chunks, 0);
}
