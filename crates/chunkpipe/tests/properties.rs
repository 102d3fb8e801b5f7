use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chunkpipe::{
    AllocationError, ChunkQueueConfig, MePooConfig, MePooEntry, PushOutcome, QueueFullPolicy,
    ReceiverConfig, Segment, SegmentConfig, SegmentRegistry, SenderConfig, WaitOutcome,
};
use shm_primitives::{HeapRegion, SpscRing};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn segment(entries: &[(u32, u32)]) -> Segment {
    init_tracing();
    let config = SegmentConfig {
        segment_id: 0,
        pools: MePooConfig::from_entries(entries.iter().map(|&(p, n)| MePooEntry::new(p, n)))
            .unwrap(),
        port_area_size: 64 * 1024,
    };
    Segment::create_in_memory(Arc::new(SegmentRegistry::new()), &config).unwrap()
}

#[test]
fn chunk_returns_to_pool_exactly_once() {
    let segment = segment(&[(32, 4)]);
    let mm = segment.memory_manager();
    for extra in 0..6 {
        let chunk = mm.allocate_default(32).unwrap();
        let slot = chunk.header().slot_index;
        let clones: Vec<_> = (0..extra).map(|_| chunk.clone()).collect();
        assert_eq!(chunk.ref_count(), 1 + extra);

        drop(clones);
        assert_eq!(mm.pool_info(0).unwrap().used_chunks, 1);
        drop(chunk);
        let info = mm.pool_info(0).unwrap();
        assert_eq!(info.used_chunks, 0);

        let again = mm.allocate_default(32).unwrap();
        assert_eq!(again.header().slot_index, slot);
    }
}

#[test]
fn racing_releases_free_each_chunk_once() {
    let segment = segment(&[(32, 16)]);
    let mm = segment.memory_manager().clone();
    for _ in 0..50 {
        let chunks: Vec<_> = (0..16).map(|_| mm.allocate_default(8).unwrap()).collect();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let copies: Vec<_> = chunks.iter().cloned().collect();
                thread::spawn(move || drop(copies))
            })
            .collect();
        drop(chunks);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mm.pool_info(0).unwrap().used_chunks, 0);
    }
}

#[test]
fn spsc_ring_keeps_push_order() {
    for capacity in [1u32, 3, 7, 64] {
        let owner = HeapRegion::new_zeroed(SpscRing::<u64>::required_size(capacity));
        let ring = unsafe { SpscRing::<u64>::init(owner.region(), 0, capacity) };
        let (mut tx, mut rx) = ring.split();
        let mut next = 0u64;
        for round in 0..5u64 {
            let n = (round % capacity as u64) + 1;
            for i in 0..n {
                assert!(tx.push(next + i));
            }
            for i in 0..n {
                assert_eq!(rx.try_pop(), Some(next + i));
            }
            next += n;
        }
        assert_eq!(rx.try_pop(), None);
    }
}

#[test]
fn overflow_follows_the_queue_policy() {
    let segment = segment(&[(8, 16)]);
    let mm = segment.memory_manager();
    let chunk = |v: u8| {
        let mut c = mm.allocate_default(1).unwrap();
        c.payload_mut().unwrap()[0] = v;
        c
    };

    for policy in [QueueFullPolicy::RejectNewest, QueueFullPolicy::DiscardOldestData] {
        let (mut tx, mut rx) = segment
            .create_receiver_queue(&ChunkQueueConfig::new(3, policy))
            .unwrap();
        for v in 0..3 {
            assert_eq!(tx.push(chunk(v)), PushOutcome::Queued);
        }
        let outcome = tx.push(chunk(3));
        let expected: &[u8] = match policy {
            QueueFullPolicy::RejectNewest => {
                assert_eq!(outcome, PushOutcome::Rejected);
                &[0, 1, 2]
            }
            QueueFullPolicy::DiscardOldestData => {
                assert_eq!(outcome, PushOutcome::QueuedDiscardedOldest);
                &[1, 2, 3]
            }
        };
        assert!(rx.has_lost_chunks());
        assert_eq!(mm.pool_info(0).unwrap().used_chunks, 3);

        let mut got = Vec::new();
        while let Some(c) = rx.try_pop().unwrap() {
            got.push(c.payload()[0]);
        }
        assert_eq!(got, expected);
        assert_eq!(mm.pool_info(0).unwrap().used_chunks, 0);
    }
}

#[test]
fn exhaustion_is_reported_immediately() {
    let segment = segment(&[(64, 2), (1024, 1)]);
    let mm = segment.memory_manager();
    let _a = mm.allocate_default(64).unwrap();
    let _b = mm.allocate_default(64).unwrap();

    let start = Instant::now();
    // The larger pool still has room; small requests must not spill into it.
    assert!(matches!(
        mm.allocate_default(16),
        Err(AllocationError::RunningOutOfChunks { pool_index: 0, .. })
    ));
    assert!(matches!(
        mm.allocate_default(4096),
        Err(AllocationError::RequestedSizeTooLarge { .. })
    ));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(mm.pool_info(1).unwrap().used_chunks, 0);
    assert_eq!(mm.pool_info(0).unwrap().min_free_chunks, 0);
}

#[test]
fn timed_wait_times_out_without_notify() {
    let segment = segment(&[(8, 1)]);
    let cv = segment.create_condition_variable().unwrap();
    let start = Instant::now();
    assert_eq!(
        cv.listener().timed_wait(Duration::from_millis(20)).unwrap(),
        WaitOutcome::Timeout
    );
    assert!(start.elapsed() >= Duration::from_millis(15));
}

#[test]
fn notify_during_wait_is_not_missed_after_spurious_wakeup() {
    let segment = segment(&[(8, 1)]);
    let cv = segment.create_condition_variable().unwrap();
    let listener = cv.listener();

    // Two notifies, one take: the second post leaves a wake-up whose bit is
    // already gone.
    cv.notifier(2).unwrap().notify();
    cv.notifier(2).unwrap().notify();
    assert!(listener.wait().unwrap().contains(2));
    assert!(listener.wait().unwrap().is_empty());

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            cv.notifier(6).unwrap().notify();
        });
        match listener.timed_wait(Duration::from_secs(5)).unwrap() {
            WaitOutcome::Notified(fired) => assert!(fired.contains(6)),
            WaitOutcome::Timeout => panic!("notification missed"),
        }
    });
}

#[test]
fn blocked_subscriber_wakes_on_send() {
    let segment = segment(&[(16, 8)]);
    let cv = segment.create_condition_variable().unwrap();
    let receiver = segment
        .create_receiver(&ChunkQueueConfig::default(), ReceiverConfig::default())
        .unwrap();
    receiver.attach_condition_variable(&cv, 0).unwrap();

    let sender = segment.create_sender(SenderConfig::default());
    let pusher = unsafe {
        chunkpipe::ChunkQueuePusher::attach(segment.registry().clone(), receiver.queue_id())
    }
    .unwrap();
    sender.distributor().add_queue(pusher, 0).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..10u8 {
                let mut chunk = sender.try_allocate(1, 1).unwrap();
                chunk.payload_mut()[0] = i;
                assert_eq!(chunk.send(), 1);
                thread::sleep(Duration::from_millis(1));
            }
        });

        let listener = cv.listener();
        let mut seen = Vec::new();
        while seen.len() < 10 {
            while let Some(chunk) = receiver.try_get().unwrap() {
                seen.push(chunk.payload()[0]);
            }
            if seen.len() < 10 {
                listener.timed_wait(Duration::from_millis(100)).unwrap();
            }
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    });
    assert_eq!(segment.memory_manager().pool_info(0).unwrap().used_chunks, 0);
}
