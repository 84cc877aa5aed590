//! Integration tests for the fixed-block memory pool: the size
//! invariant, counter monotonicity, leak-detection accuracy, and
//! concurrent use.

use std::sync::Arc;
use std::time::Duration;

use raft_transport::config::MemoryPoolConfig;
use raft_transport::pool::MemoryPool;

#[test]
fn test_size_invariant_under_random_churn() {
    let pool = MemoryPool::new(MemoryPoolConfig::new(64 * 1024, 4 * 1024)).unwrap();
    let mut held = Vec::new();

    for round in 0..200 {
        if round % 3 == 0 && !held.is_empty() {
            let handle = held.swap_remove(round % held.len());
            pool.deallocate(handle).unwrap();
        } else if let Some(handle) = pool.allocate(1 + (round * 37) % 4096, "churn") {
            held.push(handle);
        }

        let m = pool.metrics();
        assert_eq!(
            m.allocated_size + m.free_size,
            m.total_size,
            "size invariant violated at round {round}"
        );
        assert!(m.allocation_count >= m.deallocation_count);
    }

    println!("✅ allocated + free == total held through 200 churn rounds");
}

#[test]
fn test_peak_usage_is_monotonic_between_resets() {
    let pool = MemoryPool::new(MemoryPoolConfig::new(16 * 1024, 4 * 1024)).unwrap();

    let a = pool.allocate(100, "a").unwrap();
    let b = pool.allocate(100, "b").unwrap();
    let peak_two = pool.metrics().peak_usage;
    assert_eq!(peak_two, 8 * 1024);

    pool.deallocate(a).unwrap();
    assert_eq!(pool.metrics().peak_usage, peak_two);

    let _c = pool.allocate(100, "c").unwrap();
    assert_eq!(pool.metrics().peak_usage, peak_two);

    let _d = pool.allocate(100, "d").unwrap();
    let _e = pool.allocate(100, "e").unwrap();
    assert_eq!(pool.metrics().peak_usage, 16 * 1024);

    pool.deallocate(b).unwrap();
    assert_eq!(pool.metrics().peak_usage, 16 * 1024);

    println!("✅ peak_usage never decreased between resets");
}

#[test]
fn test_fragmentation_convention() {
    let pool = MemoryPool::new(MemoryPoolConfig::new(16 * 1024, 4 * 1024)).unwrap();
    // Empty pool: 100 (all blocks free).
    assert_eq!(pool.metrics().fragmentation_ratio, 100);

    let handles: Vec<_> = (0..4).map(|i| pool.allocate(64, &format!("h{i}")).unwrap()).collect();
    // Exhausted pool: 0.
    assert_eq!(pool.metrics().fragmentation_ratio, 0);

    pool.deallocate(handles[0]).unwrap();
    assert_eq!(pool.metrics().fragmentation_ratio, 25);

    println!("✅ Fragmentation reads as integer free-block percent");
}

#[test]
fn test_leak_detection_scenario() {
    // 64 KB pool in 4 KB blocks, 1 s threshold.
    let pool = MemoryPool::new(
        MemoryPoolConfig::new(64 * 1024, 4 * 1024).with_leak_threshold(Duration::from_secs(1)),
    )
    .unwrap();

    let sizes = [100usize, 1024, 2048, 4000, 512];
    let handles: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| pool.allocate(*size, &format!("leak-site-{i}")).unwrap())
        .collect();

    std::thread::sleep(Duration::from_millis(1200));

    let leaks = pool.detect_leaks();
    assert_eq!(leaks.len(), 5);

    let mut expected_addresses: Vec<usize> = handles.iter().map(|h| pool.address_of(*h)).collect();
    expected_addresses.sort_unstable();
    let reported_addresses: Vec<usize> = leaks.iter().map(|l| l.address).collect();
    assert_eq!(reported_addresses, expected_addresses);

    for leak in &leaks {
        assert!(leak.age >= Duration::from_secs(1), "age {:?} too young", leak.age);
        assert!(sizes.contains(&leak.size), "unexpected size {}", leak.size);
        assert!(!leak.allocation_context.is_empty());
        assert!(!leak.thread_id.is_empty());
    }

    // Deallocated blocks never appear again.
    pool.deallocate(handles[0]).unwrap();
    assert_eq!(pool.detect_leaks().len(), 4);

    println!("✅ Leak detection reported 5 aged allocations with accurate metadata");
}

#[test]
fn test_young_allocations_are_not_leaks() {
    let pool = MemoryPool::new(
        MemoryPoolConfig::new(16 * 1024, 4 * 1024).with_leak_threshold(Duration::from_secs(60)),
    )
    .unwrap();
    let _held = pool.allocate(128, "fresh").unwrap();
    assert!(pool.detect_leaks().is_empty());

    println!("✅ Allocations younger than the threshold are not reported");
}

#[test]
fn test_leak_thread_id_is_the_allocating_thread() {
    let pool = Arc::new(
        MemoryPool::new(
            MemoryPoolConfig::new(16 * 1024, 4 * 1024)
                .with_leak_threshold(Duration::from_millis(10)),
        )
        .unwrap(),
    );

    let worker_pool = Arc::clone(&pool);
    let worker_thread_id = std::thread::spawn(move || {
        worker_pool.allocate(64, "from worker").unwrap();
        format!("{:?}", std::thread::current().id())
    })
    .join()
    .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    let leaks = pool.detect_leaks();
    assert_eq!(leaks.len(), 1);
    // Captured at allocation time on the worker, not here.
    assert_eq!(leaks[0].thread_id, worker_thread_id);
    assert_ne!(leaks[0].thread_id, format!("{:?}", std::thread::current().id()));

    println!("✅ Leak records carry the allocating thread's id");
}

#[test]
fn test_concurrent_allocate_deallocate() {
    let pool = Arc::new(MemoryPool::new(MemoryPoolConfig::new(256 * 1024, 1024)).unwrap());

    let mut workers = Vec::new();
    for w in 0..8 {
        let pool = Arc::clone(&pool);
        workers.push(std::thread::spawn(move || {
            for i in 0..200 {
                if let Some(handle) = pool.allocate(1 + (w * 131 + i) % 1024, "hammer") {
                    pool.copy_in(handle, b"stress").unwrap();
                    assert_eq!(pool.copy_out(handle, 6).unwrap(), b"stress");
                    pool.deallocate(handle).unwrap();
                }
                let m = pool.metrics();
                assert_eq!(m.allocated_size + m.free_size, m.total_size);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let m = pool.metrics();
    assert_eq!(m.allocated_size, 0);
    assert_eq!(m.allocation_count, m.deallocation_count);
    assert_eq!(m.allocation_count, 8 * 200);

    println!("✅ 8 threads x 200 rounds left the pool consistent");
}

#[test]
fn test_reset_preserves_totals_and_counters() {
    let pool = MemoryPool::new(MemoryPoolConfig::new(16 * 1024, 4 * 1024)).unwrap();
    for i in 0..4 {
        pool.allocate(100, &format!("pre-reset-{i}")).unwrap();
    }
    let before = pool.metrics();

    pool.reset();
    let after = pool.metrics();

    assert_eq!(after.total_size, before.total_size);
    assert_eq!(after.allocated_size, 0);
    assert_eq!(after.free_size, after.total_size);
    assert_eq!(after.allocation_count, before.allocation_count);
    assert_eq!(after.peak_usage, before.peak_usage);
    assert!(pool.detect_leaks().is_empty());

    // The pool is fully usable again.
    assert!(pool.allocate(4096, "post-reset").is_some());

    println!("✅ reset returned every block and preserved lifetime counters");
}

#[test]
fn test_invalid_configurations_are_rejected() {
    assert!(MemoryPool::new(MemoryPoolConfig::new(0, 4096)).is_err());
    assert!(MemoryPool::new(MemoryPoolConfig::new(4096, 0)).is_err());
    // total not a multiple of block size.
    assert!(MemoryPool::new(MemoryPoolConfig::new(5000, 4096)).is_err());

    println!("✅ Invalid pool configurations are rejected up front");
}
