//! Tracking allocator bookkeeping under randomised and concurrent use.
//!
//! Each test owns a private ledger so results do not depend on what other
//! tests have allocated through the process-wide one.

use std::sync::Arc;
use std::thread;

use kernel::{Address, CpuDevice, KernelError, MemoryDomain, MemoryLedger, TrackingAllocator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn allocator() -> TrackingAllocator {
    TrackingAllocator::with_ledger(Arc::new(CpuDevice::new()), Arc::new(MemoryLedger::new()))
}

fn live_sum(alloc: &TrackingAllocator, domain: MemoryDomain) -> usize {
    alloc.ledger().records(domain).iter().map(|r| r.size).sum()
}

#[test]
fn allocate_then_free_restores_usage_for_random_requests() {
    let alloc = allocator();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..200 {
        let domain = if rng.gen_bool(0.5) { MemoryDomain::Host } else { MemoryDomain::Device };
        let size = rng.gen_range(1..=64 * 1024);
        let before = alloc.usage(domain);

        let mut ptr = alloc.allocate(size, domain).expect("allocate");
        assert_eq!(alloc.usage(domain), before + size);
        alloc.free(&mut ptr, domain).expect("free");

        assert_eq!(alloc.usage(domain), before);
        assert!(ptr.is_null(), "free must null the caller's pointer");
    }
}

#[test]
fn counters_track_interleaved_lifetimes() {
    let alloc = allocator();
    let mut rng = StdRng::seed_from_u64(42);
    let mut live: Vec<(Address, MemoryDomain)> = Vec::new();

    for _ in 0..500 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let domain = if rng.gen_bool(0.5) { MemoryDomain::Host } else { MemoryDomain::Device };
            let ptr = alloc.allocate(rng.gen_range(1..4096), domain).expect("allocate");
            live.push((ptr, domain));
        } else {
            let (mut ptr, domain) = live.swap_remove(rng.gen_range(0..live.len()));
            alloc.free(&mut ptr, domain).expect("free");
        }

        for domain in MemoryDomain::ALL {
            assert_eq!(alloc.usage(domain), live_sum(&alloc, domain));
        }
    }

    for (mut ptr, domain) in live {
        alloc.free(&mut ptr, domain).expect("free");
    }
    assert_eq!(alloc.usage(MemoryDomain::Host), 0);
    assert_eq!(alloc.usage(MemoryDomain::Device), 0);
}

#[test]
fn rejected_frees_never_touch_counters() {
    let alloc = allocator();
    let kept = alloc.allocate(512, MemoryDomain::Device).expect("allocate");
    let mut freed = alloc.allocate(128, MemoryDomain::Device).expect("allocate");
    let stale = freed;
    alloc.free(&mut freed, MemoryDomain::Device).expect("free");
    let usage = alloc.usage(MemoryDomain::Device);

    let attempts = [
        (stale, MemoryDomain::Device),
        (kept, MemoryDomain::Host),
        (Address::NULL, MemoryDomain::Device),
        (Address::new(0xdead_0000), MemoryDomain::Device),
    ];
    for (addr, domain) in attempts {
        let mut ptr = addr;
        let err = alloc.free(&mut ptr, domain).expect_err("free should be rejected");
        assert!(matches!(err, KernelError::InvalidPointer { .. }), "unexpected error: {err}");
        assert_eq!(ptr, addr, "a rejected free must leave the pointer alone");
        assert_eq!(alloc.usage(MemoryDomain::Device), usage);
        assert_eq!(alloc.usage(MemoryDomain::Host), 0);
    }
}

#[test]
fn concurrent_allocations_are_serialised() {
    let alloc = allocator();

    let workers: Vec<_> = (0..4u64)
        .map(|seed| {
            let alloc = alloc.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..250 {
                    let size = rng.gen_range(1..2048);
                    let mut ptr = alloc.allocate(size, MemoryDomain::Device).expect("allocate");
                    alloc.free(&mut ptr, MemoryDomain::Device).expect("free");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(alloc.usage(MemoryDomain::Device), 0);
    assert_eq!(alloc.ledger().live_count(MemoryDomain::Device), 0);
}

#[test]
fn unknown_tags_are_rejected_or_report_zero() {
    let alloc = allocator();
    let _ptr = alloc.allocate(64, MemoryDomain::Host).expect("allocate");

    assert_eq!(MemoryDomain::try_from(9), Err(KernelError::UnknownDomain(9)));
    assert_eq!(alloc.ledger().usage_by_tag(9), 0);
    assert_eq!(alloc.ledger().usage_by_tag(0), 64);
}

#[test]
fn exhausted_device_memory_is_an_allocation_failure() {
    let alloc = TrackingAllocator::with_ledger(
        Arc::new(CpuDevice::with_device_memory_limit(1024)),
        Arc::new(MemoryLedger::new()),
    );
    let _held = alloc.allocate(1000, MemoryDomain::Device).expect("allocate");

    let err = alloc.allocate(100, MemoryDomain::Device).expect_err("limit exceeded");
    assert_eq!(err, KernelError::AllocationFailure { domain: MemoryDomain::Device, size: 100 });
    assert_eq!(alloc.usage(MemoryDomain::Device), 1000);

    // Host memory is not limited by the device budget.
    alloc.allocate(4096, MemoryDomain::Host).expect("host allocate");
}
