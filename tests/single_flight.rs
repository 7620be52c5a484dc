//! At most one producer invocation per key at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use compute_flow::{ComputeFunction, ComputeRuntime, ComputedState};
use futures::future::join_all;
use tokio::time::Instant;

/// A producer that sleeps, tracking total and concurrent invocations.
struct Probe {
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Probe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    fn function(self: &Arc<Self>, runtime: &ComputeRuntime, delay: Duration) -> ComputeFunction<u32, u32> {
        let probe = self.clone();
        runtime.function("probe", move |n: u32, _previous, _cancel| {
            let probe = probe.clone();
            async move {
                probe.calls.fetch_add(1, Ordering::SeqCst);
                let running = probe.running.fetch_add(1, Ordering::SeqCst) + 1;
                probe.max_running.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                probe.running.fetch_sub(1, Ordering::SeqCst);
                Ok(n + 100)
            }
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_computation() {
    let runtime = ComputeRuntime::new();
    let probe = Probe::new();
    let f = probe.function(&runtime, Duration::from_millis(50));

    let nodes = join_all((0..10).map(|_| f.computed(1))).await;

    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    let tag = nodes[0].as_ref().unwrap().tag();
    for node in nodes {
        let node = node.unwrap();
        assert_eq!(node.tag(), tag);
        assert_eq!(*node.output().unwrap(), 101);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_share_one_computation() {
    let runtime = ComputeRuntime::new();
    let probe = Probe::new();
    let f = probe.function(&runtime, Duration::from_millis(20));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let f = f.clone();
            tokio::spawn(async move { f.get(7).await })
        })
        .collect();
    for task in join_all(tasks).await {
        assert_eq!(*task.unwrap().unwrap(), 107);
    }

    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert_eq!(probe.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_keys_compute_in_parallel() {
    let runtime = ComputeRuntime::new();
    let probe = Probe::new();
    let f = probe.function(&runtime, Duration::from_millis(100));

    let start = Instant::now();
    let results = f.get_all(0..4).await;
    assert!(start.elapsed() < Duration::from_millis(150));

    assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    assert_eq!(probe.max_running.load(Ordering::SeqCst), 4);
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(*result.unwrap(), n as u32 + 100);
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalidated_mid_flight_recomputes_exactly_once() {
    let runtime = ComputeRuntime::new();
    let probe = Probe::new();
    let f = probe.function(&runtime, Duration::from_millis(100));

    let leader = tokio::spawn({
        let f = f.clone();
        async move { f.computed(5).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let f = f.clone();
            tokio::spawn(async move { f.computed(5).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Invalidate the in-flight node.
    assert!(f.invalidate(&5));

    // The leader still gets its own result, but the node is not published.
    let first = leader.await.unwrap().unwrap();
    assert_eq!(first.state(), ComputedState::Invalidated);
    assert_eq!(*first.output().unwrap(), 105);

    let mut tags = Vec::new();
    for waiter in join_all(waiters).await {
        let node = waiter.unwrap().unwrap();
        assert_eq!(node.state(), ComputedState::Computed);
        tags.push(node.tag());
    }
    tags.dedup();
    assert_eq!(tags.len(), 1);
    assert!(tags[0].is_newer_than(first.tag()));

    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    assert_eq!(probe.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cached_value_is_served_without_recomputing() {
    let runtime = ComputeRuntime::new();
    let probe = Probe::new();
    let f = probe.function(&runtime, Duration::ZERO);

    let first = f.computed(1).await.unwrap();
    let second = f.computed(1).await.unwrap();
    assert_eq!(first.tag(), second.tag());
    assert_eq!(f.try_get_cached(&1).unwrap().tag(), first.tag());
    assert!(f.try_get_cached(&2).is_none());
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
}
