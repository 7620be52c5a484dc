//! Producer failures, cycles, panics and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use compute_flow::{
    CancellationToken, ComputeContext, ComputeError, ComputeFunction, ComputeResultExt,
    ComputeRuntime, Computed, ComputedOptions, ComputedState, InvalidationReason,
};

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("user {0} not found")]
struct NotFound(u32);

fn failing(
    runtime: &ComputeRuntime,
    options: ComputedOptions,
) -> (ComputeFunction<u32, String>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let f = runtime.function_with_options("user", options, {
        let calls = calls.clone();
        move |id: u32, _previous, _cancel| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::Error::new(NotFound(id)))
            }
        }
    });
    (f, calls)
}

// ============================================================================
// Producer errors
// ============================================================================

#[tokio::test]
async fn test_errors_are_sticky() {
    let runtime = ComputeRuntime::new();
    let (user, calls) = failing(&runtime, ComputedOptions::default());

    let err = user.get(7).await.unwrap_err();
    assert_eq!(err.to_string(), "user 7 not found");
    assert_eq!(err.downcast_ref::<NotFound>(), Some(&NotFound(7)));
    assert!(!err.is_system());

    // The error is cached as the output of a computed node.
    let node = user.computed(7).await.unwrap();
    assert_eq!(node.state(), ComputedState::Computed);
    assert!(node.output().is_err());
    user.get(7).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Retrying means invalidating.
    assert!(user.invalidate(&7));
    user.get(7).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_downcast_err() {
    let runtime = ComputeRuntime::new();
    let (user, _) = failing(&runtime, ComputedOptions::default());

    let typed = user.get(3).await.downcast_err::<NotFound>().unwrap().unwrap_err();
    assert_eq!(typed.0, 3);
}

#[tokio::test(start_paused = true)]
async fn test_error_invalidation_delay() {
    let runtime = ComputeRuntime::new();
    let options = ComputedOptions::default().with_error_invalidation_delay(Duration::from_secs(5));
    let (user, calls) = failing(&runtime, options);

    let node = user.computed(1).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(node.state(), ComputedState::Computed);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(node.state(), ComputedState::Invalidated);

    user.get(1).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auto_invalidation_delay() {
    let runtime = ComputeRuntime::new();
    let options = ComputedOptions::default().with_auto_invalidation_delay(Duration::from_secs(1));
    let f = runtime.function_with_options("now", options, |_: (), _previous, _cancel| async move {
        Ok(tokio::time::Instant::now())
    });

    let node = f.computed(()).await.unwrap();
    let reason = node.when_invalidated().await;
    assert_eq!(reason, InvalidationReason::Timeout);
    assert!(f.try_get_cached(&()).is_none());
}

// ============================================================================
// Cycles
// ============================================================================

#[tokio::test]
async fn test_cycle_is_detected() {
    let runtime = ComputeRuntime::new();
    let ping: Arc<OnceLock<ComputeFunction<u32, u32>>> = Arc::new(OnceLock::new());

    let pong = runtime.function("pong", {
        let ping = ping.clone();
        move |n: u32, _previous, _cancel| {
            let ping = ping.clone();
            async move {
                let ping = ping.get().expect("ping is set");
                Ok(*ping.get(n).await? + 1)
            }
        }
    });
    let ping_fn = runtime.function("ping", {
        let pong = pong.clone();
        move |n: u32, _previous, _cancel| {
            let pong = pong.clone();
            async move { Ok(*pong.get(n).await? + 1) }
        }
    });
    ping.set(ping_fn.clone()).unwrap();

    let err = ping_fn.get(1).await.unwrap_err();
    match err {
        ComputeError::Cycle { path } => {
            assert_eq!(path, vec!["ping(1)", "pong(1)", "ping(1)"]);
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_self_dependency_is_a_cycle() {
    let runtime = ComputeRuntime::new();
    let this: Arc<OnceLock<ComputeFunction<u32, u32>>> = Arc::new(OnceLock::new());
    let f = runtime.function("recursive", {
        let this = this.clone();
        move |n: u32, _previous, _cancel| {
            let this = this.clone();
            async move {
                let this = this.get().expect("function is set");
                Ok(*this.get(n).await?)
            }
        }
    });
    this.set(f.clone()).unwrap();

    assert!(matches!(f.get(4).await, Err(ComputeError::Cycle { .. })));
}

// ============================================================================
// Panics
// ============================================================================

#[tokio::test]
async fn test_panicking_producer_is_reported_and_retried() {
    let runtime = ComputeRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let f = runtime.function("flaky", {
        let calls = calls.clone();
        move |n: u32, _previous, _cancel| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first call panics");
                }
                Ok(n)
            }
        }
    });

    match f.get(9).await {
        Err(ComputeError::Panicked { key }) => assert_eq!(key, "flaky(9)"),
        other => panic!("expected panic error, got {other:?}"),
    }
    // The abandoned node was invalidated, so the next call recomputes.
    assert_eq!(*f.get(9).await.unwrap(), 9);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancelled_caller_does_not_abort_computation() {
    let runtime = ComputeRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let slow = runtime.function("slow", {
        let calls = calls.clone();
        move |n: u32, _previous, _cancel| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(n * 10)
            }
        }
    });

    let cancel = CancellationToken::new();
    let leader = tokio::spawn({
        let slow = slow.clone();
        let cancel = cancel.clone();
        async move { slow.get_with_cancel(3, &cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let waiter = tokio::spawn({
        let slow = slow.clone();
        async move { slow.get(3).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    cancel.cancel();
    assert!(matches!(leader.await.unwrap(), Err(ComputeError::Cancelled)));
    assert_eq!(*waiter.await.unwrap().unwrap(), 30);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_never_computes() {
    let runtime = ComputeRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let f = runtime.function("never", {
        let calls = calls.clone();
        move |n: u32, _previous, _cancel| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(n)
            }
        }
    });

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        f.get_with_cancel(1, &cancel).await,
        Err(ComputeError::Cancelled)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(runtime.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_detaches() {
    let runtime = ComputeRuntime::new();
    let slow = runtime.function("slow", |n: u32, _previous, _cancel| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(n)
    });

    let leader = tokio::spawn({
        let slow = slow.clone();
        async move { slow.get(1).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
        let slow = slow.clone();
        let cancel = cancel.clone();
        async move { slow.get_with_cancel(1, &cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    assert!(matches!(waiter.await.unwrap(), Err(ComputeError::Cancelled)));
    assert_eq!(*leader.await.unwrap().unwrap(), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_renew_after_function_dropped() {
    let runtime = ComputeRuntime::new();
    let f = runtime.function("temp", |n: u32, _previous, _cancel| async move { Ok(n) });
    let node = f.computed(1).await.unwrap();
    drop(f);

    node.invalidate();
    assert!(matches!(
        node.renew().await,
        Err(ComputeError::FunctionDropped { .. })
    ));
}

#[tokio::test]
async fn test_output_of_computing_node_is_invalid_state() {
    let runtime = ComputeRuntime::new();
    let f = runtime.function("inspect", |_: (), _previous, _cancel| async move {
        let context = ComputeContext::current().expect("producer has a context");
        let node = context.computing_node().expect("producer computes a node").clone();
        let node = Computed::<bool>::from_any(node).expect("node holds a bool");
        assert_eq!(node.state(), ComputedState::Computing);
        Ok(matches!(node.output(), Err(ComputeError::InvalidState { .. })))
    });

    assert!(*f.get(()).await.unwrap());
}
