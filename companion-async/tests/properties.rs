//! End-to-end behavior of futures, contexts and shared sessions on a real
//! runtime with serial queues.

use companion_async::prelude::*;
use companion_async::testing::{
    assert_cancelled, assert_failed_with, assert_resolved, init_test_tracing, CallCounter,
    RecordingSession,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};

type LogManager = DeltaUpdateManager<String, RecordingSession, Vec<String>>;

#[test]
fn exactly_one_resolution_takes_effect() {
    let future: Future<u32> = Future::new();
    assert!(future.resolve(1));
    assert!(!future.fail(FutureError::msg("late")));
    assert!(!future.resolve(2));
    future.cancel();
    assert_resolved(&future, &1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_fire_once_on_their_queue_in_order() {
    init_test_tracing();
    let queue = Queue::serial("handlers");
    let future: Future<u32> = Future::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();

    for label in ["first", "second"] {
        let seen = seen.clone();
        future.on_completion(&queue, move |result| {
            seen.lock().push(format!("{label} {result:?}"));
        });
    }
    future.resolve(7);

    let late = seen.clone();
    let (sender, receiver) = tokio::sync::oneshot::channel();
    future.on_completion(&queue, move |result| {
        late.lock().push(format!("late {result:?}"));
        let _ = sender.send(());
    });
    receiver.await.expect("late handler fired");

    assert_eq!(
        *seen.lock(),
        vec!["first Ok(7)", "second Ok(7)", "late Ok(7)"]
    );
}

#[tokio::test]
async fn chain_skips_continuation_after_failure() {
    let calls = CallCounter::new();
    let counted = calls.clone();
    let chained = Future::<u32>::from_error(FutureError::msg("device offline"))
        .chain(&Queue::inline(), move |value| {
            counted.increment();
            Future::from_result(value + 1)
        });

    assert_eq!(calls.get(), 0);
    assert_failed_with(&chained, "device offline");
}

#[tokio::test]
async fn race_cancels_every_loser() {
    let contenders: Vec<Future<u32>> = (0..3).map(|_| Future::new()).collect();
    let winner = race(contenders.clone());

    contenders[1].resolve(11);

    assert_eq!(winner.await.ok(), Some(11));
    assert_cancelled(&contenders[0]);
    assert_cancelled(&contenders[2]);
}

#[tokio::test]
async fn collect_fails_fast_and_cancels_pending() {
    let pending: Future<u32> = Future::new();
    let failing: Future<u32> = Future::new();
    let collected = collect(vec![pending.clone(), failing.clone()]);

    failing.fail(FutureError::msg("no such bundle"));

    assert_failed_with(&collected, "no such bundle");
    assert_cancelled(&pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_cancels_work_that_never_resolves() {
    let queue = Queue::serial("timers");
    let work: Future<u32> = Future::new();
    let started = Instant::now();

    let result = work
        .timeout(&queue, Duration::from_millis(100), "launching app")
        .await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(result.is_err_and(|e| e.is_timed_out()));
    assert_cancelled(&work);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_chain_stops_spawned_work() {
    let queue = Queue::serial("work");
    let finished = CallCounter::new();
    let finished_clone = finished.clone();
    let work = Future::spawn(&queue, async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        finished_clone.increment();
        Ok(1u32)
    });
    let derived = work.map(&queue, |value| value * 2).map(&queue, |value| value + 1);

    derived.cancel().await.expect("drain resolves");

    assert_cancelled(&work);
    assert_eq!(finished.get(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_recovers_after_transient_failures() {
    let queue = Queue::serial("retry");
    let attempts = CallCounter::new();
    let counted = attempts.clone();
    let config = RetryConfig::new()
        .with_max_attempts(4)
        .with_base_delay_ms(5)
        .with_backoff(BackoffStrategy::Constant);

    let result = retry(&queue, config, move || {
        counted.increment();
        if counted.get() < 3 {
            Future::from_error(FutureError::msg("port busy"))
        } else {
            Future::from_result("ready")
        }
    })
    .await;

    assert_eq!(result.ok(), Some("ready"));
    assert_eq!(attempts.get(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn context_teardown_runs_once_for_every_consumer_outcome() {
    let queue = Queue::serial("contexts");
    let released: Arc<Mutex<Vec<FutureState>>> = Arc::default();

    let context = |released: &Arc<Mutex<Vec<FutureState>>>| {
        let released = released.clone();
        FutureContext::with_context(move || {
            let teardown = Teardown::new(&Queue::inline(), move |state| {
                released.lock().push(state);
                Future::empty()
            });
            Future::from_result(("sim".to_string(), teardown))
        })
    };

    let succeeded = context(&released).pop(&queue, |name| Future::from_result(name.len()));
    assert_eq!(succeeded.await.ok(), Some(3));

    let failed: Future<usize> = context(&released)
        .pop(&queue, |_| Future::from_error(FutureError::msg("boot failed")));
    assert!(failed.await.is_err());

    let consumer: Future<usize> = Future::new();
    let consumer_clone = consumer.clone();
    let (entered, entered_rx) = tokio::sync::oneshot::channel();
    let cancelled = context(&released).pop(&queue, move |_| {
        let _ = entered.send(());
        consumer_clone
    });
    entered_rx.await.expect("consumer entered");
    cancelled.cancel();
    assert!(cancelled.await.is_err_and(|e| e.is_cancelled()));

    let observed = released.clone();
    resolve_when(&queue, Duration::from_millis(5), move || observed.lock().len() == 3)
        .timeout(&queue, Duration::from_secs(5), "releasing contexts")
        .await
        .expect("every context released");
    assert_cancelled(&consumer);

    assert_eq!(
        *released.lock(),
        vec![FutureState::Done, FutureState::Failed, FutureState::Cancelled]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_share_one_session() {
    init_test_tracing();
    let manager = LogManager::new(DeltaManagerConfig::new("logs"));
    let starts = CallCounter::new();
    let gate: Future<RecordingSession> = Future::new();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let starts = starts.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                manager.start("udid".to_string(), move || {
                    starts.increment();
                    gate
                })
            })
        })
        .collect();

    let mut attached = Vec::new();
    for handle in handles {
        attached.push(handle.await.expect("start task"));
    }
    let session = RecordingSession::new();
    gate.resolve(session.clone());

    for token in attached {
        let token = token.await.expect("attached");
        assert!(token.same_session(&session));
    }
    assert_eq!(starts.get(), 1);
    assert_eq!(manager.ref_count(&"udid".to_string()), 8);
}

#[tokio::test]
async fn last_stop_alone_terminates_and_returns_payload() {
    let manager = LogManager::new(DeltaManagerConfig::new("logs"));
    let key = "udid".to_string();
    let session = RecordingSession::new();

    for _ in 0..3 {
        let session = session.clone();
        manager
            .start(key.clone(), move || Future::from_result(session))
            .await
            .expect("attached");
    }
    manager
        .update(&key, "launchd: started".to_string())
        .await
        .expect("update forwarded");

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(manager.stop(&key).await.expect("stop"));
    }

    assert_eq!(
        outcomes,
        vec![
            StopOutcome::Detached { remaining: 2 },
            StopOutcome::Detached { remaining: 1 },
            StopOutcome::Stopped(vec!["launchd: started".to_string()]),
        ]
    );
    assert_eq!(session.terminations(), 1);
    assert!(manager.active_keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_stuck_teardown_does_not_hold_up_other_keys() {
    let manager = LogManager::new(DeltaManagerConfig::new("logs"));
    let stuck = "stuck".to_string();
    let never = Future::new();
    let held = RecordingSession::with_teardown(&never);
    manager
        .start(stuck.clone(), move || Future::from_result(held))
        .await
        .expect("attached");
    let stuck_stop = manager.stop(&stuck);

    let other = "other".to_string();
    let session = RecordingSession::new();
    let started = session.clone();
    manager
        .start(other.clone(), move || Future::from_result(started))
        .await
        .expect("attached");
    assert_eq!(manager.active_keys(), vec![other.clone()]);
    assert_eq!(manager.ref_count(&stuck), 0);

    manager
        .update(&other, "frame".to_string())
        .await
        .expect("update forwarded");
    let outcome = manager
        .stop(&other)
        .timeout(&Queue::inline(), Duration::from_secs(1), "stop of an unrelated key")
        .await
        .expect("stop");

    assert_eq!(outcome, StopOutcome::Stopped(vec!["frame".to_string()]));
    assert!(manager.active_keys().is_empty());
    assert_eq!(manager.ref_count(&stuck), 0);
    assert_eq!(
        manager.session_info(&stuck).map(|info| info.state),
        Some(SessionState::Stopping)
    );
    assert_eq!(stuck_stop.state(), FutureState::Running);
}

#[tokio::test]
async fn stop_without_session_reports_already_stopped() {
    let manager = LogManager::new(DeltaManagerConfig::new("video"));
    let key = "missing".to_string();

    let outcome = manager.stop(&key).await.expect("stop never fails here");

    assert_eq!(outcome, StopOutcome::AlreadyStopped);
    assert!(manager.active_keys().is_empty());
    let update = manager.update(&key, "frame".to_string()).await;
    assert!(matches!(update, Err(FutureError::SessionNotFound { .. })));
}

#[test]
fn blocking_bridge_times_out_the_waiter_only() {
    let future: Future<u32> = Future::new();
    let result = future.await_timeout(Duration::from_millis(20));

    assert!(result.is_err_and(|e| e.is_timed_out()));
    assert_eq!(future.state(), FutureState::Running);
    tokio_test::assert_ok!(Future::from_result(3u32).block());
}
