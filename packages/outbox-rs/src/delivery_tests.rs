//! End-to-end delivery tests against a running dispatcher.
//!
//! These use short real-time intervals and generous timeouts.

#[cfg(test)]
mod delivery_tests {
    use crate::backoff::BackoffSeries;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::OutboxDispatcher;
    use crate::envelope::Envelope;
    use crate::handler::HandlerRegistry;
    use crate::store::{InMemoryOutboxStore, OutboxSnapshot, OutboxStore};
    use crate::testing::{wait_for, CallLog, FailingHandler, FlakyHandler, RecordingHandler, SlowHandler};
    use crate::writer::{EnqueueResult, OutboxWriter};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig::default()
            .with_dispatch_interval(Duration::from_millis(20))
            .with_backoff(BackoffSeries::from_millis(&[10]).unwrap())
            .with_max_attempts(5)
    }

    fn setup(registry: HandlerRegistry, config: DispatcherConfig) -> (OutboxDispatcher, OutboxWriter) {
        let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
        let writer = OutboxWriter::new(store.clone());
        let dispatcher = OutboxDispatcher::new(store, registry, config).unwrap();
        (dispatcher, writer)
    }

    fn event(aggregate_id: &str) -> Envelope {
        Envelope::new("order.placed", "order", aggregate_id, json!({ "id": aggregate_id }))
    }

    async fn snapshot(dispatcher: &OutboxDispatcher) -> OutboxSnapshot {
        dispatcher.snapshot().await.unwrap()
    }

    async fn wait_for_snapshot(dispatcher: &OutboxDispatcher, expected: OutboxSnapshot) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if snapshot(dispatcher).await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn idle() -> OutboxSnapshot {
        OutboxSnapshot { queued: 0, failed: 0 }
    }

    // ==========================================================================
    // Deduplication
    // ==========================================================================

    #[tokio::test]
    async fn test_duplicate_dedup_key_yields_one_entry() {
        let (dispatcher, writer) = setup(HandlerRegistry::new(), fast_config());

        let keyed = || {
            Envelope::builder("order.placed", "order", "o-1", json!({}))
                .dedup_key("order.placed:o-1")
                .build()
        };

        assert!(writer.enqueue(keyed()).await.unwrap().is_enqueued());
        assert_eq!(writer.enqueue(keyed()).await.unwrap(), EnqueueResult::Duplicate);
        assert_eq!(snapshot(&dispatcher).await.queued, 1);
    }

    #[tokio::test]
    async fn test_dedup_key_reusable_after_delivery() {
        let recorder = RecordingHandler::new("order.placed");
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(recorder.clone()), fast_config());

        let keyed = || {
            Envelope::builder("order.placed", "order", "o-1", json!({}))
                .dedup_key("order.placed:o-1")
                .build()
        };

        dispatcher.start();
        writer.enqueue(keyed()).await.unwrap();
        assert!(wait_for(|| recorder.count() == 1, TIMEOUT).await);
        assert!(wait_for_snapshot(&dispatcher, idle()).await);
        dispatcher.shutdown().await;

        assert!(writer.enqueue(keyed()).await.unwrap().is_enqueued());
        assert_eq!(snapshot(&dispatcher).await.queued, 1);
    }

    // ==========================================================================
    // Ordering
    // ==========================================================================

    #[tokio::test]
    async fn test_higher_priority_processed_first() {
        let recorder = RecordingHandler::new("order.placed");
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(recorder.clone()), fast_config());

        // Enqueued before start so all of them are due in the same tick
        for (id, priority) in [("low", 0), ("high", 10), ("mid", 5), ("lowest", -3)] {
            let envelope = Envelope::builder("order.placed", "order", id, json!({}))
                .priority(priority)
                .build();
            writer.enqueue(envelope).await.unwrap();
        }

        dispatcher.start();
        assert!(wait_for(|| recorder.count() == 4, TIMEOUT).await);
        dispatcher.shutdown().await;

        assert_eq!(recorder.aggregate_ids(), vec!["high", "mid", "low", "lowest"]);
    }

    #[tokio::test]
    async fn test_priority_dominates_due_time() {
        let recorder = RecordingHandler::new("order.placed");
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(recorder.clone()), fast_config());

        let now = Utc::now();
        let old_low = Envelope::builder("order.placed", "order", "old-low", json!({}))
            .deliver_after(now - chrono::Duration::minutes(10))
            .build();
        let fresh_high = Envelope::builder("order.placed", "order", "fresh-high", json!({}))
            .priority(1)
            .deliver_after(now)
            .build();

        writer.enqueue(old_low).await.unwrap();
        writer.enqueue(fresh_high).await.unwrap();

        dispatcher.start();
        assert!(wait_for(|| recorder.count() == 2, TIMEOUT).await);
        dispatcher.shutdown().await;

        assert_eq!(recorder.aggregate_ids(), vec!["fresh-high", "old-low"]);
    }

    #[tokio::test]
    async fn test_equal_priority_earlier_due_time_first() {
        let recorder = RecordingHandler::new("order.placed");
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(recorder.clone()), fast_config());

        let now = Utc::now();
        let later = Envelope::builder("order.placed", "order", "later", json!({}))
            .deliver_after(now - chrono::Duration::seconds(1))
            .build();
        let earlier = Envelope::builder("order.placed", "order", "earlier", json!({}))
            .deliver_after(now - chrono::Duration::seconds(5))
            .build();

        // Enqueue order is the reverse of due order
        writer.enqueue(later).await.unwrap();
        writer.enqueue(earlier).await.unwrap();

        dispatcher.start();
        assert!(wait_for(|| recorder.count() == 2, TIMEOUT).await);
        dispatcher.shutdown().await;

        assert_eq!(recorder.aggregate_ids(), vec!["earlier", "later"]);
    }

    // ==========================================================================
    // Scheduling
    // ==========================================================================

    #[tokio::test]
    async fn test_deferred_envelope_waits_until_due() {
        let recorder = RecordingHandler::new("order.placed");
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(recorder.clone()), fast_config());
        dispatcher.start();

        let started = Instant::now();
        let envelope = Envelope::builder("order.placed", "order", "o-1", json!({}))
            .deliver_in(Duration::from_millis(200))
            .build();
        writer.enqueue(envelope).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(snapshot(&dispatcher).await.queued, 1);
        assert_eq!(recorder.count(), 0);

        assert!(wait_for(|| recorder.count() == 1, TIMEOUT).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(wait_for_snapshot(&dispatcher, idle()).await);

        dispatcher.shutdown().await;
    }

    // ==========================================================================
    // Retries and archival
    // ==========================================================================

    #[tokio::test]
    async fn test_handler_failing_once_is_retried_then_delivered() {
        let flaky = FlakyHandler::new("order.placed", 1);
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(flaky.clone()), fast_config());
        dispatcher.start();

        writer.enqueue(event("o-1")).await.unwrap();

        assert!(wait_for_snapshot(&dispatcher, idle()).await);
        assert!(flaky.calls() >= 2);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_always_failing_handler_archived_after_max_attempts() {
        let failing = FailingHandler::new("order.placed").with_message("payment gateway down");
        let (dispatcher, writer) = setup(
            HandlerRegistry::new().with_handler(failing.clone()),
            fast_config().with_max_attempts(2),
        );
        dispatcher.start();

        writer.enqueue(event("o-1")).await.unwrap();

        assert!(wait_for_snapshot(&dispatcher, OutboxSnapshot { queued: 0, failed: 1 }).await);
        dispatcher.shutdown().await;

        assert_eq!(failing.calls(), 2);
        let failed = dispatcher.failed_entries().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(failed[0].envelope.aggregate_id(), "o-1");
        assert_eq!(failed[0].last_error.as_deref(), Some("payment gateway down"));
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_failed_attempt() {
        let recorder = RecordingHandler::new("order.placed");
        let mut registry = HandlerRegistry::new().with_handler(recorder.clone());
        registry.register_fn("order.cancelled", |envelope| async move {
            if envelope.aggregate_id() == "o-1" {
                panic!("refund ledger unavailable");
            }
            Ok(())
        });
        let (dispatcher, writer) = setup(registry, fast_config().with_max_attempts(2));
        dispatcher.start();

        writer
            .enqueue(Envelope::new("order.cancelled", "order", "o-1", json!({})))
            .await
            .unwrap();
        writer.enqueue(event("o-2")).await.unwrap();

        assert!(wait_for_snapshot(&dispatcher, OutboxSnapshot { queued: 0, failed: 1 }).await);
        assert!(dispatcher.is_running());

        // The loop survived and keeps delivering
        writer.enqueue(event("o-3")).await.unwrap();
        assert!(wait_for(|| recorder.count() == 2, TIMEOUT).await);
        dispatcher.shutdown().await;

        assert_eq!(recorder.aggregate_ids(), vec!["o-2", "o-3"]);
        let failed = dispatcher.failed_entries().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(failed[0].envelope.event_type(), "order.cancelled");
        assert_eq!(failed[0].last_error.as_deref(), Some("handler panicked: refund ledger unavailable"));
    }

    #[tokio::test]
    async fn test_event_without_handlers_is_removed_not_failed() {
        let recorder = RecordingHandler::new("order.shipped");
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(recorder.clone()), fast_config());
        dispatcher.start();

        writer.enqueue(event("o-1")).await.unwrap();

        assert!(wait_for_snapshot(&dispatcher, idle()).await);
        assert_eq!(recorder.count(), 0);
        assert!(dispatcher.failed_entries().await.unwrap().is_empty());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_handler_short_circuits_and_retry_reruns_group() {
        let log = CallLog::new();
        let registry = HandlerRegistry::new()
            .with_handler(RecordingHandler::new("order.placed").with_log(&log, "reserve-stock"))
            .with_handler(FlakyHandler::new("order.placed", 1).with_log(&log, "charge-card"))
            .with_handler(RecordingHandler::new("order.placed").with_log(&log, "send-receipt"));
        let (dispatcher, writer) = setup(registry, fast_config());
        dispatcher.start();

        writer.enqueue(event("o-1")).await.unwrap();

        assert!(wait_for_snapshot(&dispatcher, idle()).await);
        dispatcher.shutdown().await;

        assert_eq!(
            log.calls(),
            vec!["reserve-stock", "charge-card", "reserve-stock", "charge-card", "send-receipt"]
        );
    }

    // ==========================================================================
    // Lifecycle
    // ==========================================================================

    #[tokio::test]
    async fn test_repeated_start_never_processes_concurrently() {
        let slow = SlowHandler::new("order.placed", Duration::from_millis(30));
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(slow.clone()), fast_config());

        for _ in 0..5 {
            dispatcher.start();
        }
        assert!(dispatcher.is_running());

        for i in 0..5 {
            writer.enqueue(event(&format!("o-{}", i))).await.unwrap();
        }

        assert!(wait_for_snapshot(&dispatcher, idle()).await);
        dispatcher.shutdown().await;

        assert_eq!(slow.calls(), 5);
        assert_eq!(slow.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_stopped_dispatcher_leaves_entries_queued_until_restart() {
        let recorder = RecordingHandler::new("order.placed");
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(recorder.clone()), fast_config());

        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.stop();
        assert!(!dispatcher.is_running());

        writer.enqueue(event("o-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(snapshot(&dispatcher).await.queued, 1);
        assert_eq!(recorder.count(), 0);

        dispatcher.start();
        assert!(wait_for(|| recorder.count() == 1, TIMEOUT).await);
        assert!(wait_for_snapshot(&dispatcher, idle()).await);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_tick_finish() {
        let slow = SlowHandler::new("order.placed", Duration::from_millis(150));
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(slow.clone()), fast_config());

        writer.enqueue(event("o-1")).await.unwrap();
        dispatcher.start();
        assert!(wait_for(|| slow.calls() == 1, TIMEOUT).await);

        dispatcher.shutdown().await;

        // The in-flight attempt completed and was recorded before shutdown returned
        assert_eq!(snapshot(&dispatcher).await, idle());
        assert_eq!(slow.calls(), 1);
    }

    #[tokio::test]
    async fn test_slow_handler_never_overlaps_across_ticks() {
        let slow = SlowHandler::new("order.placed", Duration::from_millis(100));
        let config = fast_config().with_dispatch_interval(Duration::from_millis(10));
        let (dispatcher, writer) = setup(HandlerRegistry::new().with_handler(slow.clone()), config);
        dispatcher.start();

        for i in 0..3 {
            writer.enqueue(event(&format!("o-{}", i))).await.unwrap();
        }

        assert!(wait_for_snapshot(&dispatcher, idle()).await);
        dispatcher.shutdown().await;

        assert_eq!(slow.calls(), 3);
        assert_eq!(slow.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_disabled_dispatcher_leaves_entries_untouched() {
        let recorder = RecordingHandler::new("order.placed");
        let (dispatcher, writer) = setup(
            HandlerRegistry::new().with_handler(recorder.clone()),
            fast_config().with_enabled(false),
        );
        dispatcher.start();

        writer.enqueue(event("o-1")).await.unwrap();
        writer.enqueue(event("o-2")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(snapshot(&dispatcher).await.queued, 2);
        assert_eq!(recorder.count(), 0);

        dispatcher.set_enabled(true);
        assert!(wait_for(|| recorder.count() == 2, TIMEOUT).await);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_fails_at_construction() {
        let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
        let result = OutboxDispatcher::new(
            store,
            HandlerRegistry::new(),
            fast_config().with_dispatch_interval(Duration::ZERO),
        );
        assert!(matches!(result, Err(crate::OutboxError::Config { .. })));
    }
}
