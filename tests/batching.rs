mod common;

use common::MemoryStore;
use pg_log_sink::batcher::{BatchedSink, FlushOutcome, SinkEvent};
use pg_log_sink::config::BatchConfig;
use pg_log_sink::error::{ConfigError, SinkError};
use pg_log_sink::lifecycle::ShutdownTrigger;
use pg_log_sink::record::LogRecord;
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::level_filters::LevelFilter;

fn config() -> BatchConfig {
    BatchConfig::default().without_lifecycle_hooks()
}

fn record(message: &str) -> LogRecord {
    LogRecord::new("info").with_message(message)
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn below_threshold_nothing_is_inserted() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config().with_batch_size(5))
        .await
        .unwrap();

    for i in 0..4 {
        sink.log(record(&format!("r{i}")));
    }
    tokio::task::yield_now().await;

    assert_eq!(sink.pending_len(), 4);
    assert!(store.state().attempts.is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reaching_batch_size_flushes_whole_buffer() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config().with_batch_size(3))
        .await
        .unwrap();

    for i in 0..7 {
        sink.log(record(&format!("r{i}")));
    }
    assert_eq!(sink.pending_len(), 1);

    sink.settle().await;
    let state = store.state();
    assert_eq!(state.batches, vec![3, 3]);
    assert_eq!(state.rows.len(), 6);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn full_batch_is_delivered_in_order_with_logged_events() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(
        store.clone(),
        config()
            .with_batch_size(2)
            .with_flush_interval(Duration::from_millis(1000)),
    )
    .await
    .unwrap();
    let mut events = sink.subscribe();

    sink.log(LogRecord::new("info").with_message("start"));
    sink.log(
        LogRecord::new("error")
            .with_message("fail")
            .with_field("code", 500),
    );
    assert_eq!(sink.pending_len(), 0);

    sink.settle().await;
    assert_eq!(store.messages(), vec!["start", "fail"]);
    assert_eq!(store.state().rows[0].metadata, None);
    assert_eq!(
        store.state().rows[1].metadata.as_ref().map(|m| m["code"].clone()),
        Some(json!(500))
    );

    let first = events.try_recv().unwrap();
    let second = events.try_recv().unwrap();
    assert!(matches!(first, SinkEvent::Logged(ref r) if r.message.as_deref() == Some("start")));
    assert!(matches!(second, SinkEvent::Logged(ref r) if r.message.as_deref() == Some("fail")));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn timer_flushes_partial_batch() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(
        store.clone(),
        config().with_flush_interval(Duration::from_secs(1)),
    )
    .await
    .unwrap();

    sink.log(record("lonely"));

    tokio::time::sleep(Duration::from_millis(999)).await;
    sink.settle().await;
    assert!(store.state().batches.is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    sink.settle().await;
    assert_eq!(store.state().batches, vec![1]);
    assert_eq!(sink.pending_len(), 0);

    // Idle ticks never issue empty inserts.
    tokio::time::sleep(Duration::from_secs(5)).await;
    sink.settle().await;
    assert_eq!(store.state().attempts.len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn retries_with_linear_backoff_until_success() {
    let store = MemoryStore::failing_first(2);
    let sink = BatchedSink::new(
        store.clone(),
        config()
            .with_max_retries(3)
            .with_retry_delay(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    let mut events = sink.subscribe();

    sink.log(record("eventually"));
    assert_eq!(sink.flush().await, FlushOutcome::Delivered(1));

    let attempts = store.state().attempts.clone();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[1] - attempts[0], Duration::from_millis(100));
    assert_eq!(attempts[2] - attempts[1], Duration::from_millis(200));
    assert_eq!(store.messages(), vec!["eventually"]);
    assert!(matches!(events.try_recv(), Ok(SinkEvent::Logged(_))));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn exhausted_batch_is_dropped_with_one_error_event() {
    let store = MemoryStore::always_failing();
    let sink = BatchedSink::new(
        store.clone(),
        config()
            .with_batch_size(2)
            .with_max_retries(3)
            .with_retry_delay(Duration::from_millis(10)),
    )
    .await
    .unwrap();
    let mut events = sink.subscribe();

    sink.log(record("a"));
    sink.log(record("b"));
    sink.settle().await;

    match events.try_recv() {
        Ok(SinkEvent::Error {
            dropped,
            attempts,
            error,
        }) => {
            assert_eq!(dropped, 2);
            assert_eq!(attempts, 3);
            assert!(error.contains("connection refused"));
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    tokio::time::sleep(Duration::from_secs(30)).await;
    sink.settle().await;
    assert_eq!(store.state().attempts.len(), 3);
    assert!(store.state().rows.is_empty());
    assert_eq!(sink.pending_len(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn hung_attempt_times_out_and_is_retried() {
    let store = MemoryStore::hanging_first(Duration::from_secs(60));
    let sink = BatchedSink::new(
        store.clone(),
        config()
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(10))
            .with_attempt_timeout(Duration::from_secs(1)),
    )
    .await
    .unwrap();

    sink.log(record("slow"));
    assert_eq!(sink.flush().await, FlushOutcome::Delivered(1));
    assert_eq!(store.state().attempts.len(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn flushing_an_empty_buffer_is_a_no_op() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config()).await.unwrap();

    assert_eq!(sink.flush().await, FlushOutcome::Empty);
    assert!(store.state().attempts.is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn close_drains_before_releasing_and_runs_once() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config()).await.unwrap();

    for i in 0..3 {
        sink.log(record(&format!("r{i}")));
    }
    sink.close().await;
    sink.close().await;
    sink.close_with(ShutdownTrigger::Terminate).await;

    let state = store.state();
    assert_eq!(state.batches, vec![3]);
    assert_eq!(state.ops, vec!["insert", "close"]);
    assert_eq!(state.closes, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_closes_share_one_drain() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config()).await.unwrap();
    sink.log(record("last words"));

    tokio::join!(sink.close(), sink.prepare_suspend());

    let state = store.state();
    assert_eq!(state.batches, vec![1]);
    assert_eq!(state.closes, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn close_waits_for_deliveries_in_flight() {
    let store = MemoryStore::with_insert_delay(Duration::from_millis(500));
    let sink = BatchedSink::new(store.clone(), config().with_batch_size(2))
        .await
        .unwrap();

    sink.log(record("a"));
    sink.log(record("b"));
    sink.log(record("c"));
    sink.close().await;

    let state = store.state();
    assert_eq!(state.rows.len(), 3);
    assert_eq!(state.ops.last(), Some(&"close"));
    assert_eq!(state.ops.iter().filter(|op| **op == "insert").count(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn records_after_close_are_discarded() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config()).await.unwrap();

    sink.close().await;
    assert!(sink.is_closing());
    sink.log(record("too late"));

    assert_eq!(sink.pending_len(), 0);
    assert_eq!(sink.flush().await, FlushOutcome::Empty);
    assert!(store.state().attempts.is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn background_shutdown_trigger_drains() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config()).await.unwrap();
    sink.log(record("suspending"));

    sink.trigger_shutdown(ShutdownTrigger::Suspend).await.unwrap();

    assert_eq!(store.messages(), vec!["suspending"]);
    assert_eq!(store.state().closes, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn panic_drain_keeps_backend_open_until_close() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config()).await.unwrap();
    sink.log(record("before panic"));

    sink.close_with(ShutdownTrigger::Panic).await;

    assert_eq!(store.messages(), vec!["before panic"]);
    assert_eq!(store.state().closes, 0);
    assert!(sink.is_closing());

    sink.log(record("after panic"));
    assert_eq!(sink.pending_len(), 0);

    sink.close().await;
    let state = store.state();
    assert_eq!(state.ops, vec!["insert", "close"]);
    assert_eq!(state.closes, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn silenced_sink_buffers_nothing() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config().silent(true))
        .await
        .unwrap();

    sink.log(record("hidden"));
    assert_eq!(sink.pending_len(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn records_below_level_filter_are_skipped() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config().with_level(LevelFilter::WARN))
        .await
        .unwrap();

    sink.log(LogRecord::new("debug").with_message("noise"));
    sink.log(LogRecord::new("info").with_message("chatter"));
    sink.log(LogRecord::new("warn").with_message("careful"));
    sink.log(LogRecord::new("error").with_message("broken"));

    sink.flush().await;
    assert_eq!(store.messages(), vec!["careful", "broken"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn field_bags_are_normalized() {
    let store = MemoryStore::new();
    let sink = BatchedSink::new(store.clone(), config()).await.unwrap();

    let fields = match json!({ "level": "info", "message": "plain" }) {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => unreachable!(),
    };
    sink.log_fields(fields);
    sink.flush().await;

    let state = store.state();
    assert_eq!(state.rows[0].metadata, None);
    assert_eq!(state.rows[0].level, "info");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn bootstrap_failure_is_fatal() {
    let store = MemoryStore::failing_bootstrap();
    let err = BatchedSink::new(store.clone(), config()).await.err().unwrap();

    assert!(matches!(err, SinkError::Bootstrap { .. }));
    assert!(err.to_string().contains("memory"));
    assert_eq!(store.state().bootstraps, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn bootstrap_against_existing_table_keeps_rows() {
    let store = MemoryStore::with_rows(vec![record("old")]);

    let first = BatchedSink::new(store.clone(), config()).await.unwrap();
    let second = BatchedSink::new(store.clone(), config()).await.unwrap();

    assert_eq!(store.state().bootstraps, 2);
    assert_eq!(store.messages(), vec!["old"]);
    drop((first, second));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn degenerate_config_is_rejected_before_bootstrap() {
    let store = MemoryStore::new();
    let err = BatchedSink::new(store.clone(), config().with_batch_size(0))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, SinkError::Config(ConfigError::ZeroBatchSize)));
    assert_eq!(store.state().bootstraps, 0);
}
