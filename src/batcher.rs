use crate::config::BatchConfig;
use crate::error::SinkError;
use crate::lifecycle::{Lifecycle, ShutdownTrigger};
use crate::record::LogRecord;
use crate::sink::{BoxError, LogSink};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};

/// Notification published by a [`BatchedSink`].
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// One record was durably inserted. Fired in batch order, only after the
    /// whole batch was acknowledged.
    Logged(LogRecord),
    /// A batch was dropped after every attempt failed.
    Error {
        dropped: usize,
        attempts: u32,
        error: String,
    },
}

/// Result of delivering one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending; no insert was issued.
    Empty,
    Delivered(usize),
    Dropped(usize),
}

/// One batch on its way to the store, with its attempt counter.
#[derive(Debug)]
pub struct FlushAttempt {
    batch: Vec<LogRecord>,
    attempt: u32,
    max_attempts: u32,
}

impl FlushAttempt {
    pub fn new(batch: Vec<LogRecord>, max_attempts: u32) -> Self {
        Self {
            batch,
            attempt: 1,
            max_attempts: max_attempts.max(1),
        }
    }

    /// 1-based number of the current attempt.
    pub fn number(&self) -> u32 {
        self.attempt
    }

    pub fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Wait before the next attempt: `unit * attempt`, linear in the number
    /// of attempts already made.
    pub fn backoff(&self, unit: Duration) -> Duration {
        unit * self.attempt
    }

    pub fn batch(&self) -> &[LogRecord] {
        &self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    fn advance(&mut self) {
        self.attempt += 1;
    }

    fn into_batch(self) -> Vec<LogRecord> {
        self.batch
    }
}

/// Buffers [`LogRecord`]s in memory and delivers them to a [`LogSink`] in
/// batches.
///
/// A flush is triggered when the buffer reaches `batch_size`, on every
/// `flush_interval` tick with a non-empty buffer, on [`flush`](Self::flush),
/// and on close. Each batch gets up to `max_retries` insert attempts with
/// linear backoff; a batch that exhausts them is dropped and reported as
/// [`SinkEvent::Error`]. Accepting a record never blocks on I/O and never
/// fails.
///
/// Cloning is cheap; all clones share the same buffer.
#[derive(Clone)]
pub struct BatchedSink {
    inner: Arc<Inner>,
}

struct Pending {
    records: Vec<LogRecord>,
    closing: bool,
}

pub(crate) struct Inner {
    sink: Arc<dyn LogSink>,
    config: BatchConfig,
    destination: String,
    pending: Mutex<Pending>,
    inflight: watch::Sender<usize>,
    events: broadcast::Sender<SinkEvent>,
    runtime: Handle,
    lifecycle: Mutex<Option<Lifecycle>>,
    closed: OnceCell<()>,
}

impl BatchedSink {
    /// Validate `config`, bootstrap the destination, and start the flush
    /// timer and shutdown hooks.
    ///
    /// **Errors**
    /// - [`SinkError::Config`] for a degenerate configuration.
    /// - [`SinkError::Bootstrap`] if the schema/table could not be created.
    ///   Bootstrap is not retried.
    ///
    /// Must be called from within a Tokio runtime; background deliveries run
    /// on that runtime.
    pub async fn new(sink: Arc<dyn LogSink>, config: BatchConfig) -> Result<Self, SinkError> {
        config.validate()?;

        let destination = sink.destination();
        sink.bootstrap()
            .await
            .map_err(|source| SinkError::Bootstrap {
                destination: destination.clone(),
                source,
            })?;

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (inflight, _) = watch::channel(0usize);
        let capacity = config.batch_size;

        let inner = Arc::new(Inner {
            sink,
            destination,
            pending: Mutex::new(Pending {
                records: Vec::with_capacity(capacity),
                closing: false,
            }),
            inflight,
            events,
            runtime: Handle::current(),
            lifecycle: Mutex::new(None),
            closed: OnceCell::new(),
            config,
        });

        let lifecycle = Lifecycle::start(
            &inner.runtime,
            Arc::downgrade(&inner),
            inner.config.flush_interval,
            inner.config.lifecycle_hooks,
            inner.config.exit_on_signal,
        );
        *lock(&inner.lifecycle) = Some(lifecycle);

        debug!(
            destination = %inner.destination,
            batch_size = inner.config.batch_size,
            flush_interval_ms = inner.config.flush_interval.as_millis() as u64,
            "log sink ready"
        );

        Ok(Self { inner })
    }

    /// Accept one record.
    ///
    /// Returns immediately. Records are discarded when the sink is silenced,
    /// closing, or the record's level is below the configured filter.
    pub fn log(&self, record: LogRecord) {
        self.inner.accept(record);
    }

    /// Accept an open bag of fields, see [`LogRecord::from_fields`].
    pub fn log_fields(&self, fields: BTreeMap<String, Value>) {
        self.inner.accept(LogRecord::from_fields(fields));
    }

    /// Deliver everything currently buffered, then wait for deliveries that
    /// were already in flight.
    pub async fn flush(&self) -> FlushOutcome {
        let batch = self.inner.take_pending();
        let outcome = if batch.is_empty() {
            FlushOutcome::Empty
        } else {
            self.inner.deliver(batch).await
        };
        self.inner.settle().await;
        outcome
    }

    /// Wait until no delivery is in flight.
    pub async fn settle(&self) {
        self.inner.settle().await;
    }

    /// Whether `target` belongs to the backend's own instrumentation, e.g.
    /// the driver's per-statement events.
    pub fn is_backend_target(&self, target: &str) -> bool {
        self.inner
            .sink
            .internal_targets()
            .iter()
            .any(|prefix| target_matches(prefix, target))
    }

    /// Number of records waiting in the buffer.
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.pending).records.len()
    }

    pub fn is_closing(&self) -> bool {
        lock(&self.inner.pending).closing
    }

    /// Subscribe to `logged`/`error` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Drain the buffer and release the backend.
    ///
    /// Runs once: later or concurrent calls wait for the first one to finish
    /// and never flush or release twice.
    pub async fn close(&self) {
        self.inner.close(ShutdownTrigger::Explicit).await;
    }

    /// Close on behalf of `trigger`. A [`ShutdownTrigger::Panic`] only
    /// drains and stops accepting records; the backend stays open until a
    /// terminal close.
    pub async fn close_with(&self, trigger: ShutdownTrigger) {
        self.inner.close(trigger).await;
    }

    /// Drain and close before the execution environment freezes the process.
    pub async fn prepare_suspend(&self) {
        self.inner.close(ShutdownTrigger::Suspend).await;
    }

    /// Start drain-and-close in the background, for callers that cannot
    /// await.
    pub fn trigger_shutdown(&self, trigger: ShutdownTrigger) -> JoinHandle<()> {
        self.inner.spawn_close(trigger)
    }
}

impl Inner {
    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn accept(self: &Arc<Self>, record: LogRecord) {
        if self.config.silent || !level_enabled(self.config.level, &record) {
            return;
        }

        let full = {
            let mut pending = lock(&self.pending);
            if pending.closing {
                return;
            }
            pending.records.push(record);
            if pending.records.len() >= self.config.batch_size {
                Some(std::mem::replace(
                    &mut pending.records,
                    Vec::with_capacity(self.config.batch_size),
                ))
            } else {
                None
            }
        };

        if let Some(batch) = full {
            self.spawn_delivery(batch);
        }
    }

    fn take_pending(&self) -> Vec<LogRecord> {
        std::mem::take(&mut lock(&self.pending).records)
    }

    /// Timer hook: hand a non-empty buffer to a background delivery.
    pub(crate) fn flush_pending_in_background(self: &Arc<Self>) {
        let batch = self.take_pending();
        if !batch.is_empty() {
            self.spawn_delivery(batch);
        }
    }

    fn spawn_delivery(self: &Arc<Self>, batch: Vec<LogRecord>) {
        self.inflight.send_modify(|count| *count += 1);
        let guard = InflightGuard(Arc::clone(self));
        self.runtime.spawn(async move {
            guard.0.deliver(batch).await;
            drop(guard);
        });
    }

    async fn settle(&self) {
        let mut inflight = self.inflight.subscribe();
        let _ = inflight.wait_for(|count| *count == 0).await;
    }

    async fn deliver(&self, batch: Vec<LogRecord>) -> FlushOutcome {
        let mut attempt = FlushAttempt::new(batch, self.config.max_retries);

        loop {
            match self.try_insert(attempt.batch()).await {
                Ok(()) => {
                    let delivered = attempt.len();
                    for record in attempt.into_batch() {
                        let _ = self.events.send(SinkEvent::Logged(record));
                    }
                    return FlushOutcome::Delivered(delivered);
                }
                Err(err) => {
                    warn!(
                        destination = %self.destination,
                        attempt = attempt.number(),
                        max_attempts = self.config.max_retries,
                        error = %err,
                        "failed to insert log batch"
                    );

                    if attempt.is_last() {
                        let dropped = attempt.len();
                        error!(
                            destination = %self.destination,
                            dropped,
                            attempts = attempt.number(),
                            "dropping log batch after exhausting retries"
                        );
                        let _ = self.events.send(SinkEvent::Error {
                            dropped,
                            attempts: attempt.number(),
                            error: err.to_string(),
                        });
                        return FlushOutcome::Dropped(dropped);
                    }

                    tokio::time::sleep(attempt.backoff(self.config.retry_delay)).await;
                    attempt.advance();
                }
            }
        }
    }

    async fn try_insert(&self, batch: &[LogRecord]) -> Result<(), BoxError> {
        match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, self.sink.insert_batch(batch))
                .await
                .map_err(|_| -> BoxError { format!("insert timed out after {limit:?}").into() })?,
            None => self.sink.insert_batch(batch).await,
        }
    }

    pub(crate) fn spawn_close(self: &Arc<Self>, trigger: ShutdownTrigger) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.close(trigger).await;
        })
    }

    async fn close(&self, trigger: ShutdownTrigger) {
        if trigger.releases_backend() {
            self.closed.get_or_init(|| self.shutdown(trigger)).await;
        } else {
            self.drain(trigger).await;
        }
    }

    async fn shutdown(&self, trigger: ShutdownTrigger) {
        info!(destination = %self.destination, %trigger, "closing log sink");

        let lifecycle = lock(&self.lifecycle).take();
        let registration = lifecycle.and_then(Lifecycle::stop);

        self.drain(trigger).await;
        self.sink.close().await;
        drop(registration);
    }

    /// Stop accepting records, deliver what is buffered and wait for
    /// deliveries in flight. Safe to run more than once.
    async fn drain(&self, trigger: ShutdownTrigger) {
        let remaining = {
            let mut pending = lock(&self.pending);
            pending.closing = true;
            std::mem::take(&mut pending.records)
        };

        if !remaining.is_empty() {
            let count = remaining.len();
            if let FlushOutcome::Dropped(_) = self.deliver(remaining).await {
                eprintln!(
                    "pg-log-sink: failed to flush {count} log records to {} on {trigger}",
                    self.destination
                );
            }
        }

        self.settle().await;
    }
}

struct InflightGuard(Arc<Inner>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.inflight.send_modify(|count| *count -= 1);
    }
}

fn level_enabled(filter: LevelFilter, record: &LogRecord) -> bool {
    match record.severity() {
        Some(level) => level <= filter,
        None => filter != LevelFilter::OFF,
    }
}

/// `prefix` matches itself and its `::` submodules.
pub(crate) fn target_matches(prefix: &str, target: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
