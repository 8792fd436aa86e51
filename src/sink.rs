use crate::record::LogRecord;
use async_trait::async_trait;
use std::error::Error;

/// Error type returned by backends. Delivery failures are retried by the
/// batcher, so they only need to carry a readable cause.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Durable destination for batches of [`LogRecord`]s.
///
/// The [`BatchedSink`](crate::batcher::BatchedSink) owns buffering, timing
/// and retries; an implementation only has to move one batch into its store
/// per call.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Human-readable identifier of the destination, used in diagnostics.
    fn destination(&self) -> String;

    /// Idempotently prepare the destination (create schema/table if absent).
    ///
    /// Called once before the first batch is delivered. An error here is
    /// fatal for the batcher and is not retried.
    ///
    /// Default implementation is a no-op.
    async fn bootstrap(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Deliver one batch, preserving its order.
    ///
    /// **Returns**
    /// - `Ok(())` once every record of the batch is durably stored.
    /// - `Err(..)` if the store rejected the batch. The batcher treats this
    ///   as transient and retries the whole batch with backoff.
    ///
    /// Never called with an empty batch.
    async fn insert_batch(&self, batch: &[LogRecord]) -> Result<(), BoxError>;

    /// `tracing` targets emitted while talking to the store, e.g. the
    /// driver's per-statement events. [`BatchLayer`](crate::layer::BatchLayer)
    /// skips them (and their `::` submodules); forwarding them would turn
    /// every insert into another record.
    fn internal_targets(&self) -> &'static [&'static str] {
        &[]
    }

    /// Release resources held by the backend. Called exactly once, after the
    /// final drain of a terminal close; never after a panic-triggered drain.
    async fn close(&self) {}
}
