use crate::record::LogRecord;
use crate::sink::{BoxError, LogSink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// A sink that acknowledges every batch and discards it.
///
/// Useful for measuring the overhead of buffering and batching without any
/// database I/O, and for tests that don't care about persistence.
#[derive(Default)]
pub struct NoopSink {
    records: AtomicU64,
    batches: AtomicU64,
}

impl NoopSink {
    /// Records acknowledged so far.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Batches acknowledged so far.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LogSink for NoopSink {
    fn destination(&self) -> String {
        "noop".to_string()
    }

    async fn insert_batch(&self, batch: &[LogRecord]) -> Result<(), BoxError> {
        self.records.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
