#![allow(dead_code)]

use async_trait::async_trait;
use pg_log_sink::record::LogRecord;
use pg_log_sink::sink::{BoxError, LogSink};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// In-memory backend with scriptable failures, used to observe what the
/// batcher sends and when.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
pub struct State {
    pub table_exists: bool,
    pub bootstraps: u32,
    pub rows: Vec<LogRecord>,
    pub batches: Vec<usize>,
    pub attempts: Vec<Instant>,
    pub ops: Vec<&'static str>,
    pub closes: u32,

    fail_first: u32,
    always_fail: bool,
    fail_bootstrap: bool,
    insert_delay: Option<Duration>,
    hang_first: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn scripted(script: impl FnOnce(&mut State)) -> Arc<Self> {
        let store = Self::default();
        script(&mut store.state.lock().unwrap());
        Arc::new(store)
    }

    pub fn failing_first(attempts: u32) -> Arc<Self> {
        Self::scripted(|s| s.fail_first = attempts)
    }

    pub fn always_failing() -> Arc<Self> {
        Self::scripted(|s| s.always_fail = true)
    }

    pub fn failing_bootstrap() -> Arc<Self> {
        Self::scripted(|s| s.fail_bootstrap = true)
    }

    pub fn with_insert_delay(delay: Duration) -> Arc<Self> {
        Self::scripted(|s| s.insert_delay = Some(delay))
    }

    /// First attempt takes `delay` before succeeding; later attempts are
    /// immediate.
    pub fn hanging_first(delay: Duration) -> Arc<Self> {
        Self::scripted(|s| s.hang_first = Some(delay))
    }

    pub fn with_rows(rows: Vec<LogRecord>) -> Arc<Self> {
        Self::scripted(|s| {
            s.table_exists = true;
            s.rows = rows;
        })
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn messages(&self) -> Vec<String> {
        self.state()
            .rows
            .iter()
            .map(|r| r.message.clone().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl LogSink for MemoryStore {
    fn destination(&self) -> String {
        "memory".to_string()
    }

    // Stands in for a database driver that traces its own statements.
    fn internal_targets(&self) -> &'static [&'static str] {
        &["sqlx"]
    }

    async fn bootstrap(&self) -> Result<(), BoxError> {
        let mut state = self.state();
        state.bootstraps += 1;
        if state.fail_bootstrap {
            return Err("permission denied for schema".into());
        }
        state.table_exists = true;
        Ok(())
    }

    async fn insert_batch(&self, batch: &[LogRecord]) -> Result<(), BoxError> {
        let (delay, fail) = {
            let mut state = self.state();
            state.attempts.push(Instant::now());
            let attempt = state.attempts.len() as u32;
            let delay = match (attempt, state.hang_first) {
                (1, Some(hang)) => Some(hang),
                _ => state.insert_delay,
            };
            (delay, state.always_fail || attempt <= state.fail_first)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err("connection refused".into());
        }

        let mut state = self.state();
        state.rows.extend(batch.iter().cloned());
        state.batches.push(batch.len());
        state.ops.push("insert");
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state();
        state.closes += 1;
        state.ops.push("close");
    }
}
