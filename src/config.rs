use crate::error::ConfigError;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Default number of buffered records that triggers an immediate flush.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default maximum time a record waits in the buffer.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5000);

/// Default number of insert attempts per batch.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff unit; attempt `n` waits `n` units before attempt `n + 1`.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Default capacity of the `logged`/`error` event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

pub const DEFAULT_SCHEMA: &str = "public";

/// Column names of the destination table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnNames {
    pub level: String,
    pub timestamp: String,
    pub message: String,
    pub metadata: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            level: "level".to_string(),
            timestamp: "timestamp".to_string(),
            message: "message".to_string(),
            metadata: "metadata".to_string(),
        }
    }
}

/// Destination table descriptor: schema, table and column names.
///
/// The store is shared infrastructure, so every name is configurable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub schema: String,
    pub table: String,
    pub columns: ColumnNames,
}

impl TableSpec {
    /// Target `table` in the default `public` schema.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.into(),
            columns: ColumnNames::default(),
        }
    }

    /// Parse `"table"` or `"schema.table"`.
    pub fn parse(destination: &str) -> Result<Self, ConfigError> {
        let table = match destination.split_once('.') {
            Some((schema, table)) => Self::new(table.trim()).with_schema(schema.trim()),
            None => Self::new(destination.trim()),
        };
        table.validate()?;
        Ok(table)
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_columns(mut self, columns: ColumnNames) -> Self {
        self.columns = columns;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table.is_empty() {
            return Err(ConfigError::MissingTable);
        }
        let names = [
            ("schema", &self.schema),
            ("level column", &self.columns.level),
            ("timestamp column", &self.columns.timestamp),
            ("message column", &self.columns.message),
            ("metadata column", &self.columns.metadata),
        ];
        for (kind, name) in names {
            if name.is_empty() {
                return Err(ConfigError::EmptyIdentifier { kind });
            }
        }
        Ok(())
    }

    /// Fully qualified, quoted identifier, e.g. `"system"."app_logs"`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

/// Quote an SQL identifier, doubling any embedded double quote.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Buffering, retry and lifecycle settings of a
/// [`BatchedSink`](crate::batcher::BatchedSink).
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Buffered record count that triggers an immediate flush.
    pub batch_size: usize,
    /// Maximum time a record waits before a flush is attempted.
    pub flush_interval: Duration,
    /// Insert attempts per batch before the batch is dropped.
    pub max_retries: u32,
    /// Backoff unit; the wait after attempt `n` is `retry_delay * n`.
    pub retry_delay: Duration,
    /// Optional upper bound on a single insert attempt.
    pub attempt_timeout: Option<Duration>,
    /// Minimum severity accepted. Records with an unknown level tag pass.
    pub level: LevelFilter,
    /// Accept and discard everything.
    pub silent: bool,
    /// Register signal and panic hooks that drain and close the sink.
    pub lifecycle_hooks: bool,
    /// Exit the process after a signal-triggered drain.
    pub exit_on_signal: bool,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            attempt_timeout: None,
            level: LevelFilter::TRACE,
            silent: false,
            lifecycle_hooks: true,
            exit_on_signal: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl BatchConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Disable signal and panic hooks, e.g. when the host manages shutdown.
    pub fn without_lifecycle_hooks(mut self) -> Self {
        self.lifecycle_hooks = false;
        self
    }

    pub fn with_exit_on_signal(mut self, exit: bool) -> Self {
        self.exit_on_signal = exit;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        Ok(())
    }
}
