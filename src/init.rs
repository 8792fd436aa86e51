use crate::batcher::BatchedSink;
use crate::error::InitError;
use crate::layer::BatchLayer;
use crate::lifecycle::ShutdownTrigger;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Configuration of the global subscriber installed by [`init_tracing`].
///
/// **Fields**
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is
///   stacked on top of the [`BatchLayer`] so events also go to the console.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self { enable_stdout: true }
    }
}

/// Keeps the sink alive for the lifetime of the program and drains it at
/// normal exit.
///
/// Prefer awaiting [`SinkGuard::shutdown`] at the end of `main`. Dropping
/// the guard inside a multi-threaded runtime blocks until the drain
/// finishes; on a current-thread runtime the drain is only scheduled.
#[must_use = "dropping the guard closes the log sink"]
pub struct SinkGuard {
    sink: Option<BatchedSink>,
}

impl SinkGuard {
    pub fn new(sink: BatchedSink) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn sink(&self) -> Option<&BatchedSink> {
        self.sink.as_ref()
    }

    /// Drain the buffer and release the backend.
    pub async fn shutdown(mut self) {
        if let Some(sink) = self.sink.take() {
            sink.close_with(ShutdownTrigger::Exit).await;
        }
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| {
                    handle.block_on(sink.close_with(ShutdownTrigger::Exit))
                });
            }
            Ok(_) => {
                drop(sink.trigger_shutdown(ShutdownTrigger::Exit));
            }
            Err(_) => {
                let pending = sink.pending_len();
                if pending > 0 {
                    eprintln!(
                        "pg-log-sink: guard dropped outside a tokio runtime, {pending} log records were not flushed"
                    );
                }
            }
        }
    }
}

/// Install a global `tracing` subscriber that forwards every event to
/// `sink`.
///
/// **Effects**
///
/// This installs a [`Registry`] combined with [`BatchLayer`] as the global
/// default subscriber, so all `tracing` events in the process are observed
/// by the layer.
///
/// **Errors**
/// - [`InitError::Subscriber`] if a global subscriber is already set.
pub fn init_tracing_with_config(
    sink: BatchedSink,
    config: LayerConfig,
) -> Result<SinkGuard, InitError> {
    let layer = BatchLayer::new(sink.clone());

    // The two stacks have different types, so each branch installs its own.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(SinkGuard::new(sink))
}

/// Initialize tracing with sensible defaults.
///
/// Equivalent to calling [`init_tracing_with_config`] with
/// [`LayerConfig::default`].
pub fn init_tracing(sink: BatchedSink) -> Result<SinkGuard, InitError> {
    init_tracing_with_config(sink, LayerConfig::default())
}

/// Connect to `DATABASE_URL`, build a Postgres-backed [`BatchedSink`] from
/// the `LOG_SINK_*` variables, and install it as the global subscriber.
///
/// See [`crate::env`] for the recognized variables.
#[cfg(feature = "postgres")]
pub async fn init_postgres_from_env() -> Result<SinkGuard, InitError> {
    use crate::config::{BatchConfig, TableSpec};
    use crate::env::DATABASE_URL_ENV;
    use crate::error::ConfigError;
    use crate::postgres::PostgresSink;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    let url =
        std::env::var(DATABASE_URL_ENV).map_err(|_| ConfigError::MissingEnv(DATABASE_URL_ENV))?;
    let table = TableSpec::from_env()?;
    let config = BatchConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    let sink = PostgresSink::new(pool, table)?;
    let batched = BatchedSink::new(Arc::new(sink), config).await?;
    init_tracing(batched)
}
