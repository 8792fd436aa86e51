use crate::sink::BoxError;

/// Invalid or missing configuration. Always fatal, never retried.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("a destination table name is required")]
    MissingTable,

    #[error("{kind} name must not be empty")]
    EmptyIdentifier { kind: &'static str },

    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("max retries must be at least 1")]
    ZeroRetries,

    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,

    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
}

/// Error returned while constructing a [`BatchedSink`](crate::batcher::BatchedSink).
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create schema/table {destination}: {source}")]
    Bootstrap {
        destination: String,
        #[source]
        source: BoxError,
    },
}

/// Error returned by the `init` helpers.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[cfg(feature = "postgres")]
    #[error("failed to connect to postgres: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("global tracing subscriber already set: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}
