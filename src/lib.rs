pub mod record;
pub mod sink;
pub mod config;
pub mod env;
pub mod error;
pub mod batcher;
pub mod lifecycle;
pub mod layer;

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod init;
pub mod noop_sink;

pub use batcher::{BatchedSink, FlushOutcome, SinkEvent};
pub use config::{BatchConfig, ColumnNames, TableSpec};
pub use lifecycle::ShutdownTrigger;
pub use record::LogRecord;
pub use sink::LogSink;
