use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use pg_log_sink::batcher::BatchedSink;
use pg_log_sink::config::BatchConfig;
use pg_log_sink::init::{init_tracing_with_config, LayerConfig};
use pg_log_sink::noop_sink::NoopSink;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(NoopSink::default());

    let config = BatchConfig::default()
        .with_batch_size(1_000)
        .without_lifecycle_hooks();
    let sink = BatchedSink::new(backend.clone(), config).await?;
    let guard = init_tracing_with_config(sink, LayerConfig { enable_stdout: false })?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "noop load test error");
    }

    let elapsed = start.elapsed();
    println!("noop sink: accepted {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    guard.shutdown().await;
    println!(
        "delivered {} records in {} batches",
        backend.records(),
        backend.batches()
    );
    Ok(())
}
