use crate::config::{quote_ident, TableSpec};
use crate::record::LogRecord;
use crate::sink::{BoxError, LogSink};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};

/// Postgres sink that writes each batch with one multi-row `INSERT`.
///
/// The pool is shared with the rest of the application; the sink only
/// closes it during its own terminal shutdown, and not at all when built
/// with [`keep_pool_open`](Self::keep_pool_open).
///
/// Table layout created by [`LogSink::bootstrap`]:
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS "public"."app_logs" (
///   id          INT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
///   "level"     VARCHAR(10) NOT NULL,
///   "timestamp" TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
///   "message"   TEXT,
///   "metadata"  JSONB
/// );
/// ```
#[derive(Clone)]
pub struct PostgresSink {
    pool: PgPool,
    table: TableSpec,
    close_pool: bool,
}

impl PostgresSink {
    /// Create a sink writing into `table` through `pool`.
    ///
    /// Fails fast if the table descriptor is incomplete.
    pub fn new(pool: PgPool, table: TableSpec) -> Result<Self, crate::error::ConfigError> {
        table.validate()?;
        Ok(Self {
            pool,
            table,
            close_pool: true,
        })
    }

    /// Leave the shared pool open when the sink closes.
    pub fn keep_pool_open(mut self) -> Self {
        self.close_pool = false;
        self
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    fn create_schema_sql(&self) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.table.schema))
    }

    fn create_table_sql(&self) -> String {
        let columns = &self.table.columns;
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id INT GENERATED ALWAYS AS IDENTITY PRIMARY KEY, \
             {} VARCHAR(10) NOT NULL, \
             {} TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             {} TEXT, \
             {} JSONB)",
            self.table.qualified_name(),
            quote_ident(&columns.level),
            quote_ident(&columns.timestamp),
            quote_ident(&columns.message),
            quote_ident(&columns.metadata),
        )
    }

    /// Build the multi-row insert: four positional parameters per record,
    /// in batch order.
    fn insert_query<'a>(&self, batch: &'a [LogRecord]) -> QueryBuilder<'a, Postgres> {
        let columns = &self.table.columns;
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} ({}, {}, {}, {}) ",
            self.table.qualified_name(),
            quote_ident(&columns.level),
            quote_ident(&columns.timestamp),
            quote_ident(&columns.message),
            quote_ident(&columns.metadata),
        ));
        builder.push_values(batch, |mut row, record| {
            row.push_bind(&record.level)
                .push_bind(record.timestamp)
                .push_bind(&record.message)
                .push_bind(record.metadata.as_ref().map(Json));
        });
        builder
    }
}

#[async_trait]
impl LogSink for PostgresSink {
    fn destination(&self) -> String {
        self.table.qualified_name()
    }

    fn internal_targets(&self) -> &'static [&'static str] {
        &["sqlx"]
    }

    async fn bootstrap(&self) -> Result<(), BoxError> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT schema_name::text FROM information_schema.schemata WHERE schema_name = $1",
        )
        .bind(&self.table.schema)
        .fetch_optional(&self.pool)
        .await?;

        if existing.is_none() {
            sqlx::query(&self.create_schema_sql())
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(&self.create_table_sql())
            .execute(&self.pool)
            .await?;

        tracing::debug!(table = %self.table.qualified_name(), "log table ready");
        Ok(())
    }

    async fn insert_batch(&self, batch: &[LogRecord]) -> Result<(), BoxError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.insert_query(batch).build().execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.close_pool {
            self.pool.close().await;
        }
    }
}
