//! High-level runner API for the B3 trade loader.
//!
//! This module hides pool construction, schema setup and the coordinator
//! behind three entry points: `run_ingest`, `serve` and `download`.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::{Context, Result};
use chrono::Local;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{DOWNLOAD_BASE_URL, TRADE_TABLE};
use crate::coordination::{Coordinator, IngestConfigBuilder};
use crate::db::pool::PoolArgsBuilder;
use crate::db::schema::ensure_trade_table;
use crate::db::{self as db_pool, Pool, QuoteStatsSource};
use crate::download::{download_days, last_workdays};
use crate::formats::FieldCoercion;

pub use crate::config::{DEFAULT_CONCURRENCY, DEFAULT_HTTP_PORT, DOWNLOAD_WORKDAYS};
pub use crate::download::DownloadSummary;
pub use crate::error::{FileError, IngestError};

/// Postgres connection settings
#[derive(Debug, Clone)]
pub struct ConnectionArgs {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl: bool,
}

/// Arguments for one ingestion run
#[derive(Debug, Clone)]
pub struct IngestArgs {
    pub connection: ConnectionArgs,
    pub source_dir: PathBuf,
    /// Files processed at once; the pool gets one extra connection for the merge
    pub concurrency: usize,
    /// Reject rows with malformed numeric or date fields instead of storing zeroes
    pub strict_fields: bool,
    pub quiet: bool,

    // Test-only: inject a pre-created pool (for SQLite testing)
    #[cfg(test)]
    pub test_pool: Option<Pool>,
}

/// Arguments for the quote endpoint
#[derive(Debug, Clone)]
pub struct ServeArgs {
    pub connection: ConnectionArgs,
    pub port: u16,
}

/// Arguments for fetching recent trade files
#[derive(Debug, Clone)]
pub struct DownloadArgs {
    pub dest_dir: PathBuf,
    pub workdays: usize,
}

/// Summary of a successful ingestion run
#[derive(Debug)]
pub struct IngestResult {
    pub run_id: String,
    pub files_discovered: usize,
    pub files_loaded: usize,
    pub rows_staged: u64,
    pub rows_merged: u64,
    /// Highest number of files staged at the same time
    pub peak_in_flight: usize,
    pub duration: Duration,
}

async fn connect(connection: &ConnectionArgs, max_pool_size: u32) -> Result<Pool> {
    let pool_args = PoolArgsBuilder::default()
        .host(&connection.host)
        .port(connection.port)
        .database(&connection.database)
        .username(&connection.username)
        .password(&connection.password)
        .ssl(connection.ssl)
        .max_pool_size(max_pool_size)
        .build()?;
    db_pool::pool::pool(pool_args).await
}

/// Ingest every file in `args.source_dir` into the trade table.
///
/// Fails with the run error (unreadable directory, staging or merge failure)
/// or, when the merge succeeded but some file did not load, with the first
/// file error.
///
/// # Example
///
/// ```no_run
/// use b3_trade_loader::runner::{ConnectionArgs, IngestArgs, run_ingest};
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = IngestArgs {
///     connection: ConnectionArgs {
///         host: "localhost".to_string(),
///         port: 5432,
///         database: "b3".to_string(),
///         username: "postgres".to_string(),
///         password: "postgres".to_string(),
///         ssl: false,
///     },
///     source_dir: "./data".into(),
///     concurrency: 6,
///     strict_fields: false,
///     quiet: true,
/// };
///
/// let result = run_ingest(args).await?;
/// println!("Merged {} rows in {:?}", result.rows_merged, result.duration);
/// # Ok(())
/// # }
/// ```
pub async fn run_ingest(args: IngestArgs) -> Result<IngestResult> {
    let config = IngestConfigBuilder::default()
        .source_dir(args.source_dir)
        .concurrency(args.concurrency)
        .coercion(if args.strict_fields {
            FieldCoercion::Strict
        } else {
            FieldCoercion::Lenient
        })
        .quiet(args.quiet)
        .build()?;

    let max_pool_size = u32::try_from(config.concurrency + 1).context("Concurrency is too large")?;

    // Create connection pool (or use test pool if provided)
    #[cfg(test)]
    let pool = if let Some(test_pool) = args.test_pool {
        test_pool
    } else {
        connect(&args.connection, max_pool_size).await?
    };

    #[cfg(not(test))]
    let pool = connect(&args.connection, max_pool_size).await?;

    ensure_trade_table(&pool, &config.target_table)
        .await
        .with_context(|| format!("Failed to create table {}", config.target_table))?;

    let coordinator = Coordinator::new(pool);
    let report = coordinator.run(&config).await?.into_result()?;

    Ok(IngestResult {
        run_id: report.run_id,
        files_discovered: report.files_discovered,
        files_loaded: report.files_loaded,
        rows_staged: report.rows_staged,
        rows_merged: report.rows_merged,
        peak_in_flight: report.peak_in_flight,
        duration: report.duration,
    })
}

/// Serve quote statistics over HTTP until Ctrl-C
pub async fn serve(args: ServeArgs) -> Result<()> {
    let pool = connect(&args.connection, 4).await?;
    ensure_trade_table(&pool, TRADE_TABLE)
        .await
        .with_context(|| format!("Failed to create table {}", TRADE_TABLE))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let source: Arc<dyn QuoteStatsSource> = Arc::new(pool);
    crate::http::serve(listener, source, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Fetch the archives of the last `args.workdays` weekdays into `args.dest_dir`
pub async fn download(args: DownloadArgs) -> Result<DownloadSummary> {
    let dates = last_workdays(Local::now().date_naive(), args.workdays);
    info!(
        "Fetching {} days of trade files into {}",
        dates.len(),
        args.dest_dir.display()
    );
    download_days(DOWNLOAD_BASE_URL, &dates, &args.dest_dir).await
}
