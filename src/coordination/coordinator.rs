use derive_builder::Builder;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::{ErrorAggregator, run_bounded};
use super::worker::FileWorker;
use crate::config::{DEFAULT_CONCURRENCY, STAGING_TABLE, TRADE_TABLE};
use crate::db::schema::{
    create_staging_table, drop_table_sql, lookup_index_sql, merge_sql, unique_constraint_sql,
};
use crate::db::{Pool, StagingLoader};
use crate::error::{FileError, IngestError};
use crate::formats::FieldCoercion;
use crate::io::list_source_files;
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Configuration for one ingestion run
#[derive(Debug, Clone, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct IngestConfig {
    /// Directory whose regular files are ingested
    #[builder(setter(into))]
    pub source_dir: PathBuf,
    /// Maximum number of files processed at once
    #[builder(default = "DEFAULT_CONCURRENCY")]
    pub concurrency: usize,
    #[builder(setter(into), default = "STAGING_TABLE.to_string()")]
    pub staging_table: String,
    #[builder(setter(into), default = "TRADE_TABLE.to_string()")]
    pub target_table: String,
    #[builder(default)]
    pub coercion: FieldCoercion,
    #[builder(default)]
    pub quiet: bool,
}

impl IngestConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.concurrency == Some(0) {
            return Err("concurrency must be at least 1".to_string());
        }
        let staging = self.staging_table.as_deref().unwrap_or(STAGING_TABLE);
        let target = self.target_table.as_deref().unwrap_or(TRADE_TABLE);
        if staging == target {
            return Err(format!(
                "staging table and target table must differ (both are '{}')",
                staging
            ));
        }
        Ok(())
    }
}

/// Phases of an ingestion run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    /// Staging table created
    Preparing,
    /// Bounded fan-out over the discovered files
    Processing,
    /// Constraint, merge, index and drop
    Finalizing,
    Done,
}

/// Outcome of a run whose finalize step succeeded
#[derive(Debug)]
pub struct IngestReport {
    pub run_id: String,
    pub files_discovered: usize,
    pub files_loaded: usize,
    pub files_failed: usize,
    pub rows_staged: u64,
    /// Rows newly inserted into the durable table; duplicates are not counted
    pub rows_merged: u64,
    /// Highest number of files that were processed at the same time
    pub peak_in_flight: usize,
    pub duration: Duration,
    /// First per-file failure by completion order
    pub first_error: Option<FileError>,
}

impl IngestReport {
    /// Turn the report into an error if any file failed
    pub fn into_result(mut self) -> Result<Self, IngestError> {
        match self.first_error.take() {
            Some(e) => Err(IngestError::File(e)),
            None => Ok(self),
        }
    }
}

/// The Coordinator drives one ingestion run from discovery to merge.
pub struct Coordinator {
    pool: Pool,
}

impl Coordinator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Run the complete ingestion
    ///
    /// 1. Discover files (a listing failure aborts before anything is created)
    /// 2. Create the staging table
    /// 3. Stage every file with at most `concurrency` in flight
    /// 4. Finalize: constraint, merge, index, drop staging
    ///
    /// Per-file failures end up in the report; only discovery, staging
    /// creation and finalize failures are returned as errors.
    pub async fn run(&self, config: &IngestConfig) -> Result<IngestReport, IngestError> {
        let start_time = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let mut phase = RunPhase::Idle;
        info!(
            "Starting ingestion run {} from {}",
            run_id,
            config.source_dir.display()
        );

        let files =
            list_source_files(&config.source_dir).map_err(|source| IngestError::Directory {
                path: config.source_dir.clone(),
                source,
            })?;
        let files_discovered = files.len();
        info!("Discovered {} files", files_discovered);

        advance(&mut phase, RunPhase::Preparing);
        create_staging_table(&self.pool, &config.staging_table)
            .await
            .map_err(IngestError::Staging)?;

        advance(&mut phase, RunPhase::Processing);
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let progress = Self::setup_progress_tracking(config, files_discovered, telemetry_rx);

        let worker = FileWorker::new(
            StagingLoader::new(self.pool.clone(), config.staging_table.clone()),
            config.coercion,
            telemetry_tx,
        );
        let mut errors = ErrorAggregator::new();
        let mut files_loaded = 0;
        let mut rows_staged = 0u64;
        run_bounded(
            files,
            config.concurrency,
            |path| worker.clone().process(path),
            |result| match result {
                Ok(rows) => {
                    files_loaded += 1;
                    rows_staged += rows;
                }
                Err(e) => errors.record(e),
            },
        )
        .await;

        // Drop the last sender so the progress task sees the channel close
        drop(worker);

        let stats = progress.await.unwrap_or_default();
        info!(
            "Staged {} rows from {} files ({} failed) in {:.2}s",
            rows_staged,
            files_loaded,
            errors.count(),
            start_time.elapsed().as_secs_f64()
        );

        advance(&mut phase, RunPhase::Finalizing);
        let rows_merged = match self.finalize(config).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(
                    "Finalize failed, staging table '{}' was left in place: {}",
                    config.staging_table, e
                );
                return Err(e);
            }
        };
        advance(&mut phase, RunPhase::Done);

        let report = IngestReport {
            run_id,
            files_discovered,
            files_loaded,
            files_failed: errors.count(),
            rows_staged,
            rows_merged,
            peak_in_flight: stats.peak_in_flight,
            duration: start_time.elapsed(),
            first_error: errors.into_first(),
        };
        info!(
            "Ingestion run {} complete: {} of {} files loaded ({} failed, at most {} at once), \
             {} rows staged, {} rows merged in {:.2}s",
            report.run_id,
            report.files_loaded,
            report.files_discovered,
            report.files_failed,
            report.peak_in_flight,
            report.rows_staged,
            report.rows_merged,
            report.duration.as_secs_f64()
        );

        Ok(report)
    }

    /// Move staged rows into the durable table and discard the staging table.
    /// Returns the number of rows newly merged.
    async fn finalize(&self, config: &IngestConfig) -> Result<u64, IngestError> {
        let is_postgres = self.pool.is_postgres();
        let target = &config.target_table;
        let staging = &config.staging_table;

        self.finalize_step("unique constraint", &unique_constraint_sql(is_postgres, target))
            .await?;
        let merged = self
            .finalize_step("merge", &merge_sql(is_postgres, staging, target))
            .await?;
        self.finalize_step("lookup index", &lookup_index_sql(target))
            .await?;

        // Rows are already merged at this point; a leftover staging table is
        // reused by the next run.
        if let Err(e) = self.pool.execute_query(&drop_table_sql(staging)).await {
            warn!("Could not drop staging table '{}': {}", staging, e);
        }

        Ok(merged)
    }

    async fn finalize_step(&self, step: &'static str, sql: &str) -> Result<u64, IngestError> {
        let start = Instant::now();
        let affected = self
            .pool
            .execute_query(sql)
            .await
            .map_err(|source| IngestError::Finalize { step, source })?;
        debug!(
            "Finalize step '{}' took {:.2}s",
            step,
            start.elapsed().as_secs_f64()
        );
        Ok(affected)
    }

    /// Aggregate telemetry for the run and, unless quiet, render a progress bar
    fn setup_progress_tracking(
        config: &IngestConfig,
        total_files: usize,
        mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    ) -> tokio::task::JoinHandle<ProgressStats> {
        let file_bar = (!config.quiet).then(|| {
            let bar = ProgressBar::new(total_files as u64);
            let style = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] Files: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .map(|s| s.progress_chars("=>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar
        });

        tokio::spawn(async move {
            let mut stats = ProgressStats::new();

            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);

                if let Some(ref bar) = file_bar {
                    bar.set_position(stats.files_done() as u64);
                    bar.set_message(format!(
                        "| {} rows staged, {} failed",
                        stats.rows_staged, stats.files_failed
                    ));
                }
            }

            if let Some(bar) = file_bar {
                bar.finish();
            }
            stats
        })
    }
}

fn advance(phase: &mut RunPhase, next: RunPhase) {
    debug!("Run phase {:?} -> {:?}", phase, next);
    *phase = next;
}
