//! Configuration constants for the trade loader
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application. Process-level settings (paths, credentials, concurrency) are
//! resolved once by the CLI and passed down explicitly; nothing here is mutable.

use std::time::Duration;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum lifetime of a pooled connection before bb8 recycles it
pub const CONNECTION_MAX_LIFETIME: Duration = Duration::from_secs(60 * 55);

// ============================================================================
// Ingestion Configuration
// ============================================================================

/// Number of files processed in parallel when nothing else is configured
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Name of the durable trade table
pub const TRADE_TABLE: &str = "trades";

/// Name of the per-run staging table
pub const STAGING_TABLE: &str = "trades_staging";

/// Rows handed from the parser thread to the loader in one message
///
/// Set to 4096 rows (roughly 250 KB of COPY text for B3 files). Large enough
/// that channel overhead is negligible, small enough that a file never sits
/// in memory as a whole.
pub const STAGING_BATCH_ROWS: usize = 4096;

/// Rows per multi-row INSERT on the SQLite backend
///
/// Six bound parameters per row keeps this well under SQLite's variable limit.
#[cfg(test)]
pub const SQLITE_INSERT_ROWS: usize = 500;

/// Depth of the bounded channel between parser and loader
///
/// Bounds per-file memory to `STAGING_CHANNEL_DEPTH * STAGING_BATCH_ROWS` rows
/// while the COPY stream is busy.
pub const STAGING_CHANNEL_DEPTH: usize = 4;

// ============================================================================
// I/O Configuration
// ============================================================================

/// Buffer size for reading trade files
///
/// Set to 1 MB. B3 daily files run to several hundred megabytes, so a large
/// buffer keeps the number of read syscalls low.
pub const READ_BUFFER_SIZE: usize = 1 << 20; // 1 MB

// ============================================================================
// Quote Endpoint Configuration
// ============================================================================

pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Window used by the quote endpoint when no start date is given
pub const DEFAULT_LOOKBACK_DAYS: i64 = 7;

// ============================================================================
// Download Configuration
// ============================================================================

pub const DOWNLOAD_BASE_URL: &str = "https://arquivos.b3.com.br/rapinegocios/tickercsv/";

/// Number of past workdays fetched by the downloader
pub const DOWNLOAD_WORKDAYS: usize = 7;

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
