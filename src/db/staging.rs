//! Bulk appends of parsed trades into the shared staging table.
//!
//! Parsing runs on a blocking thread and hands batches to the loader over a
//! bounded channel, so a file is never held in memory as a whole. On Postgres
//! each file becomes exactly one `COPY ... FROM STDIN` stream; the test-only
//! SQLite backend falls back to multi-row INSERTs.

use sqlx::postgres::PgConnection;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

use super::pool::{Pool, PoolConnection};
use super::schema::column_list;
use crate::config::{STAGING_BATCH_ROWS, STAGING_CHANNEL_DEPTH};
use crate::error::FileError;
use crate::formats::TradeRecord;
use crate::formats::reader::TRADE_DATE_FORMAT;

type BatchMessage = Result<Vec<TradeRecord>, FileError>;

/// Appends trade rows into the staging table, one bulk operation per file
#[derive(Debug, Clone)]
pub struct StagingLoader {
    pool: Pool,
    table: String,
}

impl StagingLoader {
    pub fn new(pool: Pool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Stream `rows` into the staging table and return how many were appended.
    ///
    /// The first error from `rows` fails the whole file. On Postgres the COPY
    /// is aborted, so nothing from the file is kept; on other backends rows
    /// flushed before the error may remain.
    pub async fn append<I>(&self, path: &Path, rows: I) -> Result<u64, FileError>
    where
        I: Iterator<Item = Result<TradeRecord, FileError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<BatchMessage>(STAGING_CHANNEL_DEPTH);
        let producer = tokio::task::spawn_blocking(move || produce_batches(rows, tx));

        let loaded = match self.pool.acquire().await {
            Ok(PoolConnection::Postgres(mut conn)) => {
                copy_into(&mut conn, &self.table, path, rx).await
            }
            #[cfg(test)]
            Ok(PoolConnection::Sqlite(mut conn)) => {
                insert_batches(&mut conn, &self.table, path, rx).await
            }
            Err(e) => {
                drop(rx);
                Err(load_error(path, "cannot acquire connection", e))
            }
        };

        // The receiver is gone by now, so a still-running producer stops at its next send
        if let Err(e) = producer.await {
            return Err(FileError::Panicked {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }

        loaded
    }
}

/// Drain the row iterator into fixed-size batches until it ends, fails, or the
/// loader hangs up.
fn produce_batches<I>(rows: I, tx: mpsc::Sender<BatchMessage>)
where
    I: Iterator<Item = Result<TradeRecord, FileError>>,
{
    let mut batch = Vec::with_capacity(STAGING_BATCH_ROWS);

    for row in rows {
        match row {
            Ok(trade) => {
                batch.push(trade);
                if batch.len() >= STAGING_BATCH_ROWS {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(STAGING_BATCH_ROWS));
                    if tx.blocking_send(Ok(full)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }

    if !batch.is_empty() {
        let _ = tx.blocking_send(Ok(batch));
    }
}

async fn copy_into(
    conn: &mut PgConnection,
    table: &str,
    path: &Path,
    mut rx: mpsc::Receiver<BatchMessage>,
) -> Result<u64, FileError> {
    let statement = format!("COPY \"{}\" ({}) FROM STDIN", table, column_list());
    let mut copy = conn
        .copy_in_raw(&statement)
        .await
        .map_err(|e| load_error(path, "cannot start COPY", e))?;

    while let Some(message) = rx.recv().await {
        match message {
            Ok(batch) => {
                let mut buf = String::with_capacity(batch.len() * 64);
                for trade in &batch {
                    encode_copy_row(trade, &mut buf);
                }
                let sent = copy.send(buf.into_bytes()).await.map(|_| ());
                if let Err(e) = sent {
                    let _ = copy.abort("loader stream failed").await;
                    return Err(load_error(path, "COPY stream interrupted", e));
                }
            }
            Err(e) => {
                let _ = copy.abort(e.to_string()).await;
                return Err(e);
            }
        }
    }

    let rows = copy
        .finish()
        .await
        .map_err(|e| load_error(path, "COPY rejected", e))?;
    debug!("Copied {} rows from {}", rows, path.display());
    Ok(rows)
}

#[cfg(test)]
async fn insert_batches(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
    path: &Path,
    mut rx: mpsc::Receiver<BatchMessage>,
) -> Result<u64, FileError> {
    use crate::config::SQLITE_INSERT_ROWS;

    let mut total = 0u64;
    while let Some(message) = rx.recv().await {
        let batch = message?;
        for chunk in batch.chunks(SQLITE_INSERT_ROWS) {
            let values = vec!["(?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES {}",
                table,
                column_list(),
                values
            );

            let mut query = sqlx::query(&sql);
            for trade in chunk {
                query = query
                    .bind(trade.trade_date)
                    .bind(trade.instrument_code.as_str())
                    .bind(trade.price)
                    .bind(trade.quantity)
                    .bind(trade.closing_time_code)
                    .bind(trade.negotiation_id.as_str());
            }
            query
                .execute(&mut *conn)
                .await
                .map_err(|e| load_error(path, "batch insert failed", e))?;
            total += chunk.len() as u64;
        }
    }
    Ok(total)
}

fn load_error(path: &Path, what: &str, err: sqlx::Error) -> FileError {
    FileError::Load {
        path: PathBuf::from(path),
        message: format!("{}: {}", what, err),
    }
}

/// Append one row in Postgres COPY text format
fn encode_copy_row(trade: &TradeRecord, out: &mut String) {
    out.push_str(&trade.trade_date.format(TRADE_DATE_FORMAT).to_string());
    out.push('\t');
    escape_copy_text(&trade.instrument_code, out);
    out.push('\t');
    out.push_str(&trade.price.to_string());
    out.push('\t');
    out.push_str(&trade.quantity.to_string());
    out.push('\t');
    out.push_str(&trade.closing_time_code.to_string());
    out.push('\t');
    escape_copy_text(&trade.negotiation_id, out);
    out.push('\n');
}

fn escape_copy_text(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_staging_table;
    use chrono::NaiveDate;

    fn trade(code: &str, negotiation_id: &str) -> TradeRecord {
        TradeRecord {
            trade_date: NaiveDate::from_ymd_opt(2025, 7, 29).unwrap(),
            instrument_code: code.to_string(),
            price: 100.5,
            quantity: 500,
            closing_time_code: 90000123,
            negotiation_id: negotiation_id.to_string(),
        }
    }

    async fn staged_count(pool: &Pool) -> i64 {
        let mut conn = pool.acquire().await.unwrap();
        match &mut conn {
            PoolConnection::Sqlite(c) => {
                let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades_staging")
                    .fetch_one(&mut **c)
                    .await
                    .unwrap();
                count
            }
            PoolConnection::Postgres(_) => unreachable!("tests run on SQLite"),
        }
    }

    #[test]
    fn test_encode_copy_row() {
        let mut out = String::new();
        encode_copy_row(&trade("WDOQ25", "10"), &mut out);

        assert_eq!(out, "2025-07-29\tWDOQ25\t100.5\t500\t90000123\t10\n");
    }

    #[test]
    fn test_copy_text_escaping() {
        let mut out = String::new();
        escape_copy_text("a\tb\\c\nd", &mut out);

        assert_eq!(out, "a\\tb\\\\c\\nd");
    }

    #[tokio::test]
    async fn test_append_streams_all_rows() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        create_staging_table(&pool, "trades_staging").await.unwrap();
        let loader = StagingLoader::new(pool.clone(), "trades_staging");

        // More rows than one batch so the channel is exercised
        let rows = (0..STAGING_BATCH_ROWS + 10).map(|i| Ok(trade("PETR4", &i.to_string())));
        let appended = loader.append(Path::new("big.txt"), rows).await.unwrap();

        assert_eq!(appended, (STAGING_BATCH_ROWS + 10) as u64);
        assert_eq!(staged_count(&pool).await, (STAGING_BATCH_ROWS + 10) as i64);
    }

    #[tokio::test]
    async fn test_append_propagates_row_errors() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        create_staging_table(&pool, "trades_staging").await.unwrap();
        let loader = StagingLoader::new(pool.clone(), "trades_staging");

        let rows = vec![
            Err(FileError::Parse {
                path: PathBuf::from("bad.txt"),
                line: 2,
                message: "expected at least 9 fields, found 2".to_string(),
            }),
            Ok(trade("PETR4", "1")),
        ]
        .into_iter();

        let err = loader.append(Path::new("bad.txt"), rows).await.unwrap_err();

        assert!(matches!(err, FileError::Parse { line: 2, .. }));
        assert_eq!(staged_count(&pool).await, 0);
    }

    #[tokio::test]
    async fn test_append_to_missing_table_is_load_error() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        let loader = StagingLoader::new(pool, "no_such_table");

        let rows = std::iter::once(Ok(trade("PETR4", "1")));
        let err = loader.append(Path::new("a.txt"), rows).await.unwrap_err();

        assert!(matches!(err, FileError::Load { .. }));
    }
}
