//! Read-side statistics over the durable trade table.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use super::pool::{Pool, PoolConnection};
use crate::config::TRADE_TABLE;

/// Aggregate price and volume figures for one instrument
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QuoteStats {
    /// Highest trade price since the start date
    pub max_price: f64,
    /// Largest per-day sum of traded quantity since the start date
    pub max_daily_volume: i64,
}

/// Source of quote statistics, implemented by the store and by test fakes
#[async_trait]
pub trait QuoteStatsSource: Send + Sync {
    async fn quote_stats(&self, ticker: &str, start_date: NaiveDate)
    -> Result<QuoteStats, sqlx::Error>;
}

fn quote_stats_sql(table: &str) -> String {
    format!(
        r#"
        WITH daily_volumes AS (
            SELECT trade_date, SUM(quantity) AS total
            FROM "{table}"
            WHERE instrument_code = $1 AND trade_date >= $2
            GROUP BY trade_date
        )
        SELECT
            CAST(COALESCE(MAX(t.price), 0) AS DOUBLE PRECISION) AS max_price,
            CAST(COALESCE(MAX(dv.total), 0) AS BIGINT) AS max_daily_volume
        FROM "{table}" t
        LEFT JOIN daily_volumes dv ON t.trade_date = dv.trade_date
        WHERE t.instrument_code = $3 AND t.trade_date >= $4
        "#
    )
}

/// Compute `QuoteStats` for `ticker` over trades on or after `start_date`.
/// Both figures are zero when nothing matches.
pub async fn quote_stats(
    pool: &Pool,
    table: &str,
    ticker: &str,
    start_date: NaiveDate,
) -> Result<QuoteStats, sqlx::Error> {
    let sql = quote_stats_sql(table);

    let (max_price, max_daily_volume): (f64, i64) = match pool.acquire().await? {
        PoolConnection::Postgres(mut conn) => {
            sqlx::query_as(&sql)
                .bind(ticker)
                .bind(start_date)
                .bind(ticker)
                .bind(start_date)
                .fetch_one(&mut *conn)
                .await?
        }
        #[cfg(test)]
        PoolConnection::Sqlite(mut conn) => {
            let sqlite_sql = convert_to_sqlite_placeholders(&sql);
            sqlx::query_as(&sqlite_sql)
                .bind(ticker)
                .bind(start_date)
                .bind(ticker)
                .bind(start_date)
                .fetch_one(&mut *conn)
                .await?
        }
    };

    Ok(QuoteStats {
        max_price,
        max_daily_volume,
    })
}

/// Convert Postgres-style placeholders ($1, $2, ...) to SQLite-style (?, ?, ...)
#[cfg(test)]
fn convert_to_sqlite_placeholders(sql: &str) -> String {
    let mut result = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            // Skip the dollar sign and any following digits
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            result.push('?');
        } else {
            result.push(ch);
        }
    }

    result
}

#[async_trait]
impl QuoteStatsSource for Pool {
    async fn quote_stats(
        &self,
        ticker: &str,
        start_date: NaiveDate,
    ) -> Result<QuoteStats, sqlx::Error> {
        quote_stats(self, TRADE_TABLE, ticker, start_date).await
    }
}
