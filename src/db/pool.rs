//! Adapter between bb8 and the sqlx::Postgres driver.
use anyhow::{Context, Result};
use derive_builder::Builder;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use std::sync::Arc;

use crate::config::{CONNECTION_MAX_LIFETIME, CONNECT_TIMEOUT, PING_TIMEOUT};

pub type Bb8Connection<'a> = bb8::PooledConnection<'a, ConnectionManager>;

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    #[cfg(test)]
    Sqlite(sqlx::SqlitePool),
}

/// Connection that can be either Postgres or SQLite
pub enum PoolConnection {
    Postgres(Bb8Connection<'static>),
    #[cfg(test)]
    Sqlite(sqlx::pool::PoolConnection<sqlx::Sqlite>),
}

/// Shared handle to the trade store.
///
/// Cloning is cheap; all clones share the same underlying connections.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
}

#[derive(Builder)]
pub struct PoolArgs {
    #[builder(setter(into))]
    host: String,
    #[builder(default = "5432")]
    port: u16,
    #[builder(setter(into))]
    database: String,
    #[builder(setter(into))]
    username: String,
    #[builder(setter(into))]
    password: String,
    #[builder(default = "false")]
    ssl: bool,
    /// Staging workers plus one connection for the finalize step
    #[builder(default = "7")]
    max_pool_size: u32,
}

pub async fn pool(args: PoolArgs) -> anyhow::Result<Pool> {
    let PoolArgs {
        host,
        port,
        database,
        username,
        password,
        ssl,
        max_pool_size,
    } = args;

    let ssl_mode = if ssl {
        PgSslMode::Require
    } else {
        PgSslMode::Disable
    };
    let connect_options = PgConnectOptions::new()
        .host(&host)
        .port(port)
        .username(&username)
        .password(&password)
        .database(&database)
        .ssl_mode(ssl_mode);

    let conn_manager = ConnectionManager::new(connect_options);

    let bb8_pool = bb8::Builder::new()
        .min_idle(Some(1))
        .max_size(max_pool_size)
        .max_lifetime(Some(CONNECTION_MAX_LIFETIME))
        .build(conn_manager)
        .await
        .with_context(|| format!("Failed to connect to database {}@{}:{}", database, host, port))?;

    Ok(Pool {
        inner: PoolInner::Postgres(bb8_pool),
    })
}

impl Pool {
    /// Create an in-memory SQLite pool for testing
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
        })
    }

    pub async fn acquire(&self) -> Result<PoolConnection, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let conn = pool.get_owned().await.map_err(|e| match e {
                    bb8::RunError::User(e) => e,
                    bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
                })?;
                Ok(PoolConnection::Postgres(conn))
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let conn = pool.acquire().await?;
                Ok(PoolConnection::Sqlite(conn))
            }
        }
    }

    /// Execute a single statement (DDL or DML) and return the affected row count
    pub async fn execute_query(&self, sql: &str) -> Result<u64, sqlx::Error> {
        match self.acquire().await? {
            PoolConnection::Postgres(mut conn) => {
                let result = sqlx::query(sql).execute(&mut *conn).await?;
                Ok(result.rows_affected())
            }
            #[cfg(test)]
            PoolConnection::Sqlite(mut conn) => {
                let result = sqlx::query(sql).execute(&mut *conn).await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Check if this pool is using PostgreSQL (returns false for SQLite)
    pub fn is_postgres(&self) -> bool {
        matches!(&self.inner, PoolInner::Postgres(_))
    }
}

/// Creates and validates Postgres connections for bb8
#[derive(Debug)]
pub struct ConnectionManager {
    connect_options: Arc<PgConnectOptions>,
}

impl ConnectionManager {
    /// Create a new `ConnectionManager` with the specified connect options.
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self {
            connect_options: Arc::new(connect_options),
        }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.connect_options.connect())
            .await
            .map_err(|_| sqlx::Error::PoolTimedOut)?
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        tokio::time::timeout(PING_TIMEOUT, sqlx::Connection::ping(conn))
            .await
            // Convert tokio timeouts into sqlx pool timeouts. bb8 will retry a different connection on ping failure.
            .map_err(|_| sqlx::Error::PoolTimedOut)
            // Make sure that we also look at the actual ping result
            .and_then(|result| result)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // sqlx::PgConnection provides no non-async way to check for closed/broken connections.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_args_defaults() {
        let args = PoolArgsBuilder::default()
            .host("localhost")
            .database("b3db")
            .username("postgres")
            .password("postgres")
            .build()
            .unwrap();

        assert_eq!(args.port, 5432);
        assert!(!args.ssl);
        assert_eq!(args.max_pool_size, 7);
    }

    #[test]
    fn test_pool_args_require_credentials() {
        let result = PoolArgsBuilder::default().host("localhost").build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_pool_executes_statements() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        assert!(!pool.is_postgres());

        pool.execute_query("CREATE TABLE t (v INTEGER)").await.unwrap();
        let inserted = pool
            .execute_query("INSERT INTO t (v) VALUES (1), (2)")
            .await
            .unwrap();
        assert_eq!(inserted, 2);
    }
}
