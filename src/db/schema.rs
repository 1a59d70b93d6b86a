//! SQL for the durable trade table, the staging table and the merge between them.
//!
//! Statements are generated per backend: Postgres in production, SQLite for tests.
//! Each statement is executed on its own; none rely on multi-statement batches.

use super::pool::Pool;

/// SQL data types used by the trade tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Date,
    Text,
    Numeric,
    BigInt,
}

impl SqlType {
    /// Returns the Postgres type name
    pub fn to_postgres(self) -> &'static str {
        match self {
            SqlType::Date => "DATE",
            SqlType::Text => "TEXT",
            SqlType::Numeric => "NUMERIC",
            SqlType::BigInt => "BIGINT",
        }
    }
}

/// A column of the trade tables
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
}

/// Columns shared by the staging and durable tables, in COPY order
pub const TRADE_COLUMNS: [Column; 6] = [
    Column {
        name: "trade_date",
        sql_type: SqlType::Date,
    },
    Column {
        name: "instrument_code",
        sql_type: SqlType::Text,
    },
    Column {
        name: "price",
        sql_type: SqlType::Numeric,
    },
    Column {
        name: "quantity",
        sql_type: SqlType::BigInt,
    },
    Column {
        name: "closing_time_code",
        sql_type: SqlType::BigInt,
    },
    Column {
        name: "negotiation_id",
        sql_type: SqlType::BigInt,
    },
];

/// Columns forming the deduplication key of the durable table
pub const UNIQUE_KEY: [&str; 4] = [
    "trade_date",
    "instrument_code",
    "closing_time_code",
    "negotiation_id",
];

/// Columns of the lookup index used by quote queries
pub const LOOKUP_INDEX: [&str; 2] = ["instrument_code", "trade_date"];

fn quoted(names: impl IntoIterator<Item = &'static str>) -> String {
    names
        .into_iter()
        .map(|n| format!("\"{}\"", n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quoted, comma separated list of all trade columns
pub fn column_list() -> String {
    quoted(TRADE_COLUMNS.iter().map(|c| c.name))
}

pub fn unique_constraint_name(table: &str) -> String {
    format!("{}_unique_trade", table)
}

pub fn lookup_index_name(table: &str) -> String {
    format!("idx_{}_instrument_date", table)
}

/// CREATE TABLE IF NOT EXISTS for a trade table.
/// `unlogged` only has an effect on Postgres.
pub fn generate_ddl(table: &str, unlogged: bool) -> String {
    let column_defs: Vec<String> = TRADE_COLUMNS
        .iter()
        .map(|col| format!("  \"{}\" {}", col.name, col.sql_type.to_postgres()))
        .collect();

    format!(
        "CREATE {}TABLE IF NOT EXISTS \"{}\" (\n{}\n)",
        if unlogged { "UNLOGGED " } else { "" },
        table,
        column_defs.join(",\n")
    )
}

/// Idempotent creation of the uniqueness constraint.
///
/// On Postgres a concurrent creator may win the race between the existence
/// check and the ALTER; the exception handler swallows that case.
pub fn unique_constraint_sql(is_postgres: bool, table: &str) -> String {
    let name = unique_constraint_name(table);
    let key = quoted(UNIQUE_KEY);
    if is_postgres {
        format!(
            r#"DO $$
BEGIN
  IF NOT EXISTS (
    SELECT 1 FROM pg_constraint
    WHERE conname = '{name}' AND conrelid = '"{table}"'::regclass
  ) THEN
    ALTER TABLE "{table}" ADD CONSTRAINT "{name}" UNIQUE ({key});
  END IF;
EXCEPTION
  WHEN duplicate_object OR duplicate_table THEN NULL;
END
$$"#
        )
    } else {
        format!("CREATE UNIQUE INDEX IF NOT EXISTS \"{name}\" ON \"{table}\" ({key})")
    }
}

/// Conflict-tolerant copy of every staged row into the durable table
pub fn merge_sql(is_postgres: bool, staging: &str, target: &str) -> String {
    let columns = column_list();
    if is_postgres {
        format!(
            "INSERT INTO \"{target}\" ({columns}) SELECT {columns} FROM \"{staging}\" ON CONFLICT DO NOTHING"
        )
    } else {
        format!("INSERT OR IGNORE INTO \"{target}\" ({columns}) SELECT {columns} FROM \"{staging}\"")
    }
}

pub fn lookup_index_sql(table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
        lookup_index_name(table),
        table,
        quoted(LOOKUP_INDEX)
    )
}

pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS \"{}\"", table)
}

/// Make sure the durable trade table exists with its base columns
pub async fn ensure_trade_table(pool: &Pool, table: &str) -> Result<(), sqlx::Error> {
    pool.execute_query(&generate_ddl(table, false)).await?;
    Ok(())
}

/// Create the write-optimized staging table for this run
pub async fn create_staging_table(pool: &Pool, table: &str) -> Result<(), sqlx::Error> {
    pool.execute_query(&generate_ddl(table, pool.is_postgres()))
        .await?;
    Ok(())
}
