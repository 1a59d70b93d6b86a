//! Trade store access: connection pool, schema, staging and quote queries

pub mod pool;
pub mod quotes;
pub mod schema;
pub mod staging;

pub use pool::Pool;
pub use quotes::QuoteStatsSource;
pub use staging::StagingLoader;
