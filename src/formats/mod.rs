//! Trade file formats and parsers

pub mod delimited;
pub mod reader;

pub use delimited::reader::TradeReader;
pub use reader::{DelimitedConfig, FieldCoercion, TradeRecord};
