//! Local file access: discovering source files and opening them for streaming

pub mod discovery;
pub mod local_reader;

pub use discovery::list_source_files;
pub use local_reader::open_trade_file;
