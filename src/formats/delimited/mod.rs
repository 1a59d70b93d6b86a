//! Delimited (semicolon separated) trade files

pub mod reader;
