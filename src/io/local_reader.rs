use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::config::READ_BUFFER_SIZE;
use crate::error::FileError;
use crate::formats::{DelimitedConfig, FieldCoercion, TradeReader};

/// Open a local trade file for streaming parsing
pub fn open_trade_file(
    path: &Path,
    coercion: FieldCoercion,
) -> Result<TradeReader<BufReader<File>>, FileError> {
    let file = File::open(path).map_err(|source| FileError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let buffered = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    Ok(TradeReader::new(
        path,
        buffered,
        &DelimitedConfig::b3(),
        coercion,
    ))
}
