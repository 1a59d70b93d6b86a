use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::FileError;
use crate::formats::reader::{DelimitedConfig, FieldCoercion, TradeRecord};

/// Streaming reader that turns a delimited trade file into `TradeRecord`s.
///
/// Rows are pulled lazily from the underlying reader, so only the buffer
/// and the current record are held in memory. The sequence ends at the
/// first error; it cannot be restarted.
pub struct TradeReader<R: Read> {
    path: PathBuf,
    records: csv::StringRecordsIntoIter<R>,
    coercion: FieldCoercion,
    finished: bool,
}

impl<R: Read> TradeReader<R> {
    pub fn new(
        path: impl AsRef<Path>,
        reader: R,
        config: &DelimitedConfig,
        coercion: FieldCoercion,
    ) -> Self {
        // Row length is validated per record by the coercion step
        let records = csv::ReaderBuilder::new()
            .delimiter(config.delimiter)
            .quote(config.quote)
            .has_headers(config.has_header)
            .flexible(true)
            .from_reader(reader)
            .into_records();

        Self {
            path: path.as_ref().to_path_buf(),
            records,
            coercion,
            finished: false,
        }
    }

    fn read_error(&self, err: csv::Error) -> FileError {
        let line = err.position().map(|p| p.line()).unwrap_or(0);
        if err.is_io_error() {
            FileError::Load {
                path: self.path.clone(),
                message: format!("read interrupted: {}", err),
            }
        } else {
            FileError::Parse {
                path: self.path.clone(),
                line,
                message: err.to_string(),
            }
        }
    }
}

impl<R: Read> Iterator for TradeReader<R> {
    type Item = Result<TradeRecord, FileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let item = match self.records.next()? {
            Ok(record) => self.coercion.to_trade(&record).map_err(|message| {
                FileError::Parse {
                    path: self.path.clone(),
                    line: record.position().map(|p| p.line()).unwrap_or(0),
                    message,
                }
            }),
            Err(e) => Err(self.read_error(e)),
        };

        if item.is_err() {
            self.finished = true;
        }
        Some(item)
    }
}
