//! Error taxonomy for an ingestion run.
//!
//! Run-level errors abort the run (or terminate it after the merge step);
//! per-file errors are collected and never unwind sibling workers.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that end an ingestion run
#[derive(Debug, Error)]
pub enum IngestError {
    /// The source directory could not be listed; nothing was staged
    #[error("cannot list source directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The staging table could not be created
    #[error("cannot prepare staging table: {0}")]
    Staging(#[source] sqlx::Error),

    /// A file failed; only the first failure of a run is surfaced here
    #[error(transparent)]
    File(#[from] FileError),

    /// Constraint, merge or index creation failed after the join barrier
    #[error("finalize step '{step}' failed: {source}")]
    Finalize {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Failure of a single file, isolated to that file
#[derive(Debug, Error)]
pub enum FileError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {path} at line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: u64,
        message: String,
    },

    #[error("load error in {path}: {message}")]
    Load { path: PathBuf, message: String },

    #[error("worker for {path} panicked: {message}")]
    Panicked { path: PathBuf, message: String },

    #[error("worker for {path} was cancelled")]
    Cancelled { path: PathBuf },
}

impl FileError {
    /// The file this error belongs to
    pub fn path(&self) -> &PathBuf {
        match self {
            FileError::Open { path, .. }
            | FileError::Parse { path, .. }
            | FileError::Load { path, .. }
            | FileError::Panicked { path, .. }
            | FileError::Cancelled { path } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_error_keeps_path_and_line() {
        let err = FileError::Parse {
            path: PathBuf::from("/data/a.txt"),
            line: 12,
            message: "expected at least 9 fields, found 3".to_string(),
        };

        assert_eq!(err.path(), &PathBuf::from("/data/a.txt"));
        let msg = err.to_string();
        assert!(msg.contains("/data/a.txt"));
        assert!(msg.contains("line 12"));
    }

    #[test]
    fn test_ingest_error_wraps_file_error_transparently() {
        let err: IngestError = FileError::Load {
            path: PathBuf::from("b.txt"),
            message: "connection reset".to_string(),
        }
        .into();

        assert_eq!(err.to_string(), "load error in b.txt: connection reset");
    }
}
