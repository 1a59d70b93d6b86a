use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::db::StagingLoader;
use crate::error::FileError;
use crate::formats::FieldCoercion;
use crate::io::open_trade_file;
use crate::telemetry::TelemetryEvent;

/// Processes one source file end to end: open, parse, stage.
///
/// Cheap to clone; one clone is handed to each admitted file.
#[derive(Debug, Clone)]
pub struct FileWorker {
    loader: StagingLoader,
    coercion: FieldCoercion,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl FileWorker {
    pub fn new(
        loader: StagingLoader,
        coercion: FieldCoercion,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self {
            loader,
            coercion,
            telemetry_tx,
        }
    }

    /// Stage every row of `path` and return how many were appended.
    ///
    /// The completion event is sent before returning, so it is always
    /// observed before the worker slot is handed to another file.
    pub async fn process(self, path: PathBuf) -> Result<u64, FileError> {
        let _ = self.telemetry_tx.send(TelemetryEvent::FileStarted);
        info!("Processing file {}", path.display());
        let start = Instant::now();

        let result = self.stage(&path).await;

        match &result {
            Ok(rows_staged) => {
                debug!(
                    "Staged {} rows from {} in {:.2}s",
                    rows_staged,
                    path.display(),
                    start.elapsed().as_secs_f64()
                );
                let _ = self.telemetry_tx.send(TelemetryEvent::FileCompleted {
                    rows_staged: *rows_staged,
                });
            }
            Err(_) => {
                let _ = self.telemetry_tx.send(TelemetryEvent::FileFailed);
            }
        }

        result
    }

    async fn stage(&self, path: &Path) -> Result<u64, FileError> {
        let rows = open_trade_file(path, self.coercion)?;
        self.loader.append(path, rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Pool;
    use crate::db::schema::create_staging_table;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "DataReferencia;CodigoInstrumento;AcaoAtualizacao;PrecoNegocio;QuantidadeNegociada;HoraFechamento;CodigoIdentificadorNegocio;TipoSessaoPregao;DataNegocio;CodigoParticipanteComprador;CodigoParticipanteVendedor\n";

    async fn worker() -> (FileWorker, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        create_staging_table(&pool, "trades_staging").await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = FileWorker::new(
            StagingLoader::new(pool, "trades_staging"),
            FieldCoercion::Lenient,
            tx,
        );
        (worker, rx)
    }

    #[tokio::test]
    async fn test_process_stages_rows_and_reports_completion() {
        let (worker, mut rx) = worker().await;
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "{HEADER}2025-07-29;PETR4;0;30,1;100;1;7;1;2025-07-29\n\
             2025-07-29;PETR4;0;30,2;200;2;8;1;2025-07-29\n"
        )
        .unwrap();

        let rows = worker.process(file.path().to_path_buf()).await.unwrap();

        assert_eq!(rows, 2);
        assert!(matches!(rx.recv().await, Some(TelemetryEvent::FileStarted)));
        assert!(matches!(
            rx.recv().await,
            Some(TelemetryEvent::FileCompleted { rows_staged: 2 })
        ));
    }

    #[tokio::test]
    async fn test_missing_file_reports_failure() {
        let (worker, mut rx) = worker().await;

        let err = worker
            .process(PathBuf::from("/definitely/not/here.txt"))
            .await
            .unwrap_err();

        assert!(matches!(err, FileError::Open { .. }));
        assert!(matches!(rx.recv().await, Some(TelemetryEvent::FileStarted)));
        assert!(matches!(rx.recv().await, Some(TelemetryEvent::FileFailed)));
    }
}
