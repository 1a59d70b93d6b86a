//! Bounded fan-out of per-file tasks with a join barrier.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::error;

use crate::error::FileError;

/// Run `task` once per item, never more than `limit` at a time, and wait for
/// all of them.
///
/// Each result is handed to `on_complete` as soon as its task is joined, in
/// completion order, so a failure is seen while slower siblings still run.
/// A panicking task is reported as `FileError::Panicked` for its item and
/// does not affect the others.
pub async fn run_bounded<I, F, Fut, T, C>(items: I, limit: usize, task: F, mut on_complete: C)
where
    I: IntoIterator<Item = PathBuf>,
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = Result<T, FileError>> + Send + 'static,
    T: Send + 'static,
    C: FnMut(Result<T, FileError>),
{
    let limit = limit.max(1);
    let mut join_set: JoinSet<Result<T, FileError>> = JoinSet::new();
    let mut in_flight: HashMap<Id, PathBuf> = HashMap::new();

    for path in items {
        // Wait if we've reached concurrency limit
        while join_set.len() >= limit {
            if let Some(joined) = join_set.join_next_with_id().await {
                on_complete(resolve(&mut in_flight, joined));
            }
        }

        let fut = task(path.clone());
        let task_path = path.clone();
        let handle = join_set.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(FileError::Panicked {
                    path: task_path,
                    message: panic_message(payload.as_ref()),
                }),
            }
        });
        in_flight.insert(handle.id(), path);
    }

    // Join barrier
    while let Some(joined) = join_set.join_next_with_id().await {
        on_complete(resolve(&mut in_flight, joined));
    }
}

/// Map a joined task back to its file, including tasks that never produced
/// an output
fn resolve<T>(
    in_flight: &mut HashMap<Id, PathBuf>,
    joined: Result<(Id, Result<T, FileError>), JoinError>,
) -> Result<T, FileError> {
    match joined {
        Ok((id, result)) => {
            in_flight.remove(&id);
            result
        }
        Err(e) => {
            let path = in_flight.remove(&e.id()).unwrap_or_default();
            if e.is_panic() {
                Err(FileError::Panicked {
                    path,
                    message: e.to_string(),
                })
            } else {
                Err(FileError::Cancelled { path })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Keeps the first per-file error of a run and logs every one of them
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    first: Option<FileError>,
    count: usize,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, err: FileError) {
        error!(file = %err.path().display(), "File failed: {}", err);
        self.count += 1;
        if self.first.is_none() {
            self.first = Some(err);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn into_first(self) -> Option<FileError> {
        self.first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("file-{i}.txt"))).collect()
    }

    /// Run `task` over `items` and collect results in completion order
    async fn collect_bounded<F, Fut, T>(items: Vec<PathBuf>, limit: usize, task: F) -> Vec<Result<T, FileError>>
    where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, FileError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut results = Vec::new();
        run_bounded(items, limit, task, |result| results.push(result)).await;
        results
    }

    async fn max_in_flight(files: usize, limit: usize) -> usize {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = collect_bounded(paths(files), limit, |_path| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, FileError>(())
            }
        })
        .await;

        assert_eq!(results.len(), files);
        assert_eq!(current.load(Ordering::SeqCst), 0);
        peak.load(Ordering::SeqCst)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_never_exceeds_limit() {
        for limit in [1, 2, 3, 8] {
            let peak = max_in_flight(12, limit).await;
            assert!(peak <= limit, "peak {} exceeded limit {}", peak, limit);
            assert!(peak >= 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limit_of_one_is_sequential() {
        assert_eq!(max_in_flight(5, 1).await, 1);
    }

    #[tokio::test]
    async fn test_failures_do_not_cancel_siblings() {
        let results = collect_bounded(paths(4), 2, |path| async move {
            if path.to_string_lossy().contains('1') {
                Err(FileError::Load {
                    path,
                    message: "boom".to_string(),
                })
            } else {
                Ok(path)
            }
        })
        .await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_is_reported_while_sibling_still_running() {
        // file-1 only finishes once the failure of file-0 has been reported
        let release = Arc::new(Notify::new());
        let sibling_done = Arc::new(AtomicBool::new(false));
        let mut reported = Vec::new();
        let mut released_in_time = None;

        run_bounded(
            paths(2),
            2,
            |path| {
                let release = Arc::clone(&release);
                let sibling_done = Arc::clone(&sibling_done);
                async move {
                    if path.to_string_lossy().contains('0') {
                        return Err(FileError::Load {
                            path,
                            message: "connection reset".to_string(),
                        });
                    }
                    let waited = tokio::time::timeout(Duration::from_secs(5), release.notified()).await;
                    sibling_done.store(true, Ordering::SeqCst);
                    Ok(waited.is_ok())
                }
            },
            |result| match result {
                Err(e) => {
                    reported.push((e.path().clone(), sibling_done.load(Ordering::SeqCst)));
                    release.notify_one();
                }
                Ok(in_time) => released_in_time = Some(in_time),
            },
        )
        .await;

        assert_eq!(reported, vec![(PathBuf::from("file-0.txt"), false)]);
        assert_eq!(released_in_time, Some(true));
    }

    #[tokio::test]
    async fn test_panic_is_reported_for_its_file() {
        let results = collect_bounded(paths(2), 2, |path| async move {
            if path.to_string_lossy().contains('0') {
                panic!("parser exploded");
            }
            Ok::<_, FileError>(())
        })
        .await;

        let panicked: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        assert_eq!(panicked.len(), 1);
        match &panicked[0] {
            FileError::Panicked { path, message } => {
                assert_eq!(path, &PathBuf::from("file-0.txt"));
                assert!(message.contains("parser exploded"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_task_keeps_its_file() {
        let mut join_set: JoinSet<Result<(), FileError>> = JoinSet::new();
        let mut in_flight = HashMap::new();
        let handle = join_set.spawn(std::future::pending());
        in_flight.insert(handle.id(), PathBuf::from("stuck.txt"));
        handle.abort();

        let joined = join_set.join_next_with_id().await.unwrap();
        match resolve(&mut in_flight, joined) {
            Err(FileError::Cancelled { path }) => assert_eq!(path, PathBuf::from("stuck.txt")),
            other => panic!("expected cancellation, got {:?}", other),
        }
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_first_error_is_by_completion_order() {
        let mut errors = ErrorAggregator::new();
        run_bounded(
            paths(2),
            2,
            |path| async move {
                // file-0 finishes last even though it was admitted first
                let delay = if path.to_string_lossy().contains('0') { 50 } else { 1 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Err::<(), _>(FileError::Load {
                    path,
                    message: "unavailable".to_string(),
                })
            },
            |result| {
                if let Err(e) = result {
                    errors.record(e);
                }
            },
        )
        .await;

        assert_eq!(errors.count(), 2);
        assert_eq!(errors.into_first().unwrap().path(), Path::new("file-1.txt"));
    }
}
