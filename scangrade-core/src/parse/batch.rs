use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::ScanConfig,
    entities::{PageNumber, PageResult},
    error::PageError,
};

/// Bounded pool running independent page units.
///
/// Each unit runs on a blocking thread while holding one of `max_workers`
/// permits; the permit goes back only when the work returns, even when the
/// unit already timed out. Results are sorted by page number.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    max_workers: usize,
    page_timeout: Option<Duration>,
}

impl BatchScheduler {
    pub fn new(max_workers: usize, page_timeout: Option<Duration>) -> Self {
        Self {
            max_workers: max_workers.max(1),
            page_timeout,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(config.max_workers, config.page_timeout)
    }

    #[tracing::instrument(skip_all, fields(max_workers = self.max_workers))]
    pub async fn run<T, F, P>(
        &self,
        mut units: mpsc::Receiver<(PageNumber, T)>,
        work: F,
        cancel: CancellationToken,
        progress: Option<P>,
    ) -> Vec<PageResult>
    where
        T: Send + 'static,
        F: Fn(PageNumber, T, &CancellationToken) -> PageResult + Send + Sync + 'static,
        P: Fn(PageNumber),
    {
        let work = Arc::new(work);
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut set = JoinSet::new();
        let mut results = Vec::new();
        let mut pending = BTreeSet::new();

        while let Some((page_number, unit)) = units.recv().await {
            if cancel.is_cancelled() {
                results.push(PageResult::failed(page_number, PageError::Cancelled));
                continue;
            }
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        results.push(PageResult::failed(
                            page_number,
                            PageError::WorkerFailure(e.to_string()),
                        ));
                        continue;
                    }
                },
                _ = cancel.cancelled() => {
                    results.push(PageResult::failed(page_number, PageError::Cancelled));
                    continue;
                }
            };

            pending.insert(page_number);
            let work = Arc::clone(&work);
            let unit_token = cancel.child_token();
            let page_timeout = self.page_timeout;
            set.spawn(
                async move {
                    let worker_token = unit_token.clone();
                    let handle = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        work(page_number, unit, &worker_token)
                    });
                    let joined = match page_timeout {
                        Some(limit) => match tokio::time::timeout(limit, handle).await {
                            Ok(joined) => joined,
                            Err(_) => {
                                tracing::warn!("page {page_number} timed out after {limit:?}");
                                // Stops the worker at its next stage boundary.
                                unit_token.cancel();
                                return PageResult::failed(page_number, PageError::Timeout);
                            }
                        },
                        None => handle.await,
                    };
                    match joined {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::error!("page {page_number} worker failed: {e}");
                            PageResult::failed(page_number, PageError::WorkerFailure(e.to_string()))
                        }
                    }
                }
                .in_current_span(),
            );

            // Collect what already finished so progress is reported while feeding.
            while let Some(joined) = set.try_join_next() {
                collect(joined, &mut results, &mut pending, progress.as_ref());
            }
        }

        while let Some(joined) = set.join_next().await {
            collect(joined, &mut results, &mut pending, progress.as_ref());
        }
        for page_number in pending {
            tracing::error!("page {page_number} produced no result");
            results.push(PageResult::failed(
                page_number,
                PageError::WorkerFailure("worker task lost".to_owned()),
            ));
        }

        results.sort_by_key(|r| r.page_number());
        results
    }
}

fn collect<P: Fn(PageNumber)>(
    joined: Result<PageResult, tokio::task::JoinError>,
    results: &mut Vec<PageResult>,
    pending: &mut BTreeSet<PageNumber>,
    progress: Option<&P>,
) {
    match joined {
        Ok(result) => {
            pending.remove(&result.page_number());
            if let Some(progress) = progress {
                progress(result.page_number());
            }
            results.push(result);
        }
        Err(e) => tracing::error!("Error joining page task: {e:?}"),
    }
}

/// Channel preloaded with `units`, closed once drained.
pub fn queued<T>(units: Vec<(PageNumber, T)>) -> mpsc::Receiver<(PageNumber, T)> {
    let (tx, rx) = mpsc::channel(units.len().max(1));
    for unit in units {
        // Capacity covers every unit.
        let _ = tx.try_send(unit);
    }
    rx
}
