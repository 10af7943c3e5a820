// Bounded fan-out of per-item jobs with a full barrier at the end.
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, error};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cli::DispatchMode;

/// Runs `worker` once per item with at most `max_parallel` jobs in flight and
/// returns only after every job has finished. Items run in no particular order.
///
/// # Arguments
///
/// * `items` - Independent work items.
/// * `max_parallel` - In-flight cap; 0 is treated as 1.
/// * `mode` - Pool refills slots as they free up; Batched waits for each full
///   batch before launching the next.
/// * `worker` - Async job for one item.
///
/// # Returns
/// Number of jobs run, or the first failure once all jobs have finished.
pub async fn run_bounded<T, F, Fut>(
    items: Vec<T>,
    max_parallel: usize,
    mode: DispatchMode,
    worker: F,
) -> Result<usize>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let max_parallel = max_parallel.max(1);
    let total = items.len();
    debug!("Dispatching {} jobs, {} at a time ({:?})", total, max_parallel, mode);

    let failures = match mode {
        DispatchMode::Pool => run_pooled(items, max_parallel, worker).await,
        DispatchMode::Batched => run_batched(items, max_parallel, worker).await,
    };

    let failed = failures.len();
    let mut failures = failures.into_iter();
    match failures.next() {
        None => Ok(total),
        Some(first) => {
            for other in failures {
                error!("Job failed: {:#}", other);
            }
            Err(first.context(format!("{} of {} jobs failed", failed, total)))
        }
    }
}

async fn run_pooled<T, F, Fut>(items: Vec<T>, max_parallel: usize, worker: F) -> Vec<anyhow::Error>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let worker = Arc::new(worker);
    let mut set = JoinSet::new();
    let mut failures = Vec::new();

    for item in items {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                failures.push(anyhow!("Job pool closed: {}", e));
                break;
            }
        };
        let worker = worker.clone();
        set.spawn(async move {
            let _permit = permit;
            worker(item).await
        });
    }

    drain(&mut set, &mut failures).await;
    failures
}

async fn run_batched<T, F, Fut>(items: Vec<T>, max_parallel: usize, worker: F) -> Vec<anyhow::Error>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut set = JoinSet::new();
    let mut failures = Vec::new();
    let mut running = 0;

    for item in items {
        set.spawn(worker(item));
        running += 1;
        if running == max_parallel {
            drain(&mut set, &mut failures).await;
            running = 0;
        }
    }

    drain(&mut set, &mut failures).await;
    failures
}

async fn drain(set: &mut JoinSet<Result<()>>, failures: &mut Vec<anyhow::Error>) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(e),
            Err(e) => failures.push(anyhow!("Job panicked or was cancelled: {}", e)),
        }
    }
}
