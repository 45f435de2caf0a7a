//! Fixed-size worker pool over a bounded task queue.
//!
//! Every concurrent stage (enrichment, prediction, verification, position
//! sweep) runs through `run_pool`:
//! - a producer feeds tasks into a bounded channel
//! - `workers.len()` tasks pull from it, each owning its `Worker` state
//! - results flow to a single collector in completion order
//!
//! Workers check the cancellation token between tasks. A task already in
//! flight runs to completion; nothing is hard-aborted.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One pool member. State such as a rate limiter lives on the worker and
/// is never shared with its siblings.
#[async_trait]
pub trait Worker: Send + 'static {
    type Task: Send + 'static;
    type Output: Send + 'static;

    async fn process(&mut self, task: Self::Task) -> Self::Output;
}

/// Collected results and counters of one pool run.
#[derive(Debug)]
pub struct PoolRun<R> {
    pub results: Vec<R>,
    pub submitted: u64,
    pub completed: u64,
    /// True when the run stopped before every task was processed.
    pub cancelled: bool,
}

impl<R> PoolRun<R> {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            submitted: 0,
            completed: 0,
            cancelled: false,
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
}

/// Drain `tasks` through `workers` and collect every output.
pub async fn run_pool<W: Worker>(
    label: &'static str,
    workers: Vec<W>,
    tasks: Vec<W::Task>,
    cancel: &CancellationToken,
) -> PoolRun<W::Output> {
    let total = tasks.len() as u64;
    if workers.is_empty() || tasks.is_empty() {
        return PoolRun::empty();
    }

    let depth = workers.len();
    let (task_tx, task_rx) = mpsc::channel::<W::Task>(depth);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<W::Output>(depth);
    let counters = Arc::new(PoolCounters::default());

    let mut set = JoinSet::new();
    for (idx, mut worker) in workers.into_iter().enumerate() {
        let rx = Arc::clone(&task_rx);
        let tx = result_tx.clone();
        let cancel = cancel.clone();
        let counters = Arc::clone(&counters);
        set.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = rx.lock().await.recv().await;
                let Some(task) = next else { break };
                let output = worker.process(task).await;
                counters.completed.fetch_add(1, Ordering::Relaxed);
                if tx.send(output).await.is_err() {
                    break;
                }
            }
            debug!(pool = label, worker = idx, "Worker stopped");
        });
    }
    // Only workers hold the queue and result ends from here on.
    drop(task_rx);
    drop(result_tx);

    let producer_cancel = cancel.clone();
    let producer_counters = Arc::clone(&counters);
    let producer = tokio::spawn(async move {
        for task in tasks {
            tokio::select! {
                biased;
                _ = producer_cancel.cancelled() => break,
                sent = task_tx.send(task) => {
                    if sent.is_err() {
                        break;
                    }
                    producer_counters.submitted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    let mut results = Vec::with_capacity(tasks_capacity(total));
    while let Some(output) = result_rx.recv().await {
        results.push(output);
    }

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            warn!(pool = label, error = %e, "Worker task failed");
        }
    }
    if let Err(e) = producer.await {
        warn!(pool = label, error = %e, "Producer task failed");
    }

    let completed = counters.completed.load(Ordering::Relaxed);
    PoolRun {
        results,
        submitted: counters.submitted.load(Ordering::Relaxed),
        completed,
        cancelled: completed < total,
    }
}

fn tasks_capacity(total: u64) -> usize {
    usize::try_from(total).unwrap_or(usize::MAX).min(4096)
}
