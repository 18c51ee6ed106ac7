//! Bounded, deadline-per-task fan-out with "first N successes" early stop.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use opforge_ai::{StageCounts, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutPolicy {
    pub max_concurrency: usize,
    /// Per task, measured from when the task gets a slot.
    pub deadline: Duration,
    /// Stop waiting once this many successes are ready. Zero disables the stop.
    pub stop_after: Option<usize>,
}

#[derive(Debug)]
pub struct FanoutRun<T> {
    /// `(task index, value)`, ordered by index.
    pub successes: Vec<(usize, T)>,
    pub counts: StageCounts,
    pub stopped_early: bool,
}

enum Resolution<T> {
    Success(T),
    Timeout,
    Failure(String),
}

impl<T> Resolution<T> {
    fn outcome(&self) -> TaskOutcome {
        match self {
            Resolution::Success(_) => TaskOutcome::Success,
            Resolution::Timeout => TaskOutcome::Timeout,
            Resolution::Failure(_) => TaskOutcome::Failure,
        }
    }
}

/// Run `tasks` concurrently, at most `max_concurrency` at a time.
///
/// Errors, panics and deadline overruns become that task's outcome and never
/// affect siblings. After an early stop the remaining tasks keep running
/// detached; their outcomes are logged and discarded.
pub async fn fan_out<T, E, Fut>(stage: &'static str, tasks: Vec<Fut>, policy: FanoutPolicy) -> FanoutRun<T>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    fan_out_until(stage, tasks, policy, |successes| successes.len()).await
}

/// Like [`fan_out`], but the early stop compares `stop_after` against
/// `ready(successes)` instead of the raw success count. `ready` is evaluated
/// after every success.
pub async fn fan_out_until<T, E, Fut, R>(
    stage: &'static str,
    tasks: Vec<Fut>,
    policy: FanoutPolicy,
    mut ready: R,
) -> FanoutRun<T>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
    R: FnMut(&[(usize, T)]) -> usize,
{
    let stop_after = policy.stop_after.filter(|n| *n > 0);
    let total = tasks.len();
    let mut counts = StageCounts {
        attempted: total,
        ..Default::default()
    };
    let mut successes = Vec::new();
    let mut stopped_early = false;

    let permits = Arc::new(Semaphore::new(policy.max_concurrency.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Resolution<T>)>();

    for (index, task) in tasks.into_iter().enumerate() {
        let permits = permits.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let resolution = run_with_deadline(task, policy.deadline).await;
            let _ = tx.send((index, resolution));
        });
    }
    drop(tx);

    while let Some((index, resolution)) = rx.recv().await {
        counts.record(resolution.outcome());
        let succeeded = matches!(resolution, Resolution::Success(_));
        match resolution {
            Resolution::Success(value) => successes.push((index, value)),
            Resolution::Timeout => debug!(stage, index, "task deadline exceeded"),
            Resolution::Failure(error) => debug!(stage, index, error = %error, "task failed"),
        }

        if succeeded
            && counts.resolved() < total
            && stop_after.is_some_and(|n| ready(&successes) >= n)
        {
            stopped_early = true;
            break;
        }
    }

    if stopped_early {
        counts.abandoned = total - counts.resolved();
        debug!(stage, abandoned = counts.abandoned, "stopped waiting; abandoning remaining tasks");
        tokio::spawn(drain_late(stage, rx));
    }

    successes.sort_by_key(|(index, _)| *index);
    FanoutRun {
        successes,
        counts,
        stopped_early,
    }
}

async fn run_with_deadline<T, E, Fut>(task: Fut, deadline: Duration) -> Resolution<T>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    // Own task so a panic surfaces as a JoinError instead of unwinding here.
    let mut handle = tokio::spawn(task);
    match timeout(deadline, &mut handle).await {
        Ok(Ok(Ok(value))) => Resolution::Success(value),
        Ok(Ok(Err(err))) => Resolution::Failure(err.to_string()),
        Ok(Err(join_err)) => Resolution::Failure(format!("task panicked: {join_err}")),
        Err(_) => {
            handle.abort();
            Resolution::Timeout
        }
    }
}

async fn drain_late<T>(stage: &'static str, mut rx: mpsc::UnboundedReceiver<(usize, Resolution<T>)>) {
    let mut late = StageCounts::default();
    while let Some((index, resolution)) = rx.recv().await {
        let outcome = resolution.outcome();
        late.record(outcome);
        debug!(stage, index, outcome = ?outcome, "late result discarded");
    }
    debug!(
        stage,
        late_successes = late.succeeded,
        late_timeouts = late.timed_out,
        late_failures = late.failed,
        "abandoned tasks drained"
    );
}
