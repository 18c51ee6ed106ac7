//! Lease heartbeat: keeps a claimed job's lock fresh while the runner works.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use opforge_core::{JobId, WorkerId};

use crate::config::HeartbeatConfig;

use super::queue::JobQueue;
use super::store::LeaseStore;

/// What the heartbeat observed over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub extensions: u32,
    pub errors: u32,
    /// An extension returned `false`: another worker took the job, or it was released.
    pub lock_lost: bool,
    /// The task did not exit within the grace period and was aborted.
    pub aborted: bool,
}

/// Handle owning the heartbeat task and its stop signal.
#[derive(Debug)]
pub struct HeartbeatHandle {
    job_id: JobId,
    stop: Arc<Notify>,
    join: JoinHandle<HeartbeatReport>,
    grace: std::time::Duration,
}

impl HeartbeatHandle {
    /// Start extending `job_id`'s lease every `config.interval`.
    ///
    /// The first extension happens one interval after start; the claim itself
    /// just stamped `locked_at`.
    pub fn spawn<S>(
        queue: Arc<JobQueue<S>>,
        job_id: JobId,
        worker_id: WorkerId,
        config: HeartbeatConfig,
    ) -> Self
    where
        S: LeaseStore + 'static,
    {
        let stop = Arc::new(Notify::new());
        let signal = stop.clone();

        let join = tokio::spawn(async move {
            let mut report = HeartbeatReport::default();
            let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        match queue.extend_lock(job_id, &worker_id).await {
                            Ok(true) => {
                                report.extensions += 1;
                                debug!(job_id = %job_id, worker_id = %worker_id, "lease extended");
                            }
                            Ok(false) => {
                                report.lock_lost = true;
                                warn!(
                                    job_id = %job_id,
                                    worker_id = %worker_id,
                                    "lease lost; runner continues, terminal report will be ignored"
                                );
                                break;
                            }
                            Err(err) => {
                                report.errors += 1;
                                warn!(job_id = %job_id, worker_id = %worker_id, error = %err, "lease extension failed");
                            }
                        }
                    }
                }
            }
            report
        });

        Self {
            job_id,
            stop,
            join,
            grace: config.grace,
        }
    }

    /// Signal stop and join within the grace period; abort on overrun.
    pub async fn stop(mut self) -> HeartbeatReport {
        self.stop.notify_one();
        match tokio::time::timeout(self.grace, &mut self.join).await {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                warn!(job_id = %self.job_id, error = %err, "heartbeat task ended abnormally");
                HeartbeatReport::default()
            }
            Err(_) => {
                self.join.abort();
                warn!(job_id = %self.job_id, "heartbeat did not stop within grace period; aborted");
                HeartbeatReport {
                    aborted: true,
                    ..Default::default()
                }
            }
        }
    }
}
