//! Integration tests for the queue, worker and pipeline working together.
//!
//! Tests: enqueue → claim → heartbeat → pipeline → terminal update
//!
//! Verifies:
//! - At most one worker wins a claim under contention
//! - Orphaned leases are recovered without counting an attempt
//! - Retry backoff doubles from the base delay until attempts run out
//! - Terminal jobs are never claimed again
//! - The evidence gate blocks before any synthesis call
//! - Partial expansion success commits what finished in time
//! - Insufficient evidence and degraded output stay distinct

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use opforge_ai::{
        DegradedReason, GateCheck, RunQuality, SynthesisMode, DEFAULT_SIMILARITY_THRESHOLD,
    };
    use opforge_core::{Clock, JobId, ManualClock, ResultRef, TargetId, WorkerId};
    use serde_json::json;
    use tokio::sync::Barrier;

    use crate::ai::testing::{healthy_records, record, Reply, ScriptedSynthesis};
    use crate::ai::{
        InMemoryEvidenceSource, InMemoryResultSink, NoProgress, PipelineRunner, RunOutcome,
        SynthesisError,
    };
    use crate::config::{PipelineConfig, QueueConfig};
    use crate::jobs::{FailDisposition, InMemoryLeaseStore, JobParams, JobQueue, JobStatus};
    use crate::workers::{JobWorker, RunMode, ShutdownSignal, WorkerConfig};

    type Queue = JobQueue<Arc<InMemoryLeaseStore>>;

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    fn setup() -> (Arc<Queue>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(JobQueue::new(
            InMemoryLeaseStore::arc(),
            clock.clone(),
            QueueConfig::default(),
        ));
        (queue, clock)
    }

    fn runner(
        evidence: Arc<InMemoryEvidenceSource>,
        synthesis: Arc<ScriptedSynthesis>,
        sink: Arc<InMemoryResultSink>,
        now: DateTime<Utc>,
        config: PipelineConfig,
    ) -> PipelineRunner {
        PipelineRunner::new(evidence, synthesis, sink, Arc::new(ManualClock::new(now)))
            .with_config(config)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_claimers_never_share_a_job() {
        const CLAIMERS: usize = 12;

        for round in 0..10 {
            let (queue, _) = setup();
            let job_id = queue.enqueue(JobParams::new()).await.unwrap();
            let barrier = Arc::new(Barrier::new(CLAIMERS));

            let handles: Vec<_> = (0..CLAIMERS)
                .map(|i| {
                    let queue = queue.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        let me = worker(&format!("claimer-{i}"));
                        barrier.wait().await;
                        queue.claim_next(&me).await.unwrap().map(|job| (me, job))
                    })
                })
                .collect();

            let mut winners = Vec::new();
            for handle in handles {
                if let Some(win) = handle.await.unwrap() {
                    winners.push(win);
                }
            }

            assert_eq!(winners.len(), 1, "round {round}: {} winners", winners.len());
            let (winner, claimed) = &winners[0];
            assert_eq!(claimed.id, job_id);
            assert_eq!(claimed.attempts, 1);

            let stored = queue.status(job_id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Running);
            assert_eq!(stored.attempts, 1);
            assert_eq!(stored.locked_by.as_ref(), Some(winner));
        }
    }

    #[tokio::test]
    async fn stale_release_recovers_orphans_without_counting_an_attempt() {
        let (queue, clock) = setup();
        let job_id = queue.enqueue(JobParams::new()).await.unwrap();
        let crashed = worker("crashed");
        let rescuer = worker("rescuer");

        queue.claim_next(&crashed).await.unwrap().unwrap();
        // Not stale yet.
        clock.advance(chrono::Duration::minutes(9));
        assert_eq!(queue.release_stale_jobs().await.unwrap(), 0);

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(queue.release_stale_jobs().await.unwrap(), 1);

        let released = queue.status(job_id).await.unwrap().unwrap();
        assert_eq!(released.status, JobStatus::Pending);
        assert_eq!(released.attempts, 1);
        assert!(released.lease().is_none());
        assert!(released.is_claimable(clock.now()));

        let reclaimed = queue.claim_next(&rescuer).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job_id);
        assert_eq!(reclaimed.attempts, 2);

        // The crashed worker's late completion is a no-op.
        let applied = queue
            .complete_job(job_id, &crashed, ResultRef::new(), json!({}))
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            queue.status(job_id).await.unwrap().unwrap().locked_by,
            Some(rescuer)
        );
    }

    #[tokio::test]
    async fn retries_back_off_then_succeed_on_the_last_attempt() {
        let (queue, clock) = setup();
        let w = worker("w-1");
        let job_id = queue
            .enqueue_with_attempts(JobParams::new(), 3)
            .await
            .unwrap();

        let mut previous_available_at = queue.status(job_id).await.unwrap().unwrap().available_at;
        for (attempt, expected_delay) in [(1u32, 60i64), (2, 120)] {
            let job = queue.claim_next(&w).await.unwrap().unwrap();
            assert_eq!(job.attempts, attempt);

            let failed_at = clock.now();
            let disposition = queue
                .fail_job(job_id, &w, "provider timed out", None)
                .await
                .unwrap();
            let FailDisposition::Retrying {
                attempts,
                available_at,
            } = disposition
            else {
                panic!("expected retry, got {disposition:?}");
            };
            assert_eq!(attempts, attempt);
            assert_eq!(available_at, failed_at + chrono::Duration::seconds(expected_delay));
            assert!(available_at > previous_available_at);
            previous_available_at = available_at;

            // Not due before the backoff elapses.
            assert!(queue.claim_next(&w).await.unwrap().is_none());
            clock.advance(chrono::Duration::seconds(expected_delay));
        }

        let job = queue.claim_next(&w).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert!(queue
            .complete_job(job_id, &w, ResultRef::new(), json!({ "kind": "committed" }))
            .await
            .unwrap());

        let done = queue.status(job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 3);
        assert!(done.finished_at.is_some());
        assert_eq!(done.last_error.as_deref(), Some("provider timed out"));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_terminally() {
        let (queue, clock) = setup();
        let w = worker("w-1");
        let job_id = queue
            .enqueue_with_attempts(JobParams::new(), 2)
            .await
            .unwrap();

        queue.claim_next(&w).await.unwrap().unwrap();
        queue.fail_job(job_id, &w, "boom", None).await.unwrap();
        clock.advance(chrono::Duration::minutes(1));
        queue.claim_next(&w).await.unwrap().unwrap();

        let disposition = queue
            .fail_job(job_id, &w, "boom again", Some(json!({ "category": "unknown" })))
            .await
            .unwrap();
        assert_eq!(disposition, FailDisposition::Exhausted { attempts: 2 });

        let failed = queue.status(job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert_eq!(failed.outcome, Some(json!({ "category": "unknown" })));
    }

    #[tokio::test]
    async fn terminal_jobs_are_never_claimed() {
        let (queue, clock) = setup();
        let w = worker("w-1");
        let succeeded = queue.enqueue(JobParams::new()).await.unwrap();
        let insufficient = queue.enqueue(JobParams::new()).await.unwrap();

        queue.claim_next(&w).await.unwrap().unwrap();
        queue.claim_next(&w).await.unwrap().unwrap();
        assert!(queue
            .complete_job(succeeded, &w, ResultRef::new(), json!({}))
            .await
            .unwrap());
        assert!(queue
            .fail_insufficient_evidence(insufficient, &w, "insufficient evidence", json!({}))
            .await
            .unwrap());

        clock.advance(chrono::Duration::days(1));
        assert_eq!(queue.release_stale_jobs().await.unwrap(), 0);
        assert!(queue.claim_next(&worker("w-2")).await.unwrap().is_none());

        // Late writes against terminal rows change nothing.
        assert_eq!(
            queue.fail_job(succeeded, &w, "late", None).await.unwrap(),
            FailDisposition::NotHeld
        );
        assert!(!queue.extend_lock(insufficient, &w).await.unwrap());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.insufficient_evidence, 1);
        assert_eq!(stats.pending + stats.running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_blocks_on_a_single_check_without_synthesis_calls() {
        let now = Utc::now();
        let evidence = Arc::new(InMemoryEvidenceSource::new());
        let synthesis = Arc::new(ScriptedSynthesis::new());
        let sink = InMemoryResultSink::arc();
        let target = TargetId::new();

        // Plenty of fresh, distinct posts, all from one author.
        let records = healthy_records(12, now)
            .into_iter()
            .map(|mut r| {
                r.author = "same-person".into();
                r
            })
            .collect();
        evidence.insert(target, records);

        let runner = runner(
            evidence,
            synthesis.clone(),
            sink.clone(),
            now,
            PipelineConfig::default(),
        );
        let outcome = runner
            .run(
                JobId::new(),
                &JobParams::synthesis(target, SynthesisMode::Standard),
                &NoProgress,
            )
            .await;

        let RunOutcome::InsufficientEvidence(report) = outcome else {
            panic!("expected gate block, got {outcome:?}");
        };
        assert!(report.quality_passed);
        assert!(!report.usability_passed);
        let failed: Vec<_> = report.failed_checks().copied().collect();
        assert_eq!(failed, vec![GateCheck::DistinctAuthors]);
        assert!(report.summary().contains("required 3, actual 1"));

        assert_eq!(synthesis.fast_calls(), 0);
        assert_eq!(synthesis.heavy_calls(), 0);
        assert!(sink.all().is_empty());
    }

    /// Six kernels (one per three records): expansions for kernels 0, 3 and 6
    /// answer at once, 9 and 12 hang past the deadline, 15 errors.
    fn partial_success_synthesis() -> ScriptedSynthesis {
        ScriptedSynthesis::new().with_expansion(|n| match n {
            0 | 3 | 6 => Reply::Text(crate::ai::testing::expansion_reply(n)),
            9 | 12 => Reply::Hang,
            _ => Reply::Fail(SynthesisError::Provider {
                status: 500,
                message: "overloaded".into(),
            }),
        })
    }

    fn partial_success_config(stop_at_min_ready: bool, target_ready_items: usize) -> PipelineConfig {
        PipelineConfig {
            max_concurrency: 6,
            min_expansions: 3,
            max_expansions: 8,
            min_ready_items: 3,
            target_ready_items,
            stop_at_min_ready,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            ..PipelineConfig::default()
        }
    }

    fn committed_titles(outcome: RunOutcome) -> (Vec<String>, opforge_ai::PipelineResult) {
        let RunOutcome::Committed { result, .. } = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        let mut titles: Vec<String> = result.items.iter().map(|c| c.title.clone()).collect();
        titles.sort();
        (titles, result)
    }

    #[tokio::test(start_paused = true)]
    async fn partial_success_commits_exactly_the_finished_expansions() {
        let now = Utc::now();
        let evidence = Arc::new(InMemoryEvidenceSource::new());
        let synthesis = Arc::new(partial_success_synthesis());
        let sink = InMemoryResultSink::arc();
        let target = TargetId::new();
        evidence.insert(target, healthy_records(18, now));

        let runner = runner(
            evidence,
            synthesis.clone(),
            sink.clone(),
            now,
            partial_success_config(true, 3),
        );
        let started = tokio::time::Instant::now();
        let job_id = JobId::new();
        let outcome = runner
            .run(job_id, &JobParams::synthesis(target, SynthesisMode::Standard), &NoProgress)
            .await;

        let (titles, result) = committed_titles(outcome);
        assert_eq!(
            titles,
            vec!["Expanded brief 0", "Expanded brief 3", "Expanded brief 6"]
        );
        assert_eq!(synthesis.fast_calls(), 6);
        assert_eq!(result.stats.kernels.succeeded, 6);
        assert_eq!(result.stats.expansions.attempted, 6);
        assert_eq!(result.stats.expansions.succeeded, 3);
        assert!(result.stopped_early);
        assert_eq!(result.quality, RunQuality::Complete);
        // Nobody waited on the hanging calls.
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(sink.for_job(job_id), Some(result));
    }

    #[tokio::test(start_paused = true)]
    async fn full_wait_classifies_timeouts_and_errors() {
        let now = Utc::now();
        let evidence = Arc::new(InMemoryEvidenceSource::new());
        let synthesis = Arc::new(partial_success_synthesis());
        let sink = InMemoryResultSink::arc();
        let target = TargetId::new();
        evidence.insert(target, healthy_records(18, now));

        let runner = runner(evidence, synthesis, sink, now, partial_success_config(false, 5));
        let outcome = runner
            .run(JobId::new(), &JobParams::synthesis(target, SynthesisMode::Standard), &NoProgress)
            .await;

        let (titles, result) = committed_titles(outcome);
        assert_eq!(titles.len(), 3);
        assert!(!result.stopped_early);
        assert_eq!(result.stats.expansions.succeeded, 3);
        assert_eq!(result.stats.expansions.timed_out, 2);
        assert_eq!(result.stats.expansions.failed, 1);
        assert_eq!(result.stats.expansions.abandoned, 0);
        assert_eq!(
            result.quality,
            RunQuality::Degraded {
                reason: DegradedReason::BelowTarget { ready: 3, target: 5 }
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_evidence_and_degraded_output_stay_distinct() {
        let (queue, clock) = setup();
        let evidence = Arc::new(InMemoryEvidenceSource::new());
        // Every kernel call errors, so a gated-through run commits nothing.
        let synthesis = Arc::new(ScriptedSynthesis::new().with_kernel(|_| {
            Reply::Fail(SynthesisError::Transport("connection reset".into()))
        }));
        let sink = InMemoryResultSink::arc();

        let thin = TargetId::new();
        evidence.insert(thin, (0..3).map(|n| record(n, clock.now())).collect());
        let healthy = TargetId::new();
        evidence.insert(healthy, healthy_records(12, clock.now()));

        let blocked_id = queue
            .enqueue(JobParams::synthesis(thin, SynthesisMode::Standard))
            .await
            .unwrap();
        let degraded_id = queue
            .enqueue(JobParams::synthesis(healthy, SynthesisMode::Standard))
            .await
            .unwrap();

        let runner = Arc::new(runner(
            evidence,
            synthesis.clone(),
            sink.clone(),
            clock.now(),
            PipelineConfig::default(),
        ));
        let job_worker = JobWorker::new(
            queue.clone(),
            runner,
            WorkerConfig::new(worker("w-1"))
                .with_run_mode(RunMode::MaxJobs(2))
                .with_poll_interval(Duration::from_millis(50)),
        );
        let stats = job_worker.run(&ShutdownSignal::new()).await;

        assert_eq!(stats.jobs_processed, 2);
        assert_eq!(stats.jobs_insufficient_evidence, 1);
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.jobs_degraded, 1);

        let blocked = queue.status(blocked_id).await.unwrap().unwrap();
        assert_eq!(blocked.status, JobStatus::InsufficientEvidence);
        assert!(blocked.result_ref.is_none());
        let outcome = blocked.outcome.unwrap();
        assert_eq!(outcome["kind"], "insufficient_evidence");
        assert!(blocked.last_error.unwrap().starts_with("insufficient evidence"));

        let degraded = queue.status(degraded_id).await.unwrap().unwrap();
        assert_eq!(degraded.status, JobStatus::Succeeded);
        assert!(degraded.result_ref.is_some());
        let outcome = degraded.outcome.unwrap();
        assert_eq!(outcome["kind"], "committed");
        assert_eq!(outcome["items"], 0);

        let committed = sink.for_job(degraded_id).unwrap();
        assert!(committed.items.is_empty());
        assert!(matches!(
            committed.quality,
            RunQuality::Degraded {
                reason: DegradedReason::BelowMinimum { ready: 0, minimum: 3 }
            }
        ));
        assert!(sink.for_job(blocked_id).is_none());
        // Only the healthy target reached synthesis.
        assert_eq!(synthesis.fast_calls(), 4);
        assert_eq!(synthesis.heavy_calls(), 0);
    }
}
