mod common;

use chrono::Duration;
use common::rig;

use skyflow::coordinator::Coordinator;
use skyflow::store::{JobStatus, StateStore, TaskOutcome, TaskRole, TaskStatus};

/// Seed scenario: a worker leases a slice of the job and dies. After lease
/// expiry another worker reclaims the orphans and the job still completes
/// with every batch accounted for.
#[tokio::test]
async fn worker_crash_mid_job_recovers_after_lease_expiry() {
    let rig = rig();
    let lines: Vec<String> = (0..10).map(|i| format!("u{i}")).collect();
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
    let path = rig.write_input("crash.txt", &refs);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;

    // Worker A leases three tasks and crashes without completing any.
    let leased = rig
        .ctx
        .queue
        .dequeue("worker-a", 3, Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(leased.len(), 3);

    // The lease runs out while the rest of the fleet keeps working.
    rig.clock.advance(Duration::seconds(31));

    let coordinator = rig.coordinator("coord-1");
    let pool = rig.pool("worker-b");
    let status = rig.drive(&coordinator, &pool, job_id).await;
    assert_eq!(status, JobStatus::Completed);

    let job = rig.ctx.store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.orphans_reclaimed >= 1, "orphans were reclaimed");

    let counts = rig.ctx.store.count_tasks(job_id).await.unwrap();
    assert_eq!(counts.total(TaskRole::Worker, TaskStatus::Success), 10);

    let aggregate = rig.final_aggregate(job_id, "txt").await.unwrap();
    assert_eq!(aggregate.lines().count(), 10);
}

/// Seed scenario: cancellation stops the job where it stands. Completed work
/// keeps its SUCCESS status, queued work is cancelled, nothing aggregates.
#[tokio::test]
async fn cancellation_stops_emission_and_skips_aggregation() {
    let rig = rig();
    let lines: Vec<String> = (0..10).map(|i| format!("u{i}")).collect();
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
    let path = rig.write_input("cancel.txt", &refs);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;

    // Three batches finish before anyone pulls the plug.
    let leased = rig
        .ctx
        .queue
        .dequeue("worker-a", 3, Duration::seconds(30))
        .await
        .unwrap();
    for task in &leased {
        rig.ctx
            .store
            .complete_task(
                task.id,
                "worker-a",
                &TaskOutcome::Success {
                    output_ref: format!("early-{}", task.id),
                },
            )
            .await
            .unwrap();
    }

    let cancelled = Coordinator::cancel(&rig.ctx, job_id).await.unwrap();
    assert!(cancelled);

    // Whatever ticks and drains happen afterwards change nothing.
    let coordinator = rig.coordinator("coord-1");
    let pool = rig.pool("worker-b");
    coordinator.tick_all().await;
    pool.run_until_drained().await.unwrap();
    coordinator.tick_all().await;

    assert_eq!(rig.job_status(job_id).await, JobStatus::Cancelled);

    let counts = rig.ctx.store.count_tasks(job_id).await.unwrap();
    assert_eq!(counts.total(TaskRole::Worker, TaskStatus::Success), 3);
    assert_eq!(counts.total(TaskRole::Worker, TaskStatus::Cancelled), 7);
    assert_eq!(counts.total_role(TaskRole::Aggregator), 0, "no aggregation");
    assert!(rig.final_aggregate(job_id, "txt").await.is_none());

    // Cancellation is sticky: a second cancel is a no-op.
    assert!(!Coordinator::cancel(&rig.ctx, job_id).await.unwrap());
}

/// A task leased at cancellation time is nacked terminally instead of
/// committing its work.
#[tokio::test]
async fn leased_task_is_cut_short_by_cancellation() {
    let rig = rig();
    let path = rig.write_input("cut.txt", &["a", "b"]);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;

    // Lease both tasks, then cancel while they are in flight.
    let leased = rig
        .ctx
        .queue
        .dequeue("worker-a", 2, Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(leased.len(), 2);
    Coordinator::cancel(&rig.ctx, job_id).await.unwrap();

    // The worker notices on its next heartbeat.
    let hb = rig
        .ctx
        .store
        .heartbeat(leased[0].id, "worker-a", Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(hb, skyflow::store::HeartbeatStatus::Cancelled);
}

/// Seed scenario: the coordinator dies and a new one takes over mid-job.
/// No duplicate tasks appear, no batch is lost, and the final aggregate
/// matches the single-coordinator run.
#[tokio::test]
async fn coordinator_restart_resumes_without_duplicates() {
    let rig = rig();
    let path = rig.write_input("restart.txt", &["a", "b", "c"]);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;

    // First coordinator makes partial progress, then disappears.
    let first = rig.coordinator("coord-1");
    let pool = rig.pool("worker-1");
    first.tick_all().await;
    let some = rig
        .ctx
        .queue
        .dequeue("worker-1", 1, Duration::seconds(30))
        .await
        .unwrap();
    // A real artifact, so aggregation can verify it later.
    let written = rig
        .ctx
        .artifacts
        .write_task_output(job_id, some[0].id, "txt", b"a\n")
        .await
        .unwrap();
    rig.ctx
        .queue
        .ack(some[0].id, "worker-1", written.uri)
        .await
        .unwrap();
    drop(first);

    // Its job lock expires; a replacement reconstructs from the store.
    rig.clock.advance(Duration::seconds(60));
    let second = rig.coordinator("coord-2");
    let status = rig.drive(&second, &pool, job_id).await;
    assert_eq!(status, JobStatus::Completed);

    // Exactly one worker task per batch, one aggregator task, no extras.
    let tasks = rig.ctx.store.list_tasks(job_id, None).await.unwrap();
    let workers: Vec<_> = tasks.iter().filter(|t| t.role == TaskRole::Worker).collect();
    assert_eq!(workers.len(), 3, "no duplicate tasks after restart");
    let batches = rig.ctx.store.list_batches(job_id).await.unwrap();
    assert_eq!(batches.len(), 3, "no lost batches");
    assert_eq!(
        tasks
            .iter()
            .filter(|t| t.role == TaskRole::Aggregator)
            .count(),
        1
    );

    let aggregate = rig.final_aggregate(job_id, "txt").await.unwrap();
    assert_eq!(aggregate, "a\nb\nc\n");
}

/// Restarting the worker fleet mid-run preserves the store invariants and
/// the job still converges (a fresh pool instance simulates the restart).
#[tokio::test]
async fn worker_restart_preserves_invariants() {
    let rig = rig();
    let lines: Vec<String> = (0..6).map(|i| format!("u{i}")).collect();
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
    let path = rig.write_input("fleet.txt", &refs);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;

    let coordinator = rig.coordinator("coord-1");

    // First fleet leases some work and is killed (leases lapse unfinished).
    let _abandoned = rig
        .ctx
        .queue
        .dequeue("fleet-1", 2, Duration::seconds(30))
        .await
        .unwrap();
    rig.clock.advance(Duration::seconds(31));
    rig.ctx.store.expire_leases().await.unwrap();

    // Second fleet finishes the job.
    let pool = rig.pool("fleet-2");
    let status = rig.drive(&coordinator, &pool, job_id).await;
    assert_eq!(status, JobStatus::Completed);

    // Invariants after quiescence: one live attempt max (zero now), terminal
    // statuses only, accounting adds up.
    let tasks = rig.ctx.store.list_tasks(job_id, None).await.unwrap();
    assert!(tasks.iter().all(|t| t.status.is_terminal()));
    let outcomes = rig.batch_outcomes(job_id).await;
    assert!(outcomes.iter().all(|(_, s)| *s == TaskStatus::Success));
}
