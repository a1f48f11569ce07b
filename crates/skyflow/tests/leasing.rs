mod common;

use chrono::Duration;
use common::rig;
use std::collections::HashSet;
use uuid::Uuid;

use skyflow::store::{
    StateStore, StoreError, Task, TaskError, TaskOutcome, TaskRole, TaskStatus,
};

async fn seed_job_with_tasks(rig: &common::TestRig, n: usize) -> (Uuid, Vec<Task>) {
    let input: Vec<String> = (0..n).map(|i| format!("record-{i}")).collect();
    let input_refs: Vec<&str> = input.iter().map(|s| s.as_str()).collect();
    let path = rig.write_input("input.txt", &input_refs);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;
    let tasks = rig.ctx.store.list_tasks(job_id, None).await.unwrap();
    assert_eq!(tasks.len(), n);
    (job_id, tasks)
}

#[tokio::test]
async fn two_workers_never_lease_the_same_task() {
    let rig = rig();
    let (_, _) = seed_job_with_tasks(&rig, 5).await;

    let lease = Duration::seconds(30);
    let a = rig.ctx.queue.dequeue("worker-a", 3, lease).await.unwrap();
    let b = rig.ctx.queue.dequeue("worker-b", 3, lease).await.unwrap();

    assert_eq!(a.len(), 3);
    assert_eq!(b.len(), 2);
    let ids_a: HashSet<Uuid> = a.iter().map(|t| t.id).collect();
    let ids_b: HashSet<Uuid> = b.iter().map(|t| t.id).collect();
    assert!(ids_a.is_disjoint(&ids_b), "same task leased twice");
    assert!(a.iter().all(|t| t.status == TaskStatus::Leased));
    assert!(a.iter().all(|t| t.lease_owner.as_deref() == Some("worker-a")));
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_old_owner_commit_fails() {
    let rig = rig();
    let (job_id, _) = seed_job_with_tasks(&rig, 1).await;

    let lease = Duration::seconds(30);
    let leased = rig.ctx.queue.dequeue("worker-a", 1, lease).await.unwrap();
    let task = &leased[0];

    // Worker A dies; the lease runs out.
    rig.clock.advance(Duration::seconds(31));

    let reclaimed = rig.ctx.queue.dequeue("worker-b", 1, lease).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, task.id);
    assert_eq!(reclaimed[0].lease_owner.as_deref(), Some("worker-b"));

    let job = rig.ctx.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.orphans_reclaimed, 1);

    // The previous owner's commit must fail with an ownership mismatch.
    let err = rig
        .ctx
        .store
        .complete_task(
            task.id,
            "worker-a",
            &TaskOutcome::Success {
                output_ref: "stale".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));

    // The winner's commit sticks.
    rig.ctx
        .store
        .complete_task(
            task.id,
            "worker-b",
            &TaskOutcome::Success {
                output_ref: "won".to_string(),
            },
        )
        .await
        .unwrap();
    let current = rig.ctx.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Success);
    assert_eq!(current.output_ref.as_deref(), Some("won"));
}

#[tokio::test]
async fn dequeue_orders_by_priority_then_creation() {
    let rig = rig();
    let (job_id, _) = seed_job_with_tasks(&rig, 2).await;

    // A later, higher-priority task (a retry) must overtake the initial ones.
    let now = rig.ctx.clock.now();
    let batches = rig.ctx.store.list_batches(job_id).await.unwrap();
    let retry = Task::new(
        job_id,
        batches[0].id,
        TaskRole::Worker,
        "retry_1",
        2,
        1,
        now,
    );
    // Clear the way: terminalize both initial attempts.
    let leased = rig
        .ctx
        .queue
        .dequeue("setup", 2, Duration::seconds(30))
        .await
        .unwrap();
    for t in &leased {
        rig.ctx
            .queue
            .nack(
                t.id,
                "setup",
                TaskError {
                    kind: "TIMEOUT".to_string(),
                    message: "drill".to_string(),
                    retries_so_far: 0,
                },
                true,
            )
            .await
            .unwrap();
    }
    assert_eq!(leased.len(), 2);

    // Re-enqueue one plain retry for batch 1 and the priority retry above.
    let plain = Task::new(
        job_id,
        batches[1].id,
        TaskRole::Worker,
        "retry_1",
        2,
        0,
        now,
    );
    rig.ctx.queue.enqueue(&[plain.clone()]).await.unwrap();
    rig.ctx.queue.enqueue(&[retry.clone()]).await.unwrap();

    let got = rig
        .ctx
        .queue
        .dequeue("worker-a", 1, Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(got[0].id, retry.id, "higher priority must pop first");
}

#[tokio::test]
async fn delayed_task_is_not_leased_before_run_at() {
    let rig = rig();
    let (job_id, _) = seed_job_with_tasks(&rig, 1).await;
    let batches = rig.ctx.store.list_batches(job_id).await.unwrap();

    // Terminalize the initial attempt, then enqueue a delayed retry.
    let leased = rig
        .ctx
        .queue
        .dequeue("setup", 1, Duration::seconds(30))
        .await
        .unwrap();
    rig.ctx
        .queue
        .nack(
            leased[0].id,
            "setup",
            TaskError {
                kind: "TIMEOUT".to_string(),
                message: "drill".to_string(),
                retries_so_far: 0,
            },
            true,
        )
        .await
        .unwrap();

    let run_at = rig.ctx.clock.now() + Duration::seconds(10);
    let delayed = Task::new(
        job_id,
        batches[0].id,
        TaskRole::Worker,
        "retry_1",
        2,
        1,
        run_at,
    );
    rig.ctx.queue.enqueue(&[delayed.clone()]).await.unwrap();

    let none = rig
        .ctx
        .queue
        .dequeue("worker-a", 1, Duration::seconds(30))
        .await
        .unwrap();
    assert!(none.is_empty(), "not runnable before run_at");

    rig.clock.advance(Duration::seconds(11));
    let got = rig
        .ctx
        .queue
        .dequeue("worker-a", 1, Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(got[0].id, delayed.id);
}

#[tokio::test]
async fn expire_leases_reaps_only_expired() {
    let rig = rig();
    let (_, _) = seed_job_with_tasks(&rig, 2).await;

    let a = rig
        .ctx
        .queue
        .dequeue("worker-a", 1, Duration::seconds(10))
        .await
        .unwrap();
    let b = rig
        .ctx
        .queue
        .dequeue("worker-b", 1, Duration::seconds(120))
        .await
        .unwrap();

    rig.clock.advance(Duration::seconds(11));
    let expired = rig.ctx.store.expire_leases().await.unwrap();
    assert_eq!(expired, 1);

    let task_a = rig.ctx.store.get_task(a[0].id).await.unwrap().unwrap();
    assert_eq!(task_a.status, TaskStatus::Pending);
    assert_eq!(task_a.lease_owner, None);

    let task_b = rig.ctx.store.get_task(b[0].id).await.unwrap().unwrap();
    assert_eq!(task_b.status, TaskStatus::Leased);
    assert_eq!(task_b.lease_owner.as_deref(), Some("worker-b"));
}

#[tokio::test]
async fn heartbeat_extends_lease_and_reports_loss() {
    let rig = rig();
    let (_, _) = seed_job_with_tasks(&rig, 1).await;

    let leased = rig
        .ctx
        .queue
        .dequeue("worker-a", 1, Duration::seconds(10))
        .await
        .unwrap();
    let task_id = leased[0].id;

    rig.clock.advance(Duration::seconds(8));
    let hb = rig
        .ctx
        .store
        .heartbeat(task_id, "worker-a", Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(hb, skyflow::store::HeartbeatStatus::Ok);

    // The extension keeps the task owned past the original expiry.
    rig.clock.advance(Duration::seconds(8));
    let none = rig
        .ctx
        .queue
        .dequeue("worker-b", 1, Duration::seconds(10))
        .await
        .unwrap();
    assert!(none.is_empty());

    // A stranger's heartbeat is Lost, not an extension.
    let hb = rig
        .ctx
        .store
        .heartbeat(task_id, "worker-b", Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(hb, skyflow::store::HeartbeatStatus::Lost);
}

#[tokio::test]
async fn complete_task_is_idempotent_for_the_same_outcome() {
    let rig = rig();
    let (_, _) = seed_job_with_tasks(&rig, 1).await;

    let leased = rig
        .ctx
        .queue
        .dequeue("worker-a", 1, Duration::seconds(30))
        .await
        .unwrap();
    let task_id = leased[0].id;
    let outcome = TaskOutcome::Success {
        output_ref: "out".to_string(),
    };

    rig.ctx
        .store
        .complete_task(task_id, "worker-a", &outcome)
        .await
        .unwrap();
    // Retried write after a transient outage: a no-op, not an error.
    rig.ctx
        .store
        .complete_task(task_id, "worker-a", &outcome)
        .await
        .unwrap();

    // A different outcome on a terminal task is a conflict.
    let err = rig
        .ctx
        .store
        .complete_task(
            task_id,
            "worker-a",
            &TaskOutcome::Terminal {
                error: TaskError {
                    kind: "UNKNOWN".to_string(),
                    message: "flip".to_string(),
                    retries_so_far: 0,
                },
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let task = rig.ctx.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success, "terminal status immutable");
}

#[tokio::test]
async fn duplicate_enqueue_creates_exactly_one_task() {
    let rig = rig();
    let (job_id, tasks) = seed_job_with_tasks(&rig, 1).await;

    let again = Task::new(
        job_id,
        tasks[0].batch_id,
        TaskRole::Worker,
        "initial",
        1,
        0,
        rig.ctx.clock.now(),
    );
    let created = rig.ctx.queue.enqueue(&[again]).await.unwrap();
    assert_eq!(created, 0, "same (job, batch, attempt) must not duplicate");

    let all = rig.ctx.store.list_tasks(job_id, None).await.unwrap();
    assert_eq!(all.len(), 1);
}
