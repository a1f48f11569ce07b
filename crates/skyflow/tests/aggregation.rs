mod common;

use common::rig;

use skyflow::aggregate::DEFAULT_FAN_IN;
use skyflow::artifact::ArtifactStore;
use skyflow::store::{JobStatus, StateStore, TaskRole, TaskStatus};

/// 25 batches with fan-in 10 forces a real hierarchy: 3 level-1 merges,
/// then the final. Record counts are conserved and order follows batch seq.
#[tokio::test]
async fn hierarchical_merge_conserves_records_and_order() {
    let rig = rig();
    let lines: Vec<String> = (0..25).map(|i| format!("row-{i:02}")).collect();
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
    let path = rig.write_input("many.txt", &refs);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;

    let coordinator = rig.coordinator("coord-1");
    let pool = rig.pool("worker-1");
    let status = rig.drive(&coordinator, &pool, job_id).await;
    assert_eq!(status, JobStatus::Completed);

    let aggregate = rig.final_aggregate(job_id, "txt").await.unwrap();
    let got: Vec<&str> = aggregate.lines().collect();
    assert_eq!(got, refs, "total order by batch seq");

    // Level-1 intermediates exist, each with its own marker.
    let expected_groups = 25usize.div_ceil(DEFAULT_FAN_IN);
    for k in 0..expected_groups {
        let level_path = rig.ctx.artifacts.aggregation_level_path(job_id, 1, k, "txt");
        assert!(level_path.exists(), "level artifact {k} missing");
        assert!(
            ArtifactStore::done_path(&level_path).exists(),
            "level marker {k} missing"
        );
    }

    let final_path = rig.ctx.artifacts.final_path(job_id, "txt");
    let marker = rig
        .ctx
        .artifacts
        .verify(&final_path.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(marker.record_count, 25);
}

/// An artifact without its done marker is invisible to aggregation: it is
/// skipped (and logged), and the final count equals the sum of the marked
/// inputs only.
#[tokio::test]
async fn unmarked_artifacts_are_invisible_to_aggregation() {
    let rig = rig();
    let path = rig.write_input("three.txt", &["a", "b", "c"]);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;

    let coordinator = rig.coordinator("coord-1");
    let pool = rig.pool("worker-1");

    // Run the workers to success, but stop before aggregation executes.
    coordinator.tick_all().await;
    pool.run_until_drained().await.unwrap();

    // Drop one output's marker behind the runtime's back.
    let successes = rig
        .ctx
        .store
        .list_tasks(job_id, Some(TaskStatus::Success))
        .await
        .unwrap();
    assert_eq!(successes.len(), 3);
    let victim = successes
        .iter()
        .find(|t| t.role == TaskRole::Worker)
        .unwrap();
    let victim_uri = victim.output_ref.clone().unwrap();
    let marker_path = ArtifactStore::done_path(std::path::Path::new(&victim_uri));
    std::fs::remove_file(&marker_path).unwrap();

    let status = rig.drive(&coordinator, &pool, job_id).await;
    assert_eq!(status, JobStatus::Completed);

    let final_path = rig.ctx.artifacts.final_path(job_id, "txt");
    let marker = rig
        .ctx
        .artifacts
        .verify(&final_path.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(marker.record_count, 2, "only marked inputs count");
}

/// The output file always lands before its marker; a marker never describes
/// a missing or different artifact.
#[tokio::test]
async fn markers_are_written_after_their_artifacts() {
    let rig = rig();
    let path = rig.write_input("pair.txt", &["x", "y"]);
    let job_id = rig.submit(rig.spec("echo-1", &path, 1)).await;

    let coordinator = rig.coordinator("coord-1");
    let pool = rig.pool("worker-1");
    let status = rig.drive(&coordinator, &pool, job_id).await;
    assert_eq!(status, JobStatus::Completed);

    let successes = rig
        .ctx
        .store
        .list_tasks(job_id, Some(TaskStatus::Success))
        .await
        .unwrap();
    for task in successes {
        let Some(uri) = task.output_ref else { continue };
        let marker = rig.ctx.artifacts.verify(&uri).await.expect("marker + checksum");
        assert_eq!(marker.output_uri, uri);
        let content = std::fs::read(&uri).unwrap();
        assert_eq!(marker.checksum, ArtifactStore::checksum(&content));
        assert_eq!(marker.record_count, ArtifactStore::count_records(&content));
    }
}

/// Batches finishing in different phases still aggregate in batch order:
/// batch 0 settles two phases after the rest, yet the aggregate stays
/// seq-ordered (here batch 0 drops out terminally, the rest keep order).
#[tokio::test]
async fn completion_order_does_not_leak_into_the_aggregate() {
    let rig = rig();
    let path = rig.write_input("ooo.txt", &["first", "second", "third", "fourth"]);
    let spec = rig.spec_with(
        "fail-seq",
        &path,
        1,
        serde_json::json!({ "fail_seq": 0, "fail_mode": "retryable" }),
    );
    let job_id = rig.submit(spec).await;

    let coordinator = rig.coordinator("coord-1");
    let pool = rig.pool("worker-1");
    let status = rig.drive(&coordinator, &pool, job_id).await;

    assert_eq!(status, JobStatus::Completed);
    let aggregate = rig.final_aggregate(job_id, "txt").await.unwrap();
    assert_eq!(aggregate, "second\nthird\nfourth\n");
}
