use std::sync::Arc;
use std::time::Instant;

use crate::context::RuntimeContext;
use crate::handler::{Handler, HandlerError, TaskCtx};
use crate::metrics::RuntimeMetrics;
use crate::retry::ErrorKind;
use crate::store::{StateStore, TaskRole, TaskStatus};

pub const DEFAULT_FAN_IN: usize = 10;

/// Hierarchical merge of the job's successful worker outputs into
/// `aggregation/final.<ext>`.
///
/// Inputs are the done-marked, checksum-valid artifacts of SUCCESS tasks,
/// ordered by batch sequence; anything unmarked or corrupt is skipped and
/// logged. Each level merges groups of `DEFAULT_FAN_IN`, writes the level
/// artifact, then its marker. The final record count must equal the sum of
/// the included inputs.
pub async fn run_aggregation(
    ctx: &RuntimeContext,
    task_ctx: &TaskCtx,
    handler: Arc<dyn Handler>,
) -> Result<String, HandlerError> {
    let job_id = task_ctx.task.job_id;
    let task_id = task_ctx.task.id;
    let ext = handler.output_ext();
    let started = Instant::now();

    let successes = ctx
        .store
        .list_tasks(job_id, Some(TaskStatus::Success))
        .await
        .map_err(store_err)?;
    let batches = ctx.store.list_batches(job_id).await.map_err(store_err)?;
    let seq_of = |batch_id| {
        batches
            .iter()
            .find(|b| b.id == batch_id)
            .map(|b| b.seq)
            .unwrap_or(i32::MAX)
    };

    // Collect verified inputs in batch order.
    let mut inputs: Vec<(i32, String, i64)> = Vec::new();
    for task in successes.iter().filter(|t| t.role == TaskRole::Worker) {
        let Some(uri) = task.output_ref.as_deref() else {
            task_ctx
                .logger
                .log(&format!("skipping task {} with no output_ref", task.id))
                .await;
            continue;
        };
        match ctx.artifacts.verify(uri).await {
            Ok(marker) => inputs.push((seq_of(task.batch_id), uri.to_string(), marker.record_count)),
            Err(e) => {
                task_ctx
                    .logger
                    .log(&format!("skipping unmarked artifact {uri}: {e}"))
                    .await;
            }
        }
    }
    if inputs.is_empty() {
        return Err(HandlerError::terminal(
            ErrorKind::HandlerFailure,
            "no done-marked inputs to aggregate",
        ));
    }
    // Total order by batch unless the handler declared an unordered reduce.
    if !handler.unordered_reduce() {
        inputs.sort_by_key(|(seq, _, _)| *seq);
    }
    let expected_total: i64 = inputs.iter().map(|(_, _, n)| n).sum();

    // Merge level by level until one artifact remains.
    let mut current: Vec<String> = inputs.into_iter().map(|(_, uri, _)| uri).collect();
    let mut level = 1u32;
    while current.len() > 1 {
        if task_ctx.checkpoint.is_cancelled() {
            return Err(HandlerError::retryable(ErrorKind::Cancelled, "cancelled"));
        }
        let mut next = Vec::with_capacity(current.len().div_ceil(DEFAULT_FAN_IN));
        for (k, group) in current.chunks(DEFAULT_FAN_IN).enumerate() {
            let content = merge_group(ctx, task_ctx, group, ext).await?;
            let path = ctx.artifacts.aggregation_level_path(job_id, level, k, ext);
            let written = ctx
                .artifacts
                .write_marked(&path, task_id, &content)
                .await
                .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?;
            RuntimeMetrics::inc(&ctx.metrics.aggregation_merges);
            next.push(written.uri);
        }
        current = next;
        level += 1;
    }

    // Write the final artifact from the last survivor and validate the
    // record-count conservation rule.
    let content = merge_group(ctx, task_ctx, &current, ext).await?;
    let final_path = ctx.artifacts.final_path(job_id, ext);
    let written = ctx
        .artifacts
        .write_marked(&final_path, task_id, &content)
        .await
        .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?;

    if written.record_count != expected_total {
        return Err(HandlerError::terminal(
            ErrorKind::HandlerFailure,
            format!(
                "aggregate record count {} != sum of inputs {}",
                written.record_count, expected_total
            ),
        ));
    }

    RuntimeMetrics::add(&ctx.metrics.aggregation_rows, written.record_count);
    RuntimeMetrics::add(
        &ctx.metrics.aggregation_ms,
        started.elapsed().as_millis() as i64,
    );
    task_ctx
        .logger
        .log(&format!(
            "aggregated {} records from {} levels",
            written.record_count, level
        ))
        .await;
    Ok(written.uri)
}

/// Concatenate a group of line-oriented artifacts, validating
/// well-formedness for structured formats before anything is written.
async fn merge_group(
    ctx: &RuntimeContext,
    task_ctx: &TaskCtx,
    group: &[String],
    ext: &str,
) -> Result<Vec<u8>, HandlerError> {
    let mut lines: Vec<String> = Vec::new();
    for uri in group {
        let input_lines = ctx
            .artifacts
            .read_lines(uri)
            .await
            .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?;
        if ext == "jsonl" {
            for (i, line) in input_lines.iter().enumerate() {
                if serde_json::from_str::<serde_json::Value>(line).is_err() {
                    task_ctx
                        .logger
                        .log(&format!("malformed jsonl at {uri}:{}", i + 1))
                        .await;
                    return Err(HandlerError::terminal(
                        ErrorKind::HandlerFailure,
                        format!("malformed jsonl input {uri}"),
                    ));
                }
            }
        }
        lines.extend(input_lines);
    }
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    Ok(content.into_bytes())
}

fn store_err(e: crate::store::StoreError) -> HandlerError {
    HandlerError::retryable(ErrorKind::Unknown, e.to_string())
}
