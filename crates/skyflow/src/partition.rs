use sha2::{Digest, Sha256};
use std::path::Path;

use crate::config::JobSpec;
use crate::context::RuntimeContext;
use crate::handler::{BatchSeed, HandlerError};
use crate::retry::ErrorKind;
use crate::store::Job;

/// Slice the job input into batch seeds, driven by `input.type`:
/// `file` (one batch per input file), `rows` (line chunks of `batch_size`),
/// `key-hash` (stable shard per record key).
pub async fn plan(
    ctx: &RuntimeContext,
    job: &Job,
    spec: &JobSpec,
) -> Result<Vec<BatchSeed>, HandlerError> {
    match spec.input.kind.as_str() {
        "file" => file_per_batch(spec).await,
        "rows" => row_chunked(ctx, job, spec).await,
        "key-hash" => key_hash(ctx, job, spec).await,
        other => Err(HandlerError::terminal(
            ErrorKind::HandlerFailure,
            format!("unknown input.type {other:?}"),
        )),
    }
}

async fn file_per_batch(spec: &JobSpec) -> Result<Vec<BatchSeed>, HandlerError> {
    let dir = Path::new(&spec.input.path);
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| input_error(&spec.input.path, e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| input_error(&spec.input.path, e))?
    {
        let meta = entry
            .metadata()
            .await
            .map_err(|e| input_error(&spec.input.path, e))?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if matches_pattern(&name, spec.input.file_pattern.as_deref()) {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut seeds = Vec::with_capacity(files.len());
    for (seq, path) in files.into_iter().enumerate() {
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| input_error(&path.to_string_lossy(), e))?;
        seeds.push(BatchSeed {
            seq: seq as i32,
            input_ref: path.to_string_lossy().into_owned(),
            record_count: crate::artifact::ArtifactStore::count_records(&content),
        });
    }
    Ok(seeds)
}

async fn row_chunked(
    ctx: &RuntimeContext,
    job: &Job,
    spec: &JobSpec,
) -> Result<Vec<BatchSeed>, HandlerError> {
    let lines = read_input_lines(&spec.input.path).await?;
    let mut seeds = Vec::new();
    for (seq, chunk) in lines.chunks(spec.input.batch_size).enumerate() {
        let input_ref = ctx
            .artifacts
            .write_batch_input(job.id, seq as i32, chunk)
            .await
            .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?;
        seeds.push(BatchSeed {
            seq: seq as i32,
            input_ref,
            record_count: chunk.len() as i64,
        });
    }
    Ok(seeds)
}

async fn key_hash(
    ctx: &RuntimeContext,
    job: &Job,
    spec: &JobSpec,
) -> Result<Vec<BatchSeed>, HandlerError> {
    let lines = read_input_lines(&spec.input.path).await?;
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let shards = lines.len().div_ceil(spec.input.batch_size).max(1);
    let mut buckets: Vec<Vec<String>> = vec![Vec::new(); shards];
    for line in lines {
        let shard = stable_shard(&line, shards);
        buckets[shard].push(line);
    }

    let mut seeds = Vec::new();
    let mut seq = 0i32;
    for bucket in buckets {
        if bucket.is_empty() {
            continue;
        }
        let record_count = bucket.len() as i64;
        let input_ref = ctx
            .artifacts
            .write_batch_input(job.id, seq, &bucket)
            .await
            .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?;
        seeds.push(BatchSeed {
            seq,
            input_ref,
            record_count,
        });
        seq += 1;
    }
    Ok(seeds)
}

async fn read_input_lines(path: &str) -> Result<Vec<String>, HandlerError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| input_error(path, e))?;
    Ok(content.lines().map(|l| l.to_string()).collect())
}

fn input_error(path: &str, e: std::io::Error) -> HandlerError {
    HandlerError::terminal(
        ErrorKind::HandlerFailure,
        format!("input {path} unreadable: {e}"),
    )
}

/// Stable across processes: first 8 bytes of the record's sha-256.
fn stable_shard(line: &str, shards: usize) -> usize {
    let digest = Sha256::digest(line.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shards as u64) as usize
}

/// Single-`*` glob: `*.csv`, `handles-*`, `a*b`, or an exact name. No
/// pattern accepts everything.
fn matches_pattern(name: &str, pattern: Option<&str>) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    match pattern.split_once('*') {
        Some((prefix, suffix)) => name.starts_with(prefix) && name.ends_with(suffix),
        None => name == pattern,
    }
}
