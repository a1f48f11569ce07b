use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::handler::{Handler, HandlerError, TaskCtx};
use crate::ratelimit::RateLimitError;
use crate::retry::{classify_status, ErrorClass, ErrorKind};

const DEFAULT_SERVICE: &str = "https://public.api.bsky.app";
/// getProfiles accepts at most 25 actors per call.
const CHUNK: usize = 25;
const HTTP_RETRIES: u32 = 3;

/// Backfills ATProto actor profiles: one handle per input line, one profile
/// JSON per output line. Every outbound call goes through the shared
/// `atproto` bucket; progress is checkpointed per chunk so a retry resumes
/// where the previous attempt stopped.
pub struct ActorProfileBackfill {
    client: reqwest::Client,
}

impl Default for ActorProfileBackfill {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Handler for ActorProfileBackfill {
    fn name(&self) -> &'static str {
        "actor-profile-backfill"
    }

    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError> {
        let batch = ctx.batch()?;
        let handles = ctx
            .artifacts
            .read_lines(&batch.input_ref)
            .await
            .map_err(|e| HandlerError::terminal(ErrorKind::HandlerFailure, e.to_string()))?;
        let handles: Vec<String> = handles
            .into_iter()
            .filter(|h| !h.trim().is_empty())
            .collect();

        let service = ctx.job.config["service"]
            .as_str()
            .unwrap_or(DEFAULT_SERVICE)
            .trim_end_matches('/')
            .to_string();
        let wait_cap = Duration::from_secs(ctx.job.config["rate_limit_wait_secs"].as_u64().unwrap_or(60));

        // Resume from the last checkpoint when its staged output is intact;
        // anything inconsistent means start over.
        let mut next = 0usize;
        let mut lines: Vec<String> = Vec::new();
        if let Some(state) = ctx.checkpoint.load().await {
            let staged = state["lines"].as_array().cloned().unwrap_or_default();
            let resume_at = state["next"].as_u64().unwrap_or(0) as usize;
            if resume_at <= handles.len() {
                next = resume_at;
                lines = staged
                    .into_iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect();
                ctx.logger
                    .log(&format!("resuming from checkpoint at handle {next}"))
                    .await;
            }
        }

        while next < handles.len() {
            if ctx.checkpoint.is_cancelled() {
                return Err(HandlerError::retryable(ErrorKind::Cancelled, "cancelled"));
            }

            let chunk: Vec<&str> = handles[next..(next + CHUNK).min(handles.len())]
                .iter()
                .map(|s| s.as_str())
                .collect();

            ctx.limiter
                .acquire("atproto", 1.0, wait_cap)
                .await
                .map_err(rate_limit_error)?;

            let profiles = self.fetch_profiles(&service, &chunk).await?;
            for profile in profiles {
                lines.push(profile.to_string());
            }
            next += chunk.len();

            ctx.checkpoint
                .save(&json!({ "next": next, "lines": lines }))
                .await
                .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?;
        }

        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        let written = ctx
            .artifacts
            .write_task_output(ctx.task.job_id, ctx.task.id, self.output_ext(), content.as_bytes())
            .await
            .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?;

        ctx.checkpoint.clear().await.ok();
        ctx.logger
            .log(&format!(
                "fetched {} profiles for {} handles",
                written.record_count,
                handles.len()
            ))
            .await;
        Ok(written.uri)
    }
}

impl ActorProfileBackfill {
    async fn fetch_profiles(
        &self,
        service: &str,
        actors: &[&str],
    ) -> Result<Vec<Value>, HandlerError> {
        let url = format!("{service}/xrpc/app.bsky.actor.getProfiles");
        let query: Vec<(&str, &str)> = actors.iter().map(|a| ("actors", *a)).collect();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let resp = match self.client.get(&url).query(&query).send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    if attempt <= HTTP_RETRIES {
                        tokio::time::sleep(backoff_for(attempt)).await;
                        continue;
                    }
                    return Err(HandlerError::retryable(ErrorKind::Network, e.to_string()));
                }
                Err(e) => {
                    return Err(HandlerError::retryable(ErrorKind::Unknown, e.to_string()))
                }
            };

            let status = resp.status().as_u16();
            if status == 200 {
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| HandlerError::retryable(ErrorKind::Network, e.to_string()))?;
                let profiles = body["profiles"].as_array().cloned().unwrap_or_default();
                return Ok(profiles);
            }

            let (kind, class) = classify_status(status);
            match class {
                ErrorClass::Terminal => {
                    return Err(HandlerError::terminal(
                        kind,
                        format!("{url} returned {status}"),
                    ));
                }
                ErrorClass::Retryable => {
                    if attempt <= HTTP_RETRIES {
                        let hint = retry_after_hint(retry_after_secs(&resp), attempt);
                        tokio::time::sleep(hint).await;
                        continue;
                    }
                    return Err(HandlerError::retryable(
                        kind,
                        format!("{url} returned {status} after {attempt} attempts"),
                    ));
                }
            }
        }
    }
}

fn retry_after_secs(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Server hint when present, else exponential backoff capped at 60s.
fn retry_after_hint(hint_secs: Option<u64>, attempt: u32) -> Duration {
    match hint_secs {
        Some(secs) => Duration::from_secs(secs.min(60)),
        None => backoff_for(attempt),
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let ms = 250u64.saturating_mul(1 << attempt.min(8));
    Duration::from_millis(ms.min(60_000))
}

fn rate_limit_error(e: RateLimitError) -> HandlerError {
    match e {
        RateLimitError::Exhausted { .. } => {
            HandlerError::retryable(ErrorKind::RateLimited, e.to_string())
        }
        RateLimitError::UnknownEndpoint(_) => {
            HandlerError::terminal(ErrorKind::HandlerFailure, e.to_string())
        }
        RateLimitError::Store(_) => HandlerError::retryable(ErrorKind::Unknown, e.to_string()),
    }
}
