use async_trait::async_trait;
use std::time::Duration;

use crate::handler::{Handler, HandlerError, TaskCtx};
use crate::retry::ErrorKind;

/// Sleeps, then fails. Used in failure drills; knobs come straight from the
/// job config: `sleep_ms` (default 100) and `terminal` (default false).
pub struct SleepThenFail;

#[async_trait]
impl Handler for SleepThenFail {
    fn name(&self) -> &'static str {
        "sleep-then-fail"
    }

    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError> {
        let sleep_ms = ctx.job.config["sleep_ms"].as_u64().unwrap_or(100);
        let terminal = ctx.job.config["terminal"].as_bool().unwrap_or(false);

        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;

        if ctx.checkpoint.is_cancelled() {
            return Err(HandlerError::retryable(ErrorKind::Cancelled, "cancelled"));
        }
        if terminal {
            Err(HandlerError::terminal(
                ErrorKind::HandlerFailure,
                "simulated terminal failure",
            ))
        } else {
            Err(HandlerError::retryable(
                ErrorKind::Timeout,
                "simulated transient failure",
            ))
        }
    }
}
