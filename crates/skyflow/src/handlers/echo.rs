use async_trait::async_trait;

use crate::handler::{Handler, HandlerError, TaskCtx};
use crate::retry::ErrorKind;

/// Copies batch input lines to the output artifact unchanged. The reference
/// handler for smoke tests and drills.
pub struct Echo;

#[async_trait]
impl Handler for Echo {
    fn name(&self) -> &'static str {
        "echo-1"
    }

    fn output_ext(&self) -> &'static str {
        "txt"
    }

    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError> {
        let batch = ctx.batch()?;
        let lines = ctx
            .artifacts
            .read_lines(&batch.input_ref)
            .await
            .map_err(|e| HandlerError::terminal(ErrorKind::HandlerFailure, e.to_string()))?;

        if ctx.checkpoint.is_cancelled() {
            return Err(HandlerError::retryable(ErrorKind::Cancelled, "cancelled"));
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

        ctx.logger
            .log(&format!("echoed {} records", written.record_count))
            .await;
        Ok(written.uri)
    }
}
