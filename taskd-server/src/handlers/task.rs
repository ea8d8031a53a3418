//! Task lifecycle command handlers
//!
//! All of these are fire-and-forget: the engine is instructed and any
//! observable outcome arrives later as broadcast lifecycle events.

use tracing::{debug, info};

use taskd_protocol::{SendMessagePayload, StartNewTaskPayload};
use taskd_utils::{Result, TaskdError};

use super::{HandlerContext, HandlerResult};

impl HandlerContext {
    pub(super) async fn start_new_task(
        &self,
        request: StartNewTaskPayload,
    ) -> Result<HandlerResult> {
        let task_id = self.engine.start_task(request).await?;
        debug!("Task {} started for client {}", task_id, self.client_id);
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn cancel_task(&self, task_id: &str) -> Result<HandlerResult> {
        // Cancellation only makes sense for a live session.
        if !self.tasks.contains(task_id) {
            return Err(TaskdError::TaskNotFound(task_id.to_string()));
        }
        self.engine.cancel_task(task_id).await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn close_task(&self, task_id: &str) -> Result<HandlerResult> {
        self.engine.close_task(task_id).await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn resume_task(&self, task_id: &str) -> Result<HandlerResult> {
        self.engine.resume_task(task_id).await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn cancel_current_task(&self) -> Result<HandlerResult> {
        self.engine.cancel_current_task().await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn clear_current_task(
        &self,
        last_message: Option<String>,
    ) -> Result<HandlerResult> {
        self.engine.clear_current_task(last_message).await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn send_message(
        &self,
        payload: SendMessagePayload,
    ) -> Result<HandlerResult> {
        self.engine
            .send_message(payload.message, payload.images)
            .await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn press_primary_button(&self) -> Result<HandlerResult> {
        self.engine.press_primary_button().await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn press_secondary_button(&self) -> Result<HandlerResult> {
        self.engine.press_secondary_button().await?;
        Ok(HandlerResult::NoResponse)
    }

    /// Surface a client-supplied log line in the server log.
    pub(super) fn log(&self, line: String) -> Result<HandlerResult> {
        info!("[client {}] {}", self.client_id, line);
        Ok(HandlerResult::NoResponse)
    }
}
