//! Query command handlers
//!
//! Queries never mutate anything. Unknown task ids yield well-defined
//! empty results rather than errors, matching the permissive contract
//! harness clients rely on.

use serde_json::{json, Value};

use taskd_utils::Result;

use super::{HandlerContext, HandlerResult};

fn respond<T: serde::Serialize>(value: T) -> Result<HandlerResult> {
    Ok(HandlerResult::Response(
        serde_json::to_value(value).unwrap_or(Value::Null),
    ))
}

impl HandlerContext {
    pub(super) async fn is_ready(&self) -> Result<HandlerResult> {
        respond(self.engine.is_ready().await)
    }

    pub(super) async fn get_current_task_stack(&self) -> Result<HandlerResult> {
        respond(self.engine.current_task_stack().await)
    }

    pub(super) async fn get_configuration(&self) -> Result<HandlerResult> {
        respond(self.engine.configuration().await)
    }

    pub(super) async fn is_task_in_history(&self, task_id: &str) -> Result<HandlerResult> {
        respond(self.engine.is_task_in_history(task_id).await)
    }

    /// Transcript of a task, empty for unknown ids.
    pub(super) async fn get_messages(&self, task_id: &str) -> Result<HandlerResult> {
        respond(self.engine.messages(task_id).await)
    }

    /// Token usage of a task, null for unknown ids.
    pub(super) async fn get_token_usage(&self, task_id: &str) -> Result<HandlerResult> {
        respond(self.engine.token_usage(task_id).await)
    }

    pub(super) async fn get_profiles(&self) -> Result<HandlerResult> {
        respond(self.engine.profiles().await)
    }

    pub(super) async fn get_active_profile(&self) -> Result<HandlerResult> {
        match self.engine.active_profile().await {
            Some(name) => respond(name),
            None => Ok(HandlerResult::Response(json!(null))),
        }
    }
}
