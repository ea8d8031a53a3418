//! Engine seam
//!
//! [`TaskEngine`] is the boundary between the IPC core and whatever
//! actually runs tasks. Command handlers call into the engine; the
//! engine reports lifecycle progress back through an [`EngineEvents`]
//! handle, which feeds the broadcaster. The IPC core never invents a
//! lifecycle transition on its own.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use taskd_protocol::{ConfigurationValues, StartNewTaskPayload, TokenUsage, ToolUsage};
use taskd_utils::Result;

/// Operations the IPC core can ask of the engine.
///
/// Mutating calls are fire-and-forget from the wire's point of view:
/// their observable outcome arrives later as lifecycle events. Query
/// calls return data that handlers relay back to the requesting client.
#[async_trait]
pub trait TaskEngine: Send + Sync {
    /// Begin a new task. Returns the assigned task id; the engine must
    /// also report `created` (and eventually a terminal state) through
    /// its [`EngineEvents`] handle.
    async fn start_task(&self, request: StartNewTaskPayload) -> Result<String>;

    async fn cancel_task(&self, task_id: &str) -> Result<()>;
    async fn close_task(&self, task_id: &str) -> Result<()>;
    async fn resume_task(&self, task_id: &str) -> Result<()>;
    async fn cancel_current_task(&self) -> Result<()>;
    async fn clear_current_task(&self, last_message: Option<String>) -> Result<()>;

    /// Deliver user input to the current task.
    async fn send_message(&self, message: Option<String>, images: Option<Vec<String>>)
        -> Result<()>;
    /// Approve the pending interaction of the current task.
    async fn press_primary_button(&self) -> Result<()>;
    /// Reject the pending interaction of the current task.
    async fn press_secondary_button(&self) -> Result<()>;

    async fn configuration(&self) -> ConfigurationValues;
    async fn set_configuration(&self, values: ConfigurationValues) -> Result<()>;

    async fn is_ready(&self) -> bool;
    async fn current_task_stack(&self) -> Vec<String>;
    async fn is_task_in_history(&self, task_id: &str) -> bool;
    async fn messages(&self, task_id: &str) -> Vec<Value>;
    async fn token_usage(&self, task_id: &str) -> Option<TokenUsage>;

    /// Create a named profile. Returns its id. Fails if the name is
    /// already taken.
    async fn create_profile(&self, name: &str) -> Result<String>;
    async fn profiles(&self) -> Vec<String>;
    async fn active_profile(&self) -> Option<String>;
    async fn set_active_profile(&self, name: &str) -> Result<()>;
    async fn delete_profile(&self, name: &str) -> Result<()>;
}

/// A lifecycle notification from the engine.
#[derive(Debug, Clone)]
pub enum Lifecycle {
    Created {
        task_id: String,
    },
    Started {
        task_id: String,
    },
    ModeSwitched {
        task_id: String,
        mode: String,
    },
    Message {
        task_id: String,
        message: Value,
        partial: bool,
    },
    AskResponded {
        task_id: String,
    },
    Paused {
        task_id: String,
    },
    Unpaused {
        task_id: String,
    },
    Spawned {
        parent_task_id: String,
        child_task_id: String,
    },
    TokenUsageUpdated {
        task_id: String,
        usage: TokenUsage,
    },
    ToolFailed {
        task_id: String,
        tool: String,
        error: String,
    },
    Completed {
        task_id: String,
        token_usage: TokenUsage,
        tool_usage: ToolUsage,
    },
    Aborted {
        task_id: String,
    },
}

/// Handle an engine uses to report lifecycle progress.
///
/// Cloneable and cheap; the channel is unbounded because lifecycle
/// notifications must never apply backpressure to the engine.
#[derive(Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<Lifecycle>,
}

impl EngineEvents {
    /// Create a handle and the receiving end the broadcaster consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Lifecycle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn created(&self, task_id: impl Into<String>) {
        self.emit(Lifecycle::Created {
            task_id: task_id.into(),
        });
    }

    pub fn started(&self, task_id: impl Into<String>) {
        self.emit(Lifecycle::Started {
            task_id: task_id.into(),
        });
    }

    pub fn mode_switched(&self, task_id: impl Into<String>, mode: impl Into<String>) {
        self.emit(Lifecycle::ModeSwitched {
            task_id: task_id.into(),
            mode: mode.into(),
        });
    }

    pub fn message(&self, task_id: impl Into<String>, message: Value, partial: bool) {
        self.emit(Lifecycle::Message {
            task_id: task_id.into(),
            message,
            partial,
        });
    }

    pub fn ask_responded(&self, task_id: impl Into<String>) {
        self.emit(Lifecycle::AskResponded {
            task_id: task_id.into(),
        });
    }

    pub fn paused(&self, task_id: impl Into<String>) {
        self.emit(Lifecycle::Paused {
            task_id: task_id.into(),
        });
    }

    pub fn unpaused(&self, task_id: impl Into<String>) {
        self.emit(Lifecycle::Unpaused {
            task_id: task_id.into(),
        });
    }

    pub fn spawned(&self, parent_task_id: impl Into<String>, child_task_id: impl Into<String>) {
        self.emit(Lifecycle::Spawned {
            parent_task_id: parent_task_id.into(),
            child_task_id: child_task_id.into(),
        });
    }

    pub fn token_usage_updated(&self, task_id: impl Into<String>, usage: TokenUsage) {
        self.emit(Lifecycle::TokenUsageUpdated {
            task_id: task_id.into(),
            usage,
        });
    }

    pub fn tool_failed(
        &self,
        task_id: impl Into<String>,
        tool: impl Into<String>,
        error: impl Into<String>,
    ) {
        self.emit(Lifecycle::ToolFailed {
            task_id: task_id.into(),
            tool: tool.into(),
            error: error.into(),
        });
    }

    pub fn completed(
        &self,
        task_id: impl Into<String>,
        token_usage: TokenUsage,
        tool_usage: ToolUsage,
    ) {
        self.emit(Lifecycle::Completed {
            task_id: task_id.into(),
            token_usage,
            tool_usage,
        });
    }

    pub fn aborted(&self, task_id: impl Into<String>) {
        self.emit(Lifecycle::Aborted {
            task_id: task_id.into(),
        });
    }

    fn emit(&self, lifecycle: Lifecycle) {
        if self.tx.send(lifecycle).is_err() {
            warn!("Lifecycle channel closed, notification dropped");
        }
    }
}

impl std::fmt::Debug for EngineEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEvents")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (events, mut rx) = EngineEvents::channel();
        events.created("t1");
        events.started("t1");
        events.message("t1", json!({"text": "hi"}), false);

        assert!(matches!(rx.recv().await, Some(Lifecycle::Created { task_id }) if task_id == "t1"));
        assert!(matches!(rx.recv().await, Some(Lifecycle::Started { task_id }) if task_id == "t1"));
        assert!(
            matches!(rx.recv().await, Some(Lifecycle::Message { partial, .. }) if !partial)
        );
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (events, rx) = EngineEvents::channel();
        drop(rx);
        // Must not panic.
        events.aborted("t1");
    }
}
