//! Event broadcaster
//!
//! Consumes the engine's lifecycle stream, keeps the task registry in
//! sync, and fans the corresponding wire events out to every connected
//! client. Delivery to one client never blocks or fails delivery to
//! another; a slow or dead client just loses events until its
//! connection is torn down.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use taskd_protocol::{IpcMessage, MessagePayload, TaskEvent};

use crate::engine::Lifecycle;
use crate::registry::ClientRegistry;
use crate::tasks::{TaskRegistry, TaskState};

pub struct Broadcaster {
    clients: Arc<ClientRegistry>,
    tasks: Arc<TaskRegistry>,
}

impl Broadcaster {
    pub fn new(clients: Arc<ClientRegistry>, tasks: Arc<TaskRegistry>) -> Self {
        Self { clients, tasks }
    }

    /// Drain the lifecycle channel until the engine side closes it.
    pub async fn run(&self, mut lifecycle: mpsc::UnboundedReceiver<Lifecycle>) {
        while let Some(notification) = lifecycle.recv().await {
            self.handle_lifecycle(notification);
        }
        debug!("Lifecycle channel closed, broadcaster stopping");
    }

    /// Apply one lifecycle notification: update the task registry,
    /// then broadcast the wire event.
    pub fn handle_lifecycle(&self, notification: Lifecycle) {
        self.track(&notification);
        self.broadcast(Self::to_event(notification));
    }

    fn track(&self, notification: &Lifecycle) {
        match notification {
            Lifecycle::Created { task_id } => self.tasks.insert(task_id.clone()),
            Lifecycle::Started { task_id } | Lifecycle::Unpaused { task_id } => {
                self.tasks.transition(task_id, TaskState::Started);
            }
            Lifecycle::Paused { task_id } => {
                self.tasks.transition(task_id, TaskState::Paused);
            }
            Lifecycle::Completed { task_id, .. } => {
                self.tasks.transition(task_id, TaskState::Completed);
            }
            Lifecycle::Aborted { task_id } => {
                self.tasks.transition(task_id, TaskState::Aborted);
            }
            Lifecycle::Spawned {
                parent_task_id,
                child_task_id,
            } => self.tasks.link(parent_task_id, child_task_id),
            Lifecycle::ModeSwitched { .. }
            | Lifecycle::Message { .. }
            | Lifecycle::AskResponded { .. }
            | Lifecycle::TokenUsageUpdated { .. }
            | Lifecycle::ToolFailed { .. } => {}
        }
    }

    fn to_event(notification: Lifecycle) -> TaskEvent {
        match notification {
            Lifecycle::Created { task_id } => TaskEvent::TaskCreated(task_id),
            Lifecycle::Started { task_id } => TaskEvent::TaskStarted(task_id),
            Lifecycle::ModeSwitched { task_id, mode } => {
                TaskEvent::TaskModeSwitched(task_id, mode)
            }
            Lifecycle::Message {
                task_id,
                message,
                partial,
            } => TaskEvent::Message(MessagePayload {
                task_id,
                message,
                partial,
            }),
            Lifecycle::AskResponded { task_id } => TaskEvent::TaskAskResponded(task_id),
            Lifecycle::Paused { task_id } => TaskEvent::TaskPaused(task_id),
            Lifecycle::Unpaused { task_id } => TaskEvent::TaskUnpaused(task_id),
            Lifecycle::Spawned {
                parent_task_id,
                child_task_id,
            } => TaskEvent::TaskSpawned(parent_task_id, child_task_id),
            Lifecycle::TokenUsageUpdated { task_id, usage } => {
                TaskEvent::TaskTokenUsageUpdated(task_id, usage)
            }
            Lifecycle::ToolFailed {
                task_id,
                tool,
                error,
            } => TaskEvent::TaskToolFailed(task_id, tool, error),
            Lifecycle::Completed {
                task_id,
                token_usage,
                tool_usage,
            } => TaskEvent::TaskCompleted(task_id, token_usage, tool_usage),
            Lifecycle::Aborted { task_id } => TaskEvent::TaskAborted(task_id),
        }
    }

    /// Fan an event out to every connected client.
    ///
    /// Returns the number of clients the event was queued for.
    pub fn broadcast(&self, event: TaskEvent) -> usize {
        let snapshot = self.clients.all();
        if snapshot.is_empty() {
            return 0;
        }

        let message = IpcMessage::event(event);
        let mut queued = 0;
        for (client_id, sender) in snapshot {
            match sender.try_send(message.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Client {} outbound queue full, event dropped", client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Client {} gone mid-broadcast", client_id);
                }
            }
        }
        debug!("Broadcast queued for {} clients", queued);
        queued
    }

    /// Deliver an event to a single client.
    ///
    /// Returns false when the client is unknown or its queue rejected
    /// the message.
    pub fn relay(&self, event: TaskEvent, client_id: &str) -> bool {
        let Some(sender) = self.clients.get(client_id) else {
            warn!("Relay target {} not connected", client_id);
            return false;
        };
        let message = IpcMessage::relay_event(event, client_id);
        match sender.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                warn!("Relay to {} failed: {}", client_id, err);
                false
            }
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("clients", &self.clients.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
