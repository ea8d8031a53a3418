//! Command routing
//!
//! Every inbound `TaskCommand` is dispatched here on its own spawned
//! task. Query commands produce a `CommandResponse` relayed back to
//! the requesting client; mutating commands are fire-and-forget and
//! their outcomes surface later as broadcast lifecycle events. Handler
//! failures are logged server-side and never tear down the connection.

mod profile;
mod query;
mod task;

use std::sync::Arc;

use tracing::{debug, warn};

use taskd_protocol::{Command, CommandResponse, TaskCommand, TaskEvent};
use taskd_utils::Result;

use crate::broadcast::Broadcaster;
use crate::engine::TaskEngine;
use crate::registry::ClientRegistry;
use crate::tasks::TaskRegistry;

/// What a handler produced.
pub enum HandlerResult {
    /// Query result, relayed back to the caller as a `CommandResponse`.
    Response(serde_json::Value),
    /// Nothing to send; any outcome arrives via broadcast events.
    NoResponse,
}

/// Everything a handler needs to act on a command.
#[derive(Clone)]
pub struct HandlerContext {
    pub client_id: String,
    pub engine: Arc<dyn TaskEngine>,
    pub clients: Arc<ClientRegistry>,
    pub tasks: Arc<TaskRegistry>,
    pub broadcaster: Arc<Broadcaster>,
}

impl HandlerContext {
    /// Route one command to its handler and relay the response, if any.
    pub async fn dispatch(&self, command: TaskCommand) {
        let name = command.command.name();
        let request_id = command.request_id.unwrap_or_default();
        debug!("Dispatching {} from {}", name, self.client_id);

        match self.route(command.command).await {
            Ok(HandlerResult::Response(payload)) => {
                let response = CommandResponse {
                    command_name: name.to_string(),
                    request_id,
                    payload,
                };
                self.broadcaster
                    .relay(TaskEvent::CommandResponse(response), &self.client_id);
            }
            Ok(HandlerResult::NoResponse) => {}
            Err(err) => {
                warn!("{} from {} failed: {}", name, self.client_id, err);
            }
        }
    }

    async fn route(&self, command: Command) -> Result<HandlerResult> {
        match command {
            Command::StartNewTask(request) => self.start_new_task(request).await,
            Command::CancelTask(task_id) => self.cancel_task(&task_id).await,
            Command::CloseTask(task_id) => self.close_task(&task_id).await,
            Command::ResumeTask(task_id) => self.resume_task(&task_id).await,
            Command::CancelCurrentTask => self.cancel_current_task().await,
            Command::ClearCurrentTask(last_message) => {
                self.clear_current_task(last_message).await
            }
            Command::SendMessage(payload) => self.send_message(payload).await,
            Command::PressPrimaryButton => self.press_primary_button().await,
            Command::PressSecondaryButton => self.press_secondary_button().await,
            Command::Log(line) => self.log(line),

            Command::IsReady => self.is_ready().await,
            Command::GetCurrentTaskStack => self.get_current_task_stack().await,
            Command::GetConfiguration => self.get_configuration().await,
            Command::IsTaskInHistory(task_id) => self.is_task_in_history(&task_id).await,
            Command::GetMessages(task_id) => self.get_messages(&task_id).await,
            Command::GetTokenUsage(task_id) => self.get_token_usage(&task_id).await,

            Command::SetConfiguration(values) => self.set_configuration(values).await,
            Command::CreateProfile(name) => self.create_profile(&name).await,
            Command::GetProfiles => self.get_profiles().await,
            Command::SetActiveProfile(name) => self.set_active_profile(&name).await,
            Command::GetActiveProfile => self.get_active_profile().await,
            Command::DeleteProfile(name) => self.delete_profile(&name).await,
        }
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("client_id", &self.client_id)
            .finish()
    }
}
