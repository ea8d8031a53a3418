//! Client-server message types
//!
//! The envelope and both closed unions. `Command` and `TaskEvent` carry
//! hand-written serde impls: the wire keys (`commandName`/`data`,
//! `eventName`/`payload`) and the per-variant payload shapes are a fixed
//! contract with external harness clients, and decoding must fail closed on
//! anything that does not match exactly one variant.

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    Ack, CommandResponse, ConfigurationValues, MessagePayload, SendMessagePayload,
    StartNewTaskPayload, TokenUsage, ToolUsage,
};

/// Which side of the connection produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcOrigin {
    Client,
    Server,
}

impl std::fmt::Display for IpcOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcOrigin::Client => write!(f, "client"),
            IpcOrigin::Server => write!(f, "server"),
        }
    }
}

/// Wire envelope. One JSON object per line, tagged by `type`.
///
/// The origin is fixed per type: `Ack` and `TaskEvent` are server-only,
/// `TaskCommand`, `Connect` and `Disconnect` are client-only. The codec
/// rejects envelopes that violate this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcMessage {
    Connect {
        origin: IpcOrigin,
    },
    Disconnect {
        origin: IpcOrigin,
    },
    Ack {
        origin: IpcOrigin,
        data: Ack,
    },
    TaskCommand {
        origin: IpcOrigin,
        #[serde(rename = "clientId")]
        client_id: String,
        data: TaskCommand,
    },
    TaskEvent {
        origin: IpcOrigin,
        /// When set, the event is relayed to this client only instead of
        /// being broadcast.
        #[serde(
            rename = "relayClientId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        relay_client_id: Option<String>,
        /// Secondary numeric correlation hint, distinct from the task id
        /// embedded in the payload.
        #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
        task_id: Option<i64>,
        data: TaskEvent,
    },
}

impl IpcMessage {
    /// Server handshake envelope
    pub fn ack(data: Ack) -> Self {
        IpcMessage::Ack {
            origin: IpcOrigin::Server,
            data,
        }
    }

    /// Client command envelope
    pub fn command(client_id: impl Into<String>, data: TaskCommand) -> Self {
        IpcMessage::TaskCommand {
            origin: IpcOrigin::Client,
            client_id: client_id.into(),
            data,
        }
    }

    /// Server event envelope for broadcast
    pub fn event(data: TaskEvent) -> Self {
        IpcMessage::TaskEvent {
            origin: IpcOrigin::Server,
            relay_client_id: None,
            task_id: None,
            data,
        }
    }

    /// Server event envelope targeted at a single client
    pub fn relay_event(data: TaskEvent, client_id: impl Into<String>) -> Self {
        IpcMessage::TaskEvent {
            origin: IpcOrigin::Server,
            relay_client_id: Some(client_id.into()),
            task_id: None,
            data,
        }
    }

    /// The origin carried by this envelope
    pub fn origin(&self) -> IpcOrigin {
        match self {
            IpcMessage::Connect { origin }
            | IpcMessage::Disconnect { origin }
            | IpcMessage::Ack { origin, .. }
            | IpcMessage::TaskCommand { origin, .. }
            | IpcMessage::TaskEvent { origin, .. } => *origin,
        }
    }

    /// Check the per-type origin invariant
    pub fn validate_origin(&self) -> Result<(), String> {
        let (expected, message_type) = match self {
            IpcMessage::Connect { .. } => (IpcOrigin::Client, "Connect"),
            IpcMessage::Disconnect { .. } => (IpcOrigin::Client, "Disconnect"),
            IpcMessage::Ack { .. } => (IpcOrigin::Server, "Ack"),
            IpcMessage::TaskCommand { .. } => (IpcOrigin::Client, "TaskCommand"),
            IpcMessage::TaskEvent { .. } => (IpcOrigin::Server, "TaskEvent"),
        };
        if self.origin() == expected {
            Ok(())
        } else {
            Err(format!(
                "{} messages must originate from the {}",
                message_type, expected
            ))
        }
    }
}

/// A validated client command: the closed [`Command`] union plus an optional
/// correlation id. When `request_id` is present, whichever mechanism returns
/// the result echoes it back (see [`CommandResponse`]).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCommand {
    pub request_id: Option<String>,
    pub command: Command,
}

impl TaskCommand {
    pub fn new(command: Command) -> Self {
        Self {
            request_id: None,
            command,
        }
    }

    pub fn with_request_id(command: Command, request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            command,
        }
    }
}

/// Closed command union, keyed by `commandName` on the wire.
///
/// The payload shape for a given command never varies: no payload, a bare
/// string (usually a task id or name), or a structured object.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartNewTask(StartNewTaskPayload),
    CancelTask(String),
    CloseTask(String),
    GetCurrentTaskStack,
    ClearCurrentTask(Option<String>),
    CancelCurrentTask,
    SendMessage(SendMessagePayload),
    PressPrimaryButton,
    PressSecondaryButton,
    SetConfiguration(ConfigurationValues),
    GetConfiguration,
    IsReady,
    GetMessages(String),
    GetTokenUsage(String),
    Log(String),
    ResumeTask(String),
    IsTaskInHistory(String),
    CreateProfile(String),
    GetProfiles,
    SetActiveProfile(String),
    GetActiveProfile,
    DeleteProfile(String),
}

impl Command {
    /// The wire `commandName` for this variant
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartNewTask(_) => "StartNewTask",
            Command::CancelTask(_) => "CancelTask",
            Command::CloseTask(_) => "CloseTask",
            Command::GetCurrentTaskStack => "GetCurrentTaskStack",
            Command::ClearCurrentTask(_) => "ClearCurrentTask",
            Command::CancelCurrentTask => "CancelCurrentTask",
            Command::SendMessage(_) => "SendMessage",
            Command::PressPrimaryButton => "PressPrimaryButton",
            Command::PressSecondaryButton => "PressSecondaryButton",
            Command::SetConfiguration(_) => "SetConfiguration",
            Command::GetConfiguration => "GetConfiguration",
            Command::IsReady => "IsReady",
            Command::GetMessages(_) => "GetMessages",
            Command::GetTokenUsage(_) => "GetTokenUsage",
            Command::Log(_) => "Log",
            Command::ResumeTask(_) => "ResumeTask",
            Command::IsTaskInHistory(_) => "IsTaskInHistory",
            Command::CreateProfile(_) => "CreateProfile",
            Command::GetProfiles => "GetProfiles",
            Command::SetActiveProfile(_) => "SetActiveProfile",
            Command::GetActiveProfile => "GetActiveProfile",
            Command::DeleteProfile(_) => "DeleteProfile",
        }
    }

    /// Validate a `commandName` + `data` pair into exactly one variant
    fn from_parts(name: &str, data: Value) -> Result<Self, String> {
        fn string_payload(name: &str, data: Value) -> Result<String, String> {
            match data {
                Value::String(s) => Ok(s),
                other => Err(format!(
                    "{}: expected string payload, got {}",
                    name,
                    json_kind(&other)
                )),
            }
        }

        fn object_payload<T: serde::de::DeserializeOwned>(
            name: &str,
            data: Value,
        ) -> Result<T, String> {
            if !data.is_object() {
                return Err(format!(
                    "{}: expected object payload, got {}",
                    name,
                    json_kind(&data)
                ));
            }
            serde_json::from_value(data).map_err(|e| format!("{}: {}", name, e))
        }

        fn no_payload(name: &str, data: Value) -> Result<(), String> {
            match data {
                Value::Null => Ok(()),
                // Clients commonly send an empty object where no payload
                // is expected; treat it the same as an absent one.
                Value::Object(map) if map.is_empty() => Ok(()),
                other => Err(format!(
                    "{}: takes no payload, got {}",
                    name,
                    json_kind(&other)
                )),
            }
        }

        match name {
            "StartNewTask" => Ok(Self::StartNewTask(object_payload(name, data)?)),
            "CancelTask" => Ok(Self::CancelTask(string_payload(name, data)?)),
            "CloseTask" => Ok(Self::CloseTask(string_payload(name, data)?)),
            "GetCurrentTaskStack" => {
                no_payload(name, data)?;
                Ok(Self::GetCurrentTaskStack)
            }
            "ClearCurrentTask" => match data {
                Value::Null => Ok(Self::ClearCurrentTask(None)),
                Value::String(s) => Ok(Self::ClearCurrentTask(Some(s))),
                other => Err(format!(
                    "ClearCurrentTask: expected optional string payload, got {}",
                    json_kind(&other)
                )),
            },
            "CancelCurrentTask" => {
                no_payload(name, data)?;
                Ok(Self::CancelCurrentTask)
            }
            "SendMessage" => Ok(Self::SendMessage(object_payload(name, data)?)),
            "PressPrimaryButton" => {
                no_payload(name, data)?;
                Ok(Self::PressPrimaryButton)
            }
            "PressSecondaryButton" => {
                no_payload(name, data)?;
                Ok(Self::PressSecondaryButton)
            }
            // Intentionally permissive: the configuration shape is owned by
            // the host's settings collaborator.
            "SetConfiguration" => match data {
                Value::Object(map) => Ok(Self::SetConfiguration(map)),
                other => Err(format!(
                    "SetConfiguration: expected object payload, got {}",
                    json_kind(&other)
                )),
            },
            "GetConfiguration" => {
                no_payload(name, data)?;
                Ok(Self::GetConfiguration)
            }
            "IsReady" => {
                no_payload(name, data)?;
                Ok(Self::IsReady)
            }
            "GetMessages" => Ok(Self::GetMessages(string_payload(name, data)?)),
            "GetTokenUsage" => Ok(Self::GetTokenUsage(string_payload(name, data)?)),
            "Log" => Ok(Self::Log(string_payload(name, data)?)),
            "ResumeTask" => Ok(Self::ResumeTask(string_payload(name, data)?)),
            "IsTaskInHistory" => Ok(Self::IsTaskInHistory(string_payload(name, data)?)),
            "CreateProfile" => Ok(Self::CreateProfile(string_payload(name, data)?)),
            "GetProfiles" => {
                no_payload(name, data)?;
                Ok(Self::GetProfiles)
            }
            "SetActiveProfile" => Ok(Self::SetActiveProfile(string_payload(name, data)?)),
            "GetActiveProfile" => {
                no_payload(name, data)?;
                Ok(Self::GetActiveProfile)
            }
            "DeleteProfile" => Ok(Self::DeleteProfile(string_payload(name, data)?)),
            unknown => Err(format!("unknown commandName: {:?}", unknown)),
        }
    }
}

impl Serialize for TaskCommand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(request_id) = &self.request_id {
            map.serialize_entry("requestId", request_id)?;
        }
        map.serialize_entry("commandName", self.command.name())?;
        match &self.command {
            Command::StartNewTask(payload) => map.serialize_entry("data", payload)?,
            Command::SendMessage(payload) => map.serialize_entry("data", payload)?,
            Command::SetConfiguration(values) => map.serialize_entry("data", values)?,
            Command::CancelTask(s)
            | Command::CloseTask(s)
            | Command::GetMessages(s)
            | Command::GetTokenUsage(s)
            | Command::Log(s)
            | Command::ResumeTask(s)
            | Command::IsTaskInHistory(s)
            | Command::CreateProfile(s)
            | Command::SetActiveProfile(s)
            | Command::DeleteProfile(s) => map.serialize_entry("data", s)?,
            Command::ClearCurrentTask(Some(last_message)) => {
                map.serialize_entry("data", last_message)?
            }
            Command::ClearCurrentTask(None)
            | Command::GetCurrentTaskStack
            | Command::CancelCurrentTask
            | Command::PressPrimaryButton
            | Command::PressSecondaryButton
            | Command::GetConfiguration
            | Command::IsReady
            | Command::GetProfiles
            | Command::GetActiveProfile => {}
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TaskCommand {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = Value::deserialize(deserializer)?;
        let obj = raw
            .as_object()
            .ok_or_else(|| D::Error::custom("task command must be an object"))?;

        let name = obj
            .get("commandName")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::custom("missing or non-string commandName"))?;

        let request_id = match obj.get("requestId") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "requestId must be a string, got {}",
                    json_kind(other)
                )))
            }
        };

        let data = obj.get("data").cloned().unwrap_or(Value::Null);
        let command = Command::from_parts(name, data).map_err(D::Error::custom)?;

        Ok(TaskCommand {
            request_id,
            command,
        })
    }
}

/// Closed event union, keyed by `eventName` on the wire; `payload` is the
/// ordered argument tuple as a JSON array.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Message(MessagePayload),
    TaskCreated(String),
    TaskStarted(String),
    TaskModeSwitched(String, String),
    TaskPaused(String),
    TaskUnpaused(String),
    TaskAskResponded(String),
    TaskAborted(String),
    /// (parent task id, child task id), informational link only
    TaskSpawned(String, String),
    TaskCompleted(String, TokenUsage, ToolUsage),
    TaskTokenUsageUpdated(String, TokenUsage),
    /// (task id, tool name, error text)
    TaskToolFailed(String, String, String),
    CommandResponse(CommandResponse),
    /// Evaluation-only terminal marker, wire name `Pass`
    EvalPass,
    /// Evaluation-only terminal marker, wire name `Fail`
    EvalFail,
}

impl TaskEvent {
    /// The wire `eventName` for this variant
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Message(_) => "Message",
            TaskEvent::TaskCreated(_) => "TaskCreated",
            TaskEvent::TaskStarted(_) => "TaskStarted",
            TaskEvent::TaskModeSwitched(..) => "TaskModeSwitched",
            TaskEvent::TaskPaused(_) => "TaskPaused",
            TaskEvent::TaskUnpaused(_) => "TaskUnpaused",
            TaskEvent::TaskAskResponded(_) => "TaskAskResponded",
            TaskEvent::TaskAborted(_) => "TaskAborted",
            TaskEvent::TaskSpawned(..) => "TaskSpawned",
            TaskEvent::TaskCompleted(..) => "TaskCompleted",
            TaskEvent::TaskTokenUsageUpdated(..) => "TaskTokenUsageUpdated",
            TaskEvent::TaskToolFailed(..) => "TaskToolFailed",
            TaskEvent::CommandResponse(_) => "CommandResponse",
            TaskEvent::EvalPass => "Pass",
            TaskEvent::EvalFail => "Fail",
        }
    }

    /// The task id this event concerns, when it carries one
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskEvent::Message(payload) => Some(&payload.task_id),
            TaskEvent::TaskCreated(id)
            | TaskEvent::TaskStarted(id)
            | TaskEvent::TaskModeSwitched(id, _)
            | TaskEvent::TaskPaused(id)
            | TaskEvent::TaskUnpaused(id)
            | TaskEvent::TaskAskResponded(id)
            | TaskEvent::TaskAborted(id)
            | TaskEvent::TaskSpawned(id, _)
            | TaskEvent::TaskCompleted(id, ..)
            | TaskEvent::TaskTokenUsageUpdated(id, _)
            | TaskEvent::TaskToolFailed(id, ..) => Some(id),
            TaskEvent::CommandResponse(_) | TaskEvent::EvalPass | TaskEvent::EvalFail => None,
        }
    }

    fn from_parts(name: &str, args: Vec<Value>) -> Result<Self, String> {
        fn expect_arity(name: &str, args: &[Value], arity: usize) -> Result<(), String> {
            if args.len() == arity {
                Ok(())
            } else {
                Err(format!(
                    "{}: expected payload of {} element(s), got {}",
                    name,
                    arity,
                    args.len()
                ))
            }
        }

        fn arg<T: serde::de::DeserializeOwned>(
            name: &str,
            args: &[Value],
            idx: usize,
        ) -> Result<T, String> {
            let value = args
                .get(idx)
                .cloned()
                .ok_or_else(|| format!("{}: missing payload[{}]", name, idx))?;
            serde_json::from_value(value).map_err(|e| format!("{}: payload[{}]: {}", name, idx, e))
        }

        match name {
            "Message" => {
                expect_arity(name, &args, 1)?;
                Ok(Self::Message(arg(name, &args, 0)?))
            }
            "TaskCreated" => {
                expect_arity(name, &args, 1)?;
                Ok(Self::TaskCreated(arg(name, &args, 0)?))
            }
            "TaskStarted" => {
                expect_arity(name, &args, 1)?;
                Ok(Self::TaskStarted(arg(name, &args, 0)?))
            }
            "TaskModeSwitched" => {
                expect_arity(name, &args, 2)?;
                Ok(Self::TaskModeSwitched(
                    arg(name, &args, 0)?,
                    arg(name, &args, 1)?,
                ))
            }
            "TaskPaused" => {
                expect_arity(name, &args, 1)?;
                Ok(Self::TaskPaused(arg(name, &args, 0)?))
            }
            "TaskUnpaused" => {
                expect_arity(name, &args, 1)?;
                Ok(Self::TaskUnpaused(arg(name, &args, 0)?))
            }
            "TaskAskResponded" => {
                expect_arity(name, &args, 1)?;
                Ok(Self::TaskAskResponded(arg(name, &args, 0)?))
            }
            "TaskAborted" => {
                expect_arity(name, &args, 1)?;
                Ok(Self::TaskAborted(arg(name, &args, 0)?))
            }
            "TaskSpawned" => {
                expect_arity(name, &args, 2)?;
                Ok(Self::TaskSpawned(arg(name, &args, 0)?, arg(name, &args, 1)?))
            }
            "TaskCompleted" => {
                expect_arity(name, &args, 3)?;
                Ok(Self::TaskCompleted(
                    arg(name, &args, 0)?,
                    arg(name, &args, 1)?,
                    arg(name, &args, 2)?,
                ))
            }
            "TaskTokenUsageUpdated" => {
                expect_arity(name, &args, 2)?;
                Ok(Self::TaskTokenUsageUpdated(
                    arg(name, &args, 0)?,
                    arg(name, &args, 1)?,
                ))
            }
            "TaskToolFailed" => {
                expect_arity(name, &args, 3)?;
                Ok(Self::TaskToolFailed(
                    arg(name, &args, 0)?,
                    arg(name, &args, 1)?,
                    arg(name, &args, 2)?,
                ))
            }
            "CommandResponse" => {
                expect_arity(name, &args, 1)?;
                Ok(Self::CommandResponse(arg(name, &args, 0)?))
            }
            "Pass" => {
                expect_arity(name, &args, 0)?;
                Ok(Self::EvalPass)
            }
            "Fail" => {
                expect_arity(name, &args, 0)?;
                Ok(Self::EvalFail)
            }
            unknown => Err(format!("unknown eventName: {:?}", unknown)),
        }
    }
}

impl Serialize for TaskEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("eventName", self.name())?;
        match self {
            TaskEvent::Message(payload) => map.serialize_entry("payload", &(payload,))?,
            TaskEvent::TaskCreated(id)
            | TaskEvent::TaskStarted(id)
            | TaskEvent::TaskPaused(id)
            | TaskEvent::TaskUnpaused(id)
            | TaskEvent::TaskAskResponded(id)
            | TaskEvent::TaskAborted(id) => map.serialize_entry("payload", &(id,))?,
            TaskEvent::TaskModeSwitched(id, mode) => {
                map.serialize_entry("payload", &(id, mode))?
            }
            TaskEvent::TaskSpawned(parent, child) => {
                map.serialize_entry("payload", &(parent, child))?
            }
            TaskEvent::TaskCompleted(id, usage, tools) => {
                map.serialize_entry("payload", &(id, usage, tools))?
            }
            TaskEvent::TaskTokenUsageUpdated(id, usage) => {
                map.serialize_entry("payload", &(id, usage))?
            }
            TaskEvent::TaskToolFailed(id, tool, error) => {
                map.serialize_entry("payload", &(id, tool, error))?
            }
            TaskEvent::CommandResponse(response) => {
                map.serialize_entry("payload", &(response,))?
            }
            TaskEvent::EvalPass | TaskEvent::EvalFail => {
                map.serialize_entry("payload", &[(); 0])?
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TaskEvent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = Value::deserialize(deserializer)?;
        let obj = raw
            .as_object()
            .ok_or_else(|| D::Error::custom("task event must be an object"))?;

        let name = obj
            .get("eventName")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::custom("missing or non-string eventName"))?;

        let args = match obj.get("payload") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "payload must be an array, got {}",
                    json_kind(other)
                )))
            }
        };

        TaskEvent::from_parts(name, args).map_err(D::Error::custom)
    }
}

/// Human-readable JSON type name for error messages
fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
