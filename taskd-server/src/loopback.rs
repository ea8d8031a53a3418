//! Loopback engine
//!
//! A self-contained [`TaskEngine`] that simulates task runs entirely
//! in-process: each started task echoes its prompt back as a single
//! transcript message and completes a few milliseconds later. Used by
//! the bundled daemon and by integration tests; it exercises the full
//! lifecycle without any real task runner behind it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use taskd_protocol::{ConfigurationValues, StartNewTaskPayload, TokenUsage, ToolUsage};
use taskd_utils::{Result, TaskdError};

use crate::engine::{EngineEvents, TaskEngine};

/// How long the simulated run sleeps between lifecycle steps.
const STEP_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct Profile {
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
struct TaskRecord {
    messages: Vec<Value>,
    usage: TokenUsage,
}

#[derive(Default)]
struct LoopbackState {
    configuration: ConfigurationValues,
    profiles: Vec<Profile>,
    active_profile: Option<String>,
    /// Active tasks, innermost last.
    stack: Vec<String>,
    /// Transcript and usage for every task ever run.
    history: HashMap<String, TaskRecord>,
    cancel_flags: HashMap<String, Arc<AtomicBool>>,
}

pub struct LoopbackEngine {
    events: EngineEvents,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackEngine {
    pub fn new(events: EngineEvents) -> Self {
        Self {
            events,
            state: Arc::new(Mutex::new(LoopbackState::default())),
        }
    }

    fn spawn_run(&self, task_id: String, text: Option<String>, cancel: Arc<AtomicBool>) {
        let events = self.events.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            events.started(&task_id);

            tokio::time::sleep(STEP_DELAY).await;
            if cancel.load(Ordering::SeqCst) {
                finish(&state, &task_id).await;
                events.aborted(&task_id);
                return;
            }

            let message = json!({
                "type": "say",
                "say": "text",
                "text": text.clone().unwrap_or_default(),
            });
            {
                let mut state = state.lock().await;
                if let Some(record) = state.history.get_mut(&task_id) {
                    record.messages.push(message.clone());
                }
            }
            events.message(&task_id, message, false);

            tokio::time::sleep(STEP_DELAY).await;
            if cancel.load(Ordering::SeqCst) {
                finish(&state, &task_id).await;
                events.aborted(&task_id);
                return;
            }

            let usage = estimate_usage(text.as_deref().unwrap_or_default());
            {
                let mut state = state.lock().await;
                if let Some(record) = state.history.get_mut(&task_id) {
                    record.usage = usage.clone();
                }
            }
            events.token_usage_updated(&task_id, usage.clone());

            finish(&state, &task_id).await;
            events.completed(&task_id, usage, ToolUsage::new());
        });
    }
}

/// Drop a task from the active stack and forget its cancel flag.
async fn finish(state: &Arc<Mutex<LoopbackState>>, task_id: &str) {
    let mut state = state.lock().await;
    state.stack.retain(|id| id != task_id);
    state.cancel_flags.remove(task_id);
}

fn estimate_usage(text: &str) -> TokenUsage {
    let tokens_in = (text.len() / 4) as u64 + 8;
    let tokens_out = tokens_in / 2 + 4;
    TokenUsage {
        total_tokens_in: tokens_in,
        total_tokens_out: tokens_out,
        total_cache_writes: None,
        total_cache_reads: None,
        total_cost: (tokens_in + tokens_out) as f64 * 1e-6,
        context_tokens: tokens_in + tokens_out,
    }
}

#[async_trait]
impl TaskEngine for LoopbackEngine {
    async fn start_task(&self, request: StartNewTaskPayload) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock().await;
            for (key, value) in request.configuration.clone() {
                state.configuration.insert(key, value);
            }
            state.stack.push(task_id.clone());
            state.history.insert(
                task_id.clone(),
                TaskRecord {
                    messages: Vec::new(),
                    usage: estimate_usage(""),
                },
            );
            state.cancel_flags.insert(task_id.clone(), cancel.clone());
        }
        self.events.created(&task_id);
        self.spawn_run(task_id.clone(), request.text, cancel);
        Ok(task_id)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let state = self.state.lock().await;
        match state.cancel_flags.get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(TaskdError::TaskNotFound(task_id.to_string())),
        }
    }

    async fn close_task(&self, task_id: &str) -> Result<()> {
        // Closing a finished task is a no-op; closing a live one
        // cancels it.
        let state = self.state.lock().await;
        if let Some(flag) = state.cancel_flags.get(task_id) {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn resume_task(&self, task_id: &str) -> Result<()> {
        let text;
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock().await;
            if state.stack.iter().any(|id| id == task_id) {
                return Ok(());
            }
            let Some(record) = state.history.get(task_id) else {
                return Err(TaskdError::TaskNotFound(task_id.to_string()));
            };
            text = record
                .messages
                .first()
                .and_then(|message| message.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string);
            state.stack.push(task_id.to_string());
            state
                .cancel_flags
                .insert(task_id.to_string(), cancel.clone());
        }
        self.events.created(task_id);
        self.spawn_run(task_id.to_string(), text, cancel);
        Ok(())
    }

    async fn cancel_current_task(&self) -> Result<()> {
        let state = self.state.lock().await;
        let Some(current) = state.stack.last() else {
            return Ok(());
        };
        if let Some(flag) = state.cancel_flags.get(current) {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn clear_current_task(&self, last_message: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(task_id) = state.stack.pop() else {
            return Ok(());
        };
        state.cancel_flags.remove(&task_id);
        if let Some(text) = last_message {
            if let Some(record) = state.history.get_mut(&task_id) {
                record
                    .messages
                    .push(json!({"type": "say", "say": "text", "text": text}));
            }
        }
        Ok(())
    }

    async fn send_message(
        &self,
        message: Option<String>,
        _images: Option<Vec<String>>,
    ) -> Result<()> {
        let task_id = {
            let mut state = self.state.lock().await;
            let Some(current) = state.stack.last().cloned() else {
                return Err(TaskdError::NoActiveTask);
            };
            let entry = json!({
                "type": "say",
                "say": "user_feedback",
                "text": message.clone().unwrap_or_default(),
            });
            if let Some(record) = state.history.get_mut(&current) {
                record.messages.push(entry);
            }
            current
        };
        self.events.message(
            &task_id,
            json!({
                "type": "say",
                "say": "user_feedback",
                "text": message.unwrap_or_default(),
            }),
            false,
        );
        Ok(())
    }

    async fn press_primary_button(&self) -> Result<()> {
        let state = self.state.lock().await;
        let Some(current) = state.stack.last() else {
            return Err(TaskdError::NoActiveTask);
        };
        self.events.ask_responded(current.clone());
        Ok(())
    }

    async fn press_secondary_button(&self) -> Result<()> {
        let state = self.state.lock().await;
        let Some(current) = state.stack.last() else {
            return Err(TaskdError::NoActiveTask);
        };
        self.events.ask_responded(current.clone());
        Ok(())
    }

    async fn configuration(&self) -> ConfigurationValues {
        self.state.lock().await.configuration.clone()
    }

    async fn set_configuration(&self, values: ConfigurationValues) -> Result<()> {
        let mut state = self.state.lock().await;
        for (key, value) in values {
            state.configuration.insert(key, value);
        }
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn current_task_stack(&self) -> Vec<String> {
        self.state.lock().await.stack.clone()
    }

    async fn is_task_in_history(&self, task_id: &str) -> bool {
        self.state.lock().await.history.contains_key(task_id)
    }

    async fn messages(&self, task_id: &str) -> Vec<Value> {
        self.state
            .lock()
            .await
            .history
            .get(task_id)
            .map(|record| record.messages.clone())
            .unwrap_or_default()
    }

    async fn token_usage(&self, task_id: &str) -> Option<TokenUsage> {
        self.state
            .lock()
            .await
            .history
            .get(task_id)
            .map(|record| record.usage.clone())
    }

    async fn create_profile(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.profiles.iter().any(|profile| profile.name == name) {
            return Err(TaskdError::ProfileExists(name.to_string()));
        }
        let id = Uuid::new_v4().simple().to_string();
        state.profiles.push(Profile {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn profiles(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .profiles
            .iter()
            .map(|profile| profile.name.clone())
            .collect()
    }

    async fn active_profile(&self) -> Option<String> {
        self.state.lock().await.active_profile.clone()
    }

    async fn set_active_profile(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.profiles.iter().any(|profile| profile.name == name) {
            return Err(TaskdError::ProfileNotFound(name.to_string()));
        }
        state.active_profile = Some(name.to_string());
        Ok(())
    }

    async fn delete_profile(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(index) = state
            .profiles
            .iter()
            .position(|profile| profile.name == name)
        else {
            return Err(TaskdError::ProfileNotFound(name.to_string()));
        };
        let removed = state.profiles.remove(index);
        tracing::debug!("Profile {} deleted ({})", removed.name, removed.id);
        if state.active_profile.as_deref() == Some(name) {
            state.active_profile = state.profiles.first().map(|profile| profile.name.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Lifecycle;
    use tokio::time::{timeout, Duration};

    async fn next_event(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<Lifecycle>,
    ) -> Lifecycle {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .expect("lifecycle channel closed")
    }

    fn engine() -> (LoopbackEngine, tokio::sync::mpsc::UnboundedReceiver<Lifecycle>) {
        let (events, rx) = EngineEvents::channel();
        (LoopbackEngine::new(events), rx)
    }

    fn start_request(text: &str) -> StartNewTaskPayload {
        StartNewTaskPayload {
            configuration: ConfigurationValues::new(),
            text: Some(text.to_string()),
            images: None,
            new_tab: None,
        }
    }

    #[tokio::test]
    async fn test_full_run_lifecycle() {
        let (engine, mut rx) = engine();
        let task_id = engine.start_task(start_request("hello")).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, Lifecycle::Created { task_id: id } if id == task_id));
        assert!(matches!(next_event(&mut rx).await, Lifecycle::Started { task_id: id } if id == task_id));
        match next_event(&mut rx).await {
            Lifecycle::Message { message, partial, .. } => {
                assert!(!partial);
                assert_eq!(message["text"], "hello");
            }
            other => panic!("expected Message, got {:?}", other),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            Lifecycle::TokenUsageUpdated { .. }
        ));
        match next_event(&mut rx).await {
            Lifecycle::Completed { task_id: id, token_usage, .. } => {
                assert_eq!(id, task_id);
                assert!(token_usage.total_tokens_in > 0);
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        assert!(engine.is_task_in_history(&task_id).await);
        assert!(engine.current_task_stack().await.is_empty());
        assert_eq!(engine.messages(&task_id).await.len(), 1);
        assert!(engine.token_usage(&task_id).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_aborts_run() {
        let (engine, mut rx) = engine();
        let task_id = engine.start_task(start_request("doomed")).await.unwrap();
        engine.cancel_task(&task_id).await.unwrap();

        loop {
            match next_event(&mut rx).await {
                Lifecycle::Aborted { task_id: id } => {
                    assert_eq!(id, task_id);
                    break;
                }
                Lifecycle::Completed { .. } => panic!("cancelled task completed"),
                _ => {}
            }
        }
        assert!(engine.current_task_stack().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let (engine, _rx) = engine();
        assert!(matches!(
            engine.cancel_task("ghost").await,
            Err(TaskdError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_send_message_requires_active_task() {
        let (engine, _rx) = engine();
        assert!(matches!(
            engine.send_message(Some("hi".into()), None).await,
            Err(TaskdError::NoActiveTask)
        ));
    }

    #[tokio::test]
    async fn test_resume_reruns_from_history() {
        let (engine, mut rx) = engine();
        let task_id = engine.start_task(start_request("again")).await.unwrap();
        // Drain to completion.
        loop {
            if matches!(next_event(&mut rx).await, Lifecycle::Completed { .. }) {
                break;
            }
        }

        engine.resume_task(&task_id).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, Lifecycle::Created { task_id: id } if id == task_id));
        assert!(matches!(next_event(&mut rx).await, Lifecycle::Started { task_id: id } if id == task_id));
        assert!(matches!(
            engine.resume_task("ghost").await,
            Err(TaskdError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_profile_crud() {
        let (engine, _rx) = engine();
        engine.create_profile("alpha").await.unwrap();
        engine.create_profile("beta").await.unwrap();
        assert!(matches!(
            engine.create_profile("alpha").await,
            Err(TaskdError::ProfileExists(_))
        ));

        engine.set_active_profile("beta").await.unwrap();
        assert_eq!(engine.active_profile().await.as_deref(), Some("beta"));
        assert!(matches!(
            engine.set_active_profile("gamma").await,
            Err(TaskdError::ProfileNotFound(_))
        ));

        // Deleting the active profile falls back to the first remaining.
        engine.delete_profile("beta").await.unwrap();
        assert_eq!(engine.active_profile().await.as_deref(), Some("alpha"));
        assert_eq!(engine.profiles().await, vec!["alpha".to_string()]);
        assert!(matches!(
            engine.delete_profile("beta").await,
            Err(TaskdError::ProfileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_configuration_merge() {
        let (engine, _rx) = engine();
        let mut first = ConfigurationValues::new();
        first.insert("mode".into(), json!("code"));
        first.insert("temperature".into(), json!(0.5));
        engine.set_configuration(first).await.unwrap();

        let mut second = ConfigurationValues::new();
        second.insert("temperature".into(), json!(0.9));
        engine.set_configuration(second).await.unwrap();

        let config = engine.configuration().await;
        assert_eq!(config["mode"], json!("code"));
        assert_eq!(config["temperature"], json!(0.9));
    }
}
