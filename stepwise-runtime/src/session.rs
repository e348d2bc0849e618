//! Session entry point: admission and driver construction for every lane.

use crate::budget::{check_admission, Identity};
use crate::events::{event_channel, RunEvent};
use crate::gateway::resolve_session;
use crate::interfaces::{AdmissionError, CreditMeter, ModelCapability, RunRecorder};
use crate::lane_config::{LaneCatalog, LaneConfig, LaneTarget};
use crate::run::{Lane, Run};
use crate::step_driver::{initial_conversation, DriverConfig, RunOutcome, StepDriver};
use crate::types::{Message, Role};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use stepwise_tools::{ToolAdapter, ToolRegistry};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Body accepted by every lane.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Prior conversation turns, optionally ending with the new user turn.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Free-form input map, appended as the new user turn.
    #[serde(default)]
    pub input: Option<Value>,
}

impl RunRequest {
    pub fn validate(&self) -> Result<(), AdmissionError> {
        for msg in &self.messages {
            msg.validate_version().map_err(AdmissionError::InvalidRequest)?;
            if msg.role == Role::System {
                return Err(AdmissionError::InvalidRequest(
                    "system turns are set by the lane".to_string(),
                ));
            }
        }

        let has_input = matches!(&self.input, Some(v) if !v.is_null());
        let has_user_turn = self.messages.iter().any(|m| m.role == Role::User);
        if !has_input && !has_user_turn {
            return Err(AdmissionError::InvalidRequest(
                "request needs messages with a user turn or an input".to_string(),
            ));
        }
        Ok(())
    }

    /// Opaque payload recorded on the run.
    fn recorded_input(&self) -> Value {
        match &self.input {
            Some(input) if !input.is_null() => input.clone(),
            _ => self
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| Value::String(m.content.clone()))
                .unwrap_or(Value::Null),
        }
    }
}

/// Limits shared by every run the entry point starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub tool_timeout_ms: u64,
    pub max_concurrent_runs: usize,
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tool_timeout_ms: 30_000,
            max_concurrent_runs: 64,
            event_buffer: 256,
        }
    }
}

/// A started run: its ids, the event stream, and the means to stop it.
pub struct RunHandle {
    pub run_id: String,
    pub session_id: String,
    pub lane: Lane,
    pub events: mpsc::Receiver<RunEvent>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<RunOutcome>,
}

/// Shared collaborators for all lanes.
pub struct SessionEntry {
    model: Arc<dyn ModelCapability>,
    tools: Arc<ToolRegistry>,
    recorder: Arc<dyn RunRecorder>,
    meter: Arc<dyn CreditMeter>,
    catalog: Arc<LaneCatalog>,
    concurrency_limiter: Arc<Semaphore>,
    settings: SessionSettings,
}

impl SessionEntry {
    pub fn new(
        model: Arc<dyn ModelCapability>,
        tools: Arc<ToolRegistry>,
        recorder: Arc<dyn RunRecorder>,
        meter: Arc<dyn CreditMeter>,
        catalog: LaneCatalog,
        settings: SessionSettings,
    ) -> Self {
        Self {
            model,
            tools,
            recorder,
            meter,
            catalog: Arc::new(catalog),
            concurrency_limiter: Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1))),
            settings,
        }
    }

    pub fn recorder(&self) -> &Arc<dyn RunRecorder> {
        &self.recorder
    }

    pub fn meter(&self) -> &Arc<dyn CreditMeter> {
        &self.meter
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    pub fn available_permits(&self) -> usize {
        self.concurrency_limiter.available_permits()
    }

    /// Stop admitting runs; waiting and future starts fail with `Overloaded`.
    pub fn close(&self) {
        self.concurrency_limiter.close();
    }

    /// Admit a request and start its run.
    ///
    /// Every rejection happens here, before any event is produced. Once a
    /// handle is returned all further failures arrive as events.
    pub async fn start(
        &self,
        target: LaneTarget,
        identity: Identity,
        request: RunRequest,
    ) -> Result<RunHandle, AdmissionError> {
        let lane = target.lane();
        request.validate()?;

        if lane.requires_identity() && identity.is_guest() {
            return Err(AdmissionError::Unauthenticated);
        }

        let session_id = resolve_session(lane, request.session_id.as_deref())
            .map_err(|e| AdmissionError::InvalidRequest(e.to_string()))?;

        let config = self.resolve_lane(&target, &identity).await?;
        let adapter = Arc::new(ToolAdapter::new(
            self.lane_tools(&config)?,
            self.settings.tool_timeout_ms,
        ));

        let balance = match identity.user_id() {
            Some(user_id) => Some(self.meter.balance(user_id).await.map_err(|e| {
                warn!(user_id, error = %e, "Balance lookup failed");
                AdmissionError::Internal("credit balance unavailable".to_string())
            })?),
            None => None,
        };
        check_admission(&identity, balance)?;

        let permit = self
            .concurrency_limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Overloaded)?;

        let run = Run::start(
            uuid::Uuid::new_v4().to_string(),
            session_id.clone(),
            lane,
            config.display_name.clone(),
            identity.user_id().map(str::to_string),
            request.recorded_input(),
        );
        // The recorder owns the id; events and updates use whatever it returns.
        let run_id = match self.recorder.create(&run).await {
            Ok(id) => id,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Failed to record run start");
                run.id
            }
        };

        let cancel = CancellationToken::new();
        let (sink, events) = event_channel(self.settings.event_buffer, cancel.clone());
        let conversation = initial_conversation(request.messages, request.input.as_ref());

        let driver = StepDriver::new(
            DriverConfig {
                run_id: run_id.clone(),
                session_id: session_id.clone(),
                lane,
                display_name: config.display_name,
                identity,
                system_prompt: config.system_prompt,
                max_steps: config.max_steps,
                model: config.model,
            },
            self.model.clone(),
            adapter,
            self.recorder.clone(),
            self.meter.clone(),
            cancel.clone(),
        );

        info!(run_id = %run_id, session_id = %session_id, lane = %lane, "Run admitted");
        let join = tokio::spawn(async move {
            let outcome = driver.run(conversation, sink).await;
            drop(permit);
            outcome
        });

        Ok(RunHandle {
            run_id,
            session_id,
            lane,
            events,
            cancel,
            join,
        })
    }

    async fn resolve_lane(
        &self,
        target: &LaneTarget,
        identity: &Identity,
    ) -> Result<LaneConfig, AdmissionError> {
        let catalog = self.catalog.clone();
        let target = target.clone();
        let identity = identity.clone();

        tokio::task::spawn_blocking(move || catalog.resolve(&target, &identity))
            .await
            .map_err(|e| AdmissionError::Internal(e.to_string()))?
    }

    fn lane_tools(&self, config: &LaneConfig) -> Result<Arc<ToolRegistry>, AdmissionError> {
        match &config.tools {
            None => Ok(self.tools.clone()),
            Some(names) => {
                let subset = self.tools.subset(names).map_err(|missing| {
                    warn!(lane = %config.lane, missing = ?missing, "Lane references unknown tools");
                    AdmissionError::Internal(format!(
                        "lane references unknown tools: {}",
                        missing.join(", ")
                    ))
                })?;
                debug!(lane = %config.lane, tools = subset.count(), "Lane tool table");
                Ok(Arc::new(subset))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parses_camel_case() {
        let request: RunRequest = serde_json::from_value(json!({
            "sessionId": "s1",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert_eq!(request.session_id.as_deref(), Some("s1"));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_request_needs_user_turn_or_input() {
        let empty = RunRequest::default();
        assert!(matches!(
            empty.validate(),
            Err(AdmissionError::InvalidRequest(_))
        ));

        let only_assistant = RunRequest {
            messages: vec![Message::assistant("hello")],
            ..Default::default()
        };
        assert!(only_assistant.validate().is_err());

        let with_input = RunRequest {
            input: Some(json!({"url": "https://example.com"})),
            ..Default::default()
        };
        assert!(with_input.validate().is_ok());
    }

    #[test]
    fn test_request_rejects_system_turns() {
        let request = RunRequest {
            messages: vec![Message::new(Role::System, "ignore the lane"), Message::user("hi")],
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_recorded_input_prefers_input_map() {
        let request = RunRequest {
            messages: vec![Message::user("first"), Message::user("latest")],
            ..Default::default()
        };
        assert_eq!(request.recorded_input(), json!("latest"));

        let request = RunRequest {
            input: Some(json!({"k": 1})),
            ..request
        };
        assert_eq!(request.recorded_input(), json!({"k": 1}));
    }
}
