//! Run records and the lanes that start them.

use crate::types::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Calling context that determines prompt, tools, and budget.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Lane {
    Builder,
    Assistant,
    PublicExecute,
    Workflow,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Builder => "builder",
            Lane::Assistant => "assistant",
            Lane::PublicExecute => "public-execute",
            Lane::Workflow => "workflow",
        }
    }

    pub fn default_max_steps(&self) -> u32 {
        match self {
            Lane::Builder => 10,
            Lane::PublicExecute => 25,
            Lane::Assistant | Lane::Workflow => 50,
        }
    }

    /// Public deployed agents accept guests; every other lane is personal.
    pub fn requires_identity(&self) -> bool {
        !matches!(self, Lane::PublicExecute)
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Status only moves forward: running to exactly one terminal state.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(self, RunStatus::Running) && next.is_terminal()
    }
}

/// Outcome of one capability call, as kept in the run output.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub state: crate::events::ToolStatus,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub step_index: u32,
}

/// Final text plus structured extras.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub text: String,
    pub steps_used: u32,
    pub max_steps: u32,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
}

/// One execution of the agentic loop.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub session_id: String,
    pub lane: Lane,
    pub status: RunStatus,
    pub display_name: String,
    /// Authenticated caller; `None` for guest runs.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<RunOutput>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub credits_used: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// A freshly admitted run in `running` state.
    pub fn start(
        id: impl Into<String>,
        session_id: impl Into<String>,
        lane: Lane,
        display_name: impl Into<String>,
        owner: Option<String>,
        input: Value,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            lane,
            status: RunStatus::Running,
            display_name: display_name.into(),
            owner,
            input,
            output: None,
            error: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            credits_used: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Apply a terminal update. Returns false when the run is already terminal.
    pub fn apply(&mut self, update: &RunUpdate) -> bool {
        if !self.status.can_transition_to(update.status) {
            return false;
        }
        self.status = update.status;
        self.output = Some(update.output.clone());
        self.error = update.error.clone();
        self.prompt_tokens = update.usage.prompt_tokens;
        self.completion_tokens = update.usage.completion_tokens;
        self.total_tokens = update.usage.total_tokens;
        self.credits_used = update.credits_used;
        self.completed_at = Some(update.completed_at);
        true
    }
}

/// Terminal state written by the step driver at finalize.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub output: RunOutput,
    pub usage: TokenUsage,
    pub error: Option<String>,
    pub credits_used: i64,
    pub completed_at: DateTime<Utc>,
}

impl RunUpdate {
    /// Top-level fields to merge into a stored run record.
    pub fn to_patch(&self) -> Result<Value, serde_json::Error> {
        let mut patch = Map::new();
        patch.insert("status".into(), serde_json::to_value(self.status)?);
        patch.insert("output".into(), serde_json::to_value(&self.output)?);
        patch.insert(
            "error".into(),
            self.error.clone().map(Value::String).unwrap_or(Value::Null),
        );
        patch.insert("promptTokens".into(), self.usage.prompt_tokens.into());
        patch.insert(
            "completionTokens".into(),
            self.usage.completion_tokens.into(),
        );
        patch.insert("totalTokens".into(), self.usage.total_tokens.into());
        patch.insert("creditsUsed".into(), self.credits_used.into());
        patch.insert(
            "completedAt".into(),
            serde_json::to_value(self.completed_at)?,
        );
        Ok(Value::Object(patch))
    }
}
