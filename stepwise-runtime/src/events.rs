//! Run event protocol and the channel that carries it to the transport.
//!
//! One producer (the step driver) writes through an [`EventSink`]; one
//! consumer (the transport) reads the paired receiver. A full buffer makes
//! the producer wait; a closed one is treated as the client going away and
//! cancels the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle state of one tool invocation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ToolStatus::Running)
    }
}

/// One line of the event stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        session_id: String,
        run_id: String,
        display_name: String,
        timestamp: DateTime<Utc>,
    },
    Reasoning {
        delta: String,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        delta: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Tool {
        call_id: String,
        tool_name: String,
        status: ToolStatus,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        step_index: u32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CreditsUsed {
        credits_used: i64,
        balance_after: i64,
        total_tokens: u64,
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        final_text: String,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn start(session_id: &str, run_id: &str, display_name: &str) -> Self {
        RunEvent::Start {
            session_id: session_id.to_string(),
            run_id: run_id.to_string(),
            display_name: display_name.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn reasoning(delta: impl Into<String>) -> Self {
        RunEvent::Reasoning {
            delta: delta.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(delta: impl Into<String>) -> Self {
        RunEvent::Assistant {
            delta: delta.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn tool_running(call_id: &str, tool_name: &str, input: Value, step_index: u32) -> Self {
        RunEvent::Tool {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            status: ToolStatus::Running,
            input,
            output: None,
            step_index,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_finished(
        call_id: &str,
        tool_name: &str,
        status: ToolStatus,
        input: Value,
        output: Value,
        step_index: u32,
    ) -> Self {
        RunEvent::Tool {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            status,
            input,
            output: Some(output),
            step_index,
            timestamp: Utc::now(),
        }
    }

    pub fn credits_used(credits_used: i64, balance_after: i64, total_tokens: u64) -> Self {
        RunEvent::CreditsUsed {
            credits_used,
            balance_after,
            total_tokens,
            timestamp: Utc::now(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        RunEvent::Error {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn complete(final_text: impl Into<String>) -> Self {
        RunEvent::Complete {
            final_text: final_text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Start { .. } => "start",
            RunEvent::Reasoning { .. } => "reasoning",
            RunEvent::Assistant { .. } => "assistant",
            RunEvent::Tool { .. } => "tool",
            RunEvent::CreditsUsed { .. } => "credits_used",
            RunEvent::Error { .. } => "error",
            RunEvent::Complete { .. } => "complete",
        }
    }

    /// Serialize as one newline-terminated JSON record.
    pub fn to_ndjson_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// How long a write may wait for buffer space once the run is stopping.
pub const STOPPING_WRITE_GRACE: Duration = Duration::from_secs(2);

/// Producer half of the event channel.
pub struct EventSink {
    tx: Option<mpsc::Sender<RunEvent>>,
    cancel: CancellationToken,
}

/// Create a bounded event channel tied to a run's cancellation token.
pub fn event_channel(
    capacity: usize,
    cancel: CancellationToken,
) -> (EventSink, mpsc::Receiver<RunEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx: Some(tx), cancel }, rx)
}

impl EventSink {
    /// Write one event, waiting for buffer space while the reader catches up.
    ///
    /// A dropped receiver is the client going away: the first such write
    /// cancels the run and closes the sink. Once the run is stopping, a
    /// reader that makes no room within [`STOPPING_WRITE_GRACE`] loses the
    /// event instead of holding the run open.
    pub async fn emit(&mut self, event: RunEvent) -> bool {
        let delivered = {
            let Some(tx) = &self.tx else {
                return false;
            };

            let reserved = tokio::select! {
                biased;
                permit = tx.reserve() => Some(permit),
                _ = self.cancel.cancelled() => None,
            };
            let permit = match reserved {
                Some(permit) => permit,
                None => match tokio::time::timeout(STOPPING_WRITE_GRACE, tx.reserve()).await {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!(kind = event.kind(), "Event reader stalled while stopping, event dropped");
                        return false;
                    }
                },
            };

            match permit {
                Ok(permit) => {
                    permit.send(event);
                    true
                }
                Err(_) => false,
            }
        };

        if !delivered {
            debug!("Event reader gone, cancelling run");
            self.tx = None;
            self.cancel.cancel();
        }
        delivered
    }

    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Write the terminal event and close the channel.
    pub async fn finish(mut self, terminal: RunEvent) -> bool {
        self.emit(terminal).await
    }
}
