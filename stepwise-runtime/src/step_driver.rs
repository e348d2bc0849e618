//! Step driver - drives one run from first model turn to terminal event.

use crate::budget::{BudgetTracker, Identity};
use crate::events::{EventSink, RunEvent, ToolStatus};
use crate::interfaces::{ChargeReceipt, CreditMeter, ModelCapability, ModelRequest, RunRecorder};
use crate::metrics::{self, MetricTimer};
use crate::run::{Lane, RunOutput, RunStatus, RunUpdate, ToolInvocation};
use crate::types::{Fragment, Message, TokenUsage, ToolCallRequest};
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use stepwise_tools::ToolAdapter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message of the terminal event for runs stopped by the caller.
pub const USER_STOP_MESSAGE: &str = "Run stopped by user.";

/// Lane-specific parameters for one run.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub run_id: String,
    pub session_id: String,
    pub lane: Lane,
    pub display_name: String,
    pub identity: Identity,
    pub system_prompt: String,
    pub max_steps: u32,
    pub model: Option<String>,
}

/// What the driver hands back once the terminal event is written.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: RunOutput,
    pub usage: TokenUsage,
    pub error: Option<String>,
    pub charge: Option<ChargeReceipt>,
}

enum Termination {
    Answered,
    BudgetExhausted,
    Cancelled,
    Failed(String),
}

enum TurnEnd {
    /// Stream ended; carries whether any tool was invoked this turn.
    Finished { invoked_tools: bool },
    /// The model asked for a tool after the budget ran out.
    Overrun,
    Cancelled,
    Failed(String),
}

/// Accumulators for one run.
struct RunState {
    budget: BudgetTracker,
    usage: TokenUsage,
    final_text: String,
    reasoning: String,
    invocations: Vec<ToolInvocation>,
}

/// Executes the model/tool loop for a single run.
pub struct StepDriver {
    config: DriverConfig,
    model: Arc<dyn ModelCapability>,
    tools: Arc<ToolAdapter>,
    recorder: Arc<dyn RunRecorder>,
    meter: Arc<dyn CreditMeter>,
    cancel: CancellationToken,
}

impl StepDriver {
    pub fn new(
        config: DriverConfig,
        model: Arc<dyn ModelCapability>,
        tools: Arc<ToolAdapter>,
        recorder: Arc<dyn RunRecorder>,
        meter: Arc<dyn CreditMeter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            model,
            tools,
            recorder,
            meter,
            cancel,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Drive the run to completion.
    ///
    /// Never fails: model errors, tool failures, persistence and metering
    /// problems all end up as run state or log lines. The terminal event is
    /// always the last thing written to `sink`.
    pub async fn run(self, mut conversation: Vec<Message>, mut sink: EventSink) -> RunOutcome {
        let _timer = MetricTimer::new("run_duration");
        let run_id = self.config.run_id.clone();
        info!(
            run_id = %run_id,
            session_id = %self.config.session_id,
            lane = %self.config.lane,
            max_steps = self.config.max_steps,
            "Starting run"
        );

        let mut state = RunState {
            budget: BudgetTracker::new(self.config.max_steps),
            usage: TokenUsage::default(),
            final_text: String::new(),
            reasoning: String::new(),
            invocations: Vec::new(),
        };

        sink.emit(RunEvent::start(
            &self.config.session_id,
            &run_id,
            &self.config.display_name,
        )).await;

        let tool_schemas = self.tools.registry().schemas();
        let mut turn = 0usize;

        let termination = loop {
            if self.cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            turn += 1;
            debug!(run_id = %run_id, turn, steps_used = state.budget.steps_used(), "Model turn");

            let request = ModelRequest {
                system_prompt: self.config.system_prompt.clone(),
                messages: conversation.clone(),
                tools: tool_schemas.clone(),
                model: self.config.model.clone(),
            };

            match self.drive_turn(request, &mut conversation, &mut state, &mut sink).await {
                TurnEnd::Finished { invoked_tools: false } => break Termination::Answered,
                TurnEnd::Finished { invoked_tools: true } => {
                    if self.cancel.is_cancelled() {
                        break Termination::Cancelled;
                    }
                    // The exhausted budget still allows one more turn to answer.
                }
                TurnEnd::Overrun => break Termination::BudgetExhausted,
                TurnEnd::Cancelled => break Termination::Cancelled,
                TurnEnd::Failed(message) => break Termination::Failed(message),
            }
        };

        self.finalize(termination, state, sink).await
    }

    /// One model turn: stream fragments, invoke tools in order, then commit
    /// the assistant turn and its tool responses to the conversation.
    async fn drive_turn(
        &self,
        request: ModelRequest,
        conversation: &mut Vec<Message>,
        state: &mut RunState,
        sink: &mut EventSink,
    ) -> TurnEnd {
        let _timer = MetricTimer::new("model_turn_latency");

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return TurnEnd::Cancelled,
            opened = self.model.stream(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                error!(run_id = %self.config.run_id, error = %e, "Model stream failed to open");
                return TurnEnd::Failed(e.to_string());
            }
        };

        let mut turn_text = String::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();
        let mut responses: Vec<Message> = Vec::new();
        let mut overrun = false;

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break TurnEnd::Cancelled,
                next = stream.next() => next,
            };

            let fragment = match next {
                None => {
                    break if overrun {
                        TurnEnd::Overrun
                    } else {
                        TurnEnd::Finished {
                            invoked_tools: !calls.is_empty(),
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(run_id = %self.config.run_id, error = %e, "Model stream broke");
                    break TurnEnd::Failed(e.to_string());
                }
                Some(Ok(fragment)) => fragment,
            };

            match fragment {
                Fragment::Reasoning(delta) => {
                    state.reasoning.push_str(&delta);
                    sink.emit(RunEvent::reasoning(delta)).await;
                }
                Fragment::Text(delta) => {
                    state.final_text.push_str(&delta);
                    turn_text.push_str(&delta);
                    sink.emit(RunEvent::assistant(delta)).await;
                }
                Fragment::Usage(usage) => state.usage.add(&usage),
                Fragment::ToolCall(call) => {
                    if overrun || state.budget.is_exhausted() {
                        warn!(
                            run_id = %self.config.run_id,
                            tool = %call.name,
                            steps_used = state.budget.steps_used(),
                            "Tool call refused, step budget exhausted"
                        );
                        overrun = true;
                        continue;
                    }

                    match self.invoke_tool(&call, state, sink).await {
                        Some(response) => {
                            calls.push(call);
                            responses.push(response);
                        }
                        None => break TurnEnd::Cancelled,
                    }

                    if self.cancel.is_cancelled() {
                        break TurnEnd::Cancelled;
                    }
                }
            }
        };

        if !turn_text.is_empty() || !calls.is_empty() {
            conversation.push(Message::assistant_with_tools(turn_text, calls));
            conversation.extend(responses);
        }
        end
    }

    /// Invoke one tool and emit its running/finished pair.
    ///
    /// Returns the tool-response turn, or `None` if the run was cancelled
    /// while the tool was in flight.
    async fn invoke_tool(
        &self,
        call: &ToolCallRequest,
        state: &mut RunState,
        sink: &mut EventSink,
    ) -> Option<Message> {
        let step_index = state.budget.steps_used();
        sink.emit(RunEvent::tool_running(
            &call.id,
            &call.name,
            call.arguments.clone(),
            step_index,
        )).await;

        let timer = MetricTimer::new("tool_execution_latency");
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            result = self.tools.invoke(
                &self.config.session_id,
                &self.config.run_id,
                &call.id,
                &call.name,
                call.arguments.clone(),
            ) => result,
        };
        drop(timer);

        let steps_used = state.budget.record_tool_completion();
        let output = result.to_value();
        let status = if result.success {
            ToolStatus::Completed
        } else {
            metrics::increment_tool_failures();
            ToolStatus::Error
        };
        debug!(
            run_id = %self.config.run_id,
            tool = %call.name,
            step_index,
            steps_used,
            success = result.success,
            "Tool finished"
        );

        state.invocations.push(ToolInvocation {
            call_id: call.id.clone(),
            name: call.name.clone(),
            state: status,
            input: call.arguments.clone(),
            output: result.output.clone(),
            error_message: result.error.clone(),
            step_index,
        });
        sink.emit(RunEvent::tool_finished(
            &call.id,
            &call.name,
            status,
            call.arguments.clone(),
            output.clone(),
            step_index,
        )).await;

        Some(Message::tool_response(&call.id, &output))
    }

    async fn finalize(self, termination: Termination, state: RunState, mut sink: EventSink) -> RunOutcome {
        let (status, error, terminal) = match termination {
            Termination::Cancelled => (
                RunStatus::Aborted,
                Some(USER_STOP_MESSAGE.to_string()),
                RunEvent::error(USER_STOP_MESSAGE),
            ),
            Termination::BudgetExhausted => {
                let message = state.budget.exhausted_message();
                (RunStatus::Error, Some(message.clone()), RunEvent::error(message))
            }
            Termination::Failed(message) => {
                (RunStatus::Error, Some(message.clone()), RunEvent::error(message))
            }
            Termination::Answered => (
                RunStatus::Completed,
                None,
                RunEvent::complete(state.final_text.clone()),
            ),
        };

        let charge = self.charge(&state.usage).await;
        if let (Some(receipt), false) = (charge, status == RunStatus::Aborted) {
            sink.emit(RunEvent::credits_used(
                receipt.credits_deducted,
                receipt.balance_after,
                state.usage.total_tokens,
            )).await;
        }

        let output = RunOutput {
            text: state.final_text,
            steps_used: state.budget.steps_used(),
            max_steps: state.budget.max_steps(),
            tool_invocations: state.invocations,
        };
        let update = RunUpdate {
            status,
            output: output.clone(),
            usage: state.usage,
            error: error.clone(),
            credits_used: charge.map(|c| c.credits_deducted).unwrap_or(0),
            completed_at: Utc::now(),
        };
        if let Err(e) = self.recorder.update(&self.config.run_id, &update).await {
            warn!(run_id = %self.config.run_id, error = %e, "Failed to record run outcome");
        }

        sink.finish(terminal).await;
        metrics::increment_runs_finished(self.config.lane, status);
        info!(
            run_id = %self.config.run_id,
            status = status.as_str(),
            steps_used = output.steps_used,
            total_tokens = state.usage.total_tokens,
            reasoning_chars = state.reasoning.len(),
            "Run finished"
        );

        RunOutcome {
            status,
            output,
            usage: state.usage,
            error,
            charge,
        }
    }

    /// Deduct credits once, for authenticated callers with nonzero usage.
    async fn charge(&self, usage: &TokenUsage) -> Option<ChargeReceipt> {
        let user_id = self.config.identity.user_id()?;
        if usage.total_tokens == 0 {
            return None;
        }
        match self.meter.charge(user_id, &self.config.run_id, usage).await {
            Ok(receipt) => {
                metrics::increment_credits_charged(receipt.credits_deducted);
                Some(receipt)
            }
            Err(e) => {
                error!(run_id = %self.config.run_id, user_id, error = %e, "Credit charge failed");
                None
            }
        }
    }
}

/// Build the opening conversation: prior turns followed by the new input.
pub fn initial_conversation(prior: Vec<Message>, input: Option<&Value>) -> Vec<Message> {
    let mut conversation = prior;
    if let Some(input) = input {
        let text = match input {
            Value::String(s) => s.clone(),
            Value::Null => return conversation,
            other => other.to_string(),
        };
        if !text.is_empty() {
            conversation.push(Message::user(text));
        }
    }
    conversation
}
