//! Scripted collaborators shared by the runtime integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stepwise_runtime::*;
use stepwise_tools::{FnTool, ToolAdapter, ToolError, ToolRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted model turn.
#[derive(Clone)]
pub struct Turn {
    pub fragments: Vec<Result<Fragment, String>>,
    /// Keep the stream open after the fragments instead of ending it.
    pub hang: bool,
}

impl Turn {
    pub fn text(text: &str) -> Self {
        Self {
            fragments: vec![Ok(Fragment::Text(text.to_string()))],
            hang: false,
        }
    }

    pub fn tool_calls(calls: &[(&str, &str, Value)]) -> Self {
        Self {
            fragments: calls
                .iter()
                .map(|(id, name, args)| {
                    Ok(Fragment::ToolCall(ToolCallRequest {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: args.clone(),
                    }))
                })
                .collect(),
            hang: false,
        }
    }

    pub fn with(mut self, fragment: Fragment) -> Self {
        self.fragments.push(Ok(fragment));
        self
    }

    pub fn failing_after(mut self, message: &str) -> Self {
        self.fragments.push(Err(message.to_string()));
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Model capability that replays pre-recorded turns.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Turn>>,
    /// Replayed forever once the script runs out.
    fallback: Option<Turn>,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(turn: Turn) -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            fallback: Some(turn),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelCapability for ScriptedModel {
    async fn stream(&self, request: ModelRequest) -> Result<FragmentStream, RuntimeError> {
        self.requests.lock().unwrap().push(request);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| RuntimeError::LLMError("script exhausted".to_string()))?;

        let items = futures::stream::iter(
            turn.fragments
                .into_iter()
                .map(|f| f.map_err(RuntimeError::LLMError))
                .collect::<Vec<_>>(),
        );
        if turn.hang {
            Ok(items.chain(futures::stream::pending()).boxed())
        } else {
            Ok(items.boxed())
        }
    }
}

/// Model capability whose stream never opens.
pub struct UnreachableModel;

#[async_trait]
impl ModelCapability for UnreachableModel {
    async fn stream(&self, _request: ModelRequest) -> Result<FragmentStream, RuntimeError> {
        Err(RuntimeError::LLMError("Network connection failed".to_string()))
    }
}

/// In-memory run recorder.
#[derive(Default)]
pub struct MemoryRecorder {
    pub runs: Mutex<Vec<Run>>,
    pub fail_updates: bool,
}

impl MemoryRecorder {
    pub fn failing() -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            fail_updates: true,
        }
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
    }
}

#[async_trait]
impl RunRecorder for MemoryRecorder {
    async fn create(&self, run: &Run) -> Result<String, RuntimeError> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(run.id.clone())
    }

    async fn update(&self, run_id: &str, update: &RunUpdate) -> Result<(), RuntimeError> {
        if self.fail_updates {
            return Err(RuntimeError::StoreError("disk full".to_string()));
        }
        let mut runs = self.runs.lock().unwrap();
        match runs.iter_mut().find(|r| r.id == run_id) {
            Some(run) => {
                run.apply(update);
                Ok(())
            }
            None => Err(RuntimeError::StoreError(format!("Run not found: {}", run_id))),
        }
    }

    async fn load(&self, run_id: &str) -> Result<Option<Run>, RuntimeError> {
        Ok(self.get(run_id))
    }

    async fn list_for_session(&self, session_id: &str) -> Result<Vec<Run>, RuntimeError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}

/// Credit meter that records every charge.
pub struct CountingMeter {
    pub balance: i64,
    pub charges: Mutex<Vec<(String, String, TokenUsage)>>,
    pub fail: bool,
}

impl CountingMeter {
    pub fn with_balance(balance: i64) -> Self {
        Self {
            balance,
            charges: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_balance(100)
        }
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }
}

#[async_trait]
impl CreditMeter for CountingMeter {
    async fn balance(&self, _user_id: &str) -> Result<i64, RuntimeError> {
        Ok(self.balance)
    }

    async fn charge(
        &self,
        user_id: &str,
        run_id: &str,
        usage: &TokenUsage,
    ) -> Result<ChargeReceipt, RuntimeError> {
        if self.fail {
            return Err(RuntimeError::CreditError("ledger offline".to_string()));
        }
        self.charges
            .lock()
            .unwrap()
            .push((user_id.to_string(), run_id.to_string(), *usage));
        let credits = CreditPricing::default().credits_for(usage);
        Ok(ChargeReceipt {
            credits_deducted: credits,
            balance_after: self.balance - credits,
        })
    }
}

/// Registry with an echoing `search` tool, a failing `flaky` tool and a
/// `counter` tool that counts its invocations.
pub fn test_registry(counter: Arc<AtomicUsize>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FnTool::new(
        "search",
        "Search the web",
        json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        |input| async move { Ok(json!({"results": [input["q"].clone()]})) },
    )));
    registry.register(Arc::new(FnTool::new(
        "flaky",
        "Always fails",
        json!({"type": "object"}),
        |_input| async move { Err(ToolError::ExecutionFailed("upstream 503".to_string())) },
    )));
    registry.register(Arc::new(FnTool::new(
        "counter",
        "Counts calls",
        json!({"type": "object"}),
        move |_input| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({"count": n}))
            }
        },
    )));
    registry
}

pub struct Harness {
    pub model: Arc<ScriptedModel>,
    pub recorder: Arc<MemoryRecorder>,
    pub meter: Arc<CountingMeter>,
    pub tools: Arc<ToolAdapter>,
    pub counter: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new(model: ScriptedModel) -> Self {
        Self::with_parts(model, MemoryRecorder::default(), CountingMeter::with_balance(100))
    }

    pub fn with_parts(model: ScriptedModel, recorder: MemoryRecorder, meter: CountingMeter) -> Self {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(test_registry(counter.clone()));
        Self {
            model: Arc::new(model),
            recorder: Arc::new(recorder),
            meter: Arc::new(meter),
            tools: Arc::new(ToolAdapter::new(registry, 1_000)),
            counter,
        }
    }

    pub fn with_tools(mut self, registry: ToolRegistry) -> Self {
        self.tools = Arc::new(ToolAdapter::new(Arc::new(registry), 1_000));
        self
    }

    pub async fn seed_run(&self, run_id: &str, identity: &Identity) {
        let run = Run::start(
            run_id,
            "session-1",
            Lane::Assistant,
            "Assistant",
            identity.user_id().map(str::to_string),
            json!("hi"),
        );
        self.recorder.create(&run).await.unwrap();
    }

    pub fn driver(&self, run_id: &str, identity: Identity, max_steps: u32, cancel: CancellationToken) -> StepDriver {
        StepDriver::new(
            DriverConfig {
                run_id: run_id.to_string(),
                session_id: "session-1".to_string(),
                lane: Lane::Assistant,
                display_name: "Assistant".to_string(),
                identity,
                system_prompt: "You are a test agent.".to_string(),
                max_steps,
                model: None,
            },
            self.model.clone(),
            self.tools.clone(),
            self.recorder.clone(),
            self.meter.clone(),
            cancel,
        )
    }

    /// Run to completion and return the outcome with every emitted event.
    pub async fn run(&self, identity: Identity, max_steps: u32) -> (RunOutcome, Vec<RunEvent>) {
        self.seed_run("run-1", &identity).await;
        let cancel = CancellationToken::new();
        let (sink, rx) = event_channel(1024, cancel.clone());
        let driver = self.driver("run-1", identity, max_steps, cancel);
        let outcome = driver.run(vec![Message::user("go")], sink).await;
        (outcome, drain(rx).await)
    }
}

pub async fn drain(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

pub fn tool_events(events: &[RunEvent], status: ToolStatus) -> Vec<&RunEvent> {
    events
        .iter()
        .filter(|e| matches!(e, RunEvent::Tool { status: s, .. } if *s == status))
        .collect()
}

pub fn finished_tool_count(events: &[RunEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RunEvent::Tool { status, .. } if status.is_finished()))
        .count()
}

pub fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::kind).collect()
}

pub fn terminal_error(events: &[RunEvent]) -> Option<&str> {
    match events.last() {
        Some(RunEvent::Error { error, .. }) => Some(error.as_str()),
        _ => None,
    }
}
