//! Stepwise Runtime Core
//!
//! Drives tool-calling model conversations for every lane, streaming each
//! step as an event and settling budget, credits and run records at the end.

pub mod types;
pub mod interfaces;
pub mod run;
pub mod budget;
pub mod events;
pub mod credit;
pub mod gateway;
pub mod lane_config;
pub mod llm_client;
pub mod step_driver;
pub mod session;
pub mod async_adapters;
pub mod metrics;

pub use types::{Fragment, Message, Role, TokenUsage, ToolCallRequest, SCHEMA_VERSION};
pub use interfaces::{
    AdmissionError, ChargeReceipt, CreditMeter, FragmentStream, ModelCapability, ModelRequest,
    RunRecorder, RuntimeError,
};
pub use run::{Lane, Run, RunOutput, RunStatus, RunUpdate, ToolInvocation};
pub use budget::{check_admission, BudgetTracker, Identity};
pub use events::{event_channel, EventSink, RunEvent, ToolStatus};
pub use credit::CreditPricing;
pub use gateway::resolve_session;
pub use lane_config::{
    load_agent_definition, load_workflow_definition, AgentDefinition, LaneBudgets, LaneCatalog,
    LaneConfig, LaneTarget, WorkflowDefinition,
};
pub use llm_client::OpenAiStreamClient;
pub use step_driver::{DriverConfig, RunOutcome, StepDriver, USER_STOP_MESSAGE};
pub use session::{RunHandle, RunRequest, SessionEntry, SessionSettings};
pub use async_adapters::{FileRunRecorder, LedgerCreditMeter};
