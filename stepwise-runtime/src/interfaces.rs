//! Contracts for the runtime's external collaborators.

use crate::run::{Run, RunUpdate};
use crate::types::{Fragment, Message, TokenUsage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Session error: {0}")]
    SessionError(String),

    #[error("LLM error: {0}")]
    LLMError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Credit error: {0}")]
    CreditError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Rejections raised before a run starts streaming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient credits: balance {balance}")]
    InsufficientCredits { balance: i64 },

    #[error("Runtime is not accepting runs")]
    Overloaded,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// HTTP status the transport answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionError::InvalidRequest(_) => 400,
            AdmissionError::Unauthenticated => 401,
            AdmissionError::InsufficientCredits { .. } => 402,
            AdmissionError::NotFound(_) => 404,
            AdmissionError::Internal(_) => 500,
            AdmissionError::Overloaded => 503,
        }
    }

    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::InvalidRequest(_) => "invalid_request",
            AdmissionError::Unauthenticated => "unauthenticated",
            AdmissionError::InsufficientCredits { .. } => "insufficient_credits",
            AdmissionError::NotFound(_) => "not_found",
            AdmissionError::Internal(_) => "internal_error",
            AdmissionError::Overloaded => "overloaded",
        }
    }
}

/// Everything the model needs for one turn.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    /// Tool schemas in OpenAI function format.
    pub tools: Vec<serde_json::Value>,
    /// Per-lane model override.
    pub model: Option<String>,
}

pub type FragmentStream = BoxStream<'static, Result<Fragment, RuntimeError>>;

/// Language-model completion capability.
#[async_trait]
pub trait ModelCapability: Send + Sync {
    /// Open a fragment stream for one model turn.
    async fn stream(&self, request: ModelRequest) -> Result<FragmentStream, RuntimeError>;
}

/// Run persistence interface.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    /// Persist a freshly started run and return its id.
    async fn create(&self, run: &Run) -> Result<String, RuntimeError>;

    /// Record the terminal state of a run.
    async fn update(&self, run_id: &str, update: &RunUpdate) -> Result<(), RuntimeError>;

    async fn load(&self, run_id: &str) -> Result<Option<Run>, RuntimeError>;

    async fn list_for_session(&self, session_id: &str) -> Result<Vec<Run>, RuntimeError>;
}

/// Result of a successful deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub credits_deducted: i64,
    pub balance_after: i64,
}

/// Prepaid credit account interface.
#[async_trait]
pub trait CreditMeter: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64, RuntimeError>;

    /// Convert `usage` to credits and deduct them for `run_id`.
    async fn charge(
        &self,
        user_id: &str,
        run_id: &str,
        usage: &TokenUsage,
    ) -> Result<ChargeReceipt, RuntimeError>;
}
