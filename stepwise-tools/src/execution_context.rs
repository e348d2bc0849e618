use serde::{Deserialize, Serialize};

/// Per-invocation context handed to a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub session_id: String,
    pub run_id: String,
    pub call_id: String,
    pub timeout_ms: u64,
    pub invocation_ref: String,
}

impl ExecutionContext {
    pub fn new(session_id: String, run_id: String, call_id: String, timeout_ms: u64) -> Self {
        Self {
            session_id,
            run_id,
            call_id,
            timeout_ms,
            invocation_ref: uuid::Uuid::new_v4().to_string(),
        }
    }
}
