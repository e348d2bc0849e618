use crate::config::ServerConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use stepwise_infra::{CreditLedger, RunStore};
use stepwise_runtime::{
    FileRunRecorder, LaneCatalog, LedgerCreditMeter, OpenAiStreamClient, SessionEntry,
};
use stepwise_tools::builtin_registry;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub entry: Arc<SessionEntry>,
}

impl AppState {
    pub fn new(entry: Arc<SessionEntry>) -> Self {
        Self { entry }
    }

    /// Wire the production collaborators described by `config`.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

        let store = RunStore::new(config.runs_dir()).context("Failed to open run store")?;
        let ledger = open_ledger(config)?;

        let mut client = OpenAiStreamClient::new(
            config.model.endpoint.clone(),
            config.model.model.clone(),
            config.model.max_retries,
        );
        match config.model.api_key() {
            Some(key) => client = client.with_api_key(key),
            None => tracing::warn!(
                env = %config.model.api_key_env,
                "No API key found, model requests are sent unauthenticated"
            ),
        }

        let catalog = LaneCatalog::new(config.budgets)
            .with_agents_dir(&config.agents_dir)
            .with_workflows_dir(&config.workflows_dir);

        let entry = SessionEntry::new(
            Arc::new(client),
            Arc::new(builtin_registry()),
            Arc::new(FileRunRecorder::new(Arc::new(store))),
            Arc::new(LedgerCreditMeter::new(ledger, config.pricing.into())),
            catalog,
            config.limits.into(),
        );

        tracing::info!(
            endpoint = %config.model.endpoint,
            model = %config.model.model,
            data_dir = %config.data_dir.display(),
            "Session entry ready"
        );
        Ok(Self::new(Arc::new(entry)))
    }
}

pub fn open_ledger(config: &ServerConfig) -> Result<Arc<CreditLedger>> {
    let path = config.ledger_path();
    let ledger = CreditLedger::new(&path)
        .with_context(|| format!("Failed to open credit ledger at {}", path.display()))?;
    Ok(Arc::new(ledger))
}
