use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use stepwise_runtime::{CreditPricing, LaneBudgets, SessionSettings};

pub const ENDPOINT_ENV: &str = "STEPWISE_LLM_ENDPOINT";
pub const MODEL_ENV: &str = "STEPWISE_LLM_MODEL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub workflows_dir: PathBuf,
    /// Prometheus scrape address; only used with the `prometheus` feature.
    pub metrics_addr: Option<SocketAddr>,
    pub model: ModelSection,
    pub limits: LimitsSection,
    pub pricing: PricingSection,
    pub budgets: LaneBudgets,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("./data"),
            agents_dir: PathBuf::from("./agents"),
            workflows_dir: PathBuf::from("./workflows"),
            metrics_addr: None,
            model: ModelSection::default(),
            limits: LimitsSection::default(),
            pricing: PricingSection::default(),
            budgets: LaneBudgets::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Base URL of an OpenAI-compatible API, without `/chat/completions`.
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_retries: u32,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_retries: 2,
        }
    }
}

impl ModelSection {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub tool_timeout_ms: u64,
    pub max_concurrent_runs: usize,
    pub event_buffer: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let defaults = SessionSettings::default();
        Self {
            tool_timeout_ms: defaults.tool_timeout_ms,
            max_concurrent_runs: defaults.max_concurrent_runs,
            event_buffer: defaults.event_buffer,
        }
    }
}

impl From<LimitsSection> for SessionSettings {
    fn from(limits: LimitsSection) -> Self {
        SessionSettings {
            tool_timeout_ms: limits.tool_timeout_ms,
            max_concurrent_runs: limits.max_concurrent_runs,
            event_buffer: limits.event_buffer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PricingSection {
    pub tokens_per_credit: u64,
    pub minimum_charge: i64,
}

impl Default for PricingSection {
    fn default() -> Self {
        let defaults = CreditPricing::default();
        Self {
            tokens_per_credit: defaults.tokens_per_credit,
            minimum_charge: defaults.minimum_charge,
        }
    }
}

impl From<PricingSection> for CreditPricing {
    fn from(pricing: PricingSection) -> Self {
        CreditPricing {
            tokens_per_credit: pricing.tokens_per_credit,
            minimum_charge: pricing.minimum_charge,
        }
    }
}

impl ServerConfig {
    /// Read the TOML file at `path`, falling back to defaults when it does
    /// not exist, then apply the environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        Ok(config.with_overrides(
            std::env::var(ENDPOINT_ENV).ok(),
            std::env::var(MODEL_ENV).ok(),
        ))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_overrides(mut self, endpoint: Option<String>, model: Option<String>) -> Self {
        if let Some(endpoint) = endpoint.filter(|e| !e.trim().is_empty()) {
            self.model.endpoint = endpoint;
        }
        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            self.model.model = model;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.limits.max_concurrent_runs == 0 {
            anyhow::bail!("limits.max_concurrent_runs must be at least 1");
        }
        if self.limits.event_buffer == 0 {
            anyhow::bail!("limits.event_buffer must be at least 1");
        }
        if self.pricing.tokens_per_credit == 0 {
            anyhow::bail!("pricing.tokens_per_credit must be at least 1");
        }
        Ok(())
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }
}
