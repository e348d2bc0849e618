//! Async adapters over the synchronous stores in `stepwise-infra`.

use crate::credit::CreditPricing;
use crate::interfaces::{ChargeReceipt, CreditMeter, RunRecorder, RuntimeError};
use crate::run::{Run, RunUpdate};
use crate::types::TokenUsage;
use async_trait::async_trait;
use std::sync::Arc;
use stepwise_infra::{CreditLedger, RunStore};
use tracing::debug;

/// Run recorder backed by the file-per-run store.
pub struct FileRunRecorder {
    inner: Arc<RunStore>,
}

impl FileRunRecorder {
    pub fn new(inner: Arc<RunStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RunRecorder for FileRunRecorder {
    async fn create(&self, run: &Run) -> Result<String, RuntimeError> {
        let inner = self.inner.clone();
        let record = serde_json::to_value(run)?;

        tokio::task::spawn_blocking(move || {
            inner
                .create(&record)
                .map_err(|e| RuntimeError::StoreError(e.to_string()))
        })
        .await
        .map_err(|e| RuntimeError::StoreError(e.to_string()))?
    }

    async fn update(&self, run_id: &str, update: &RunUpdate) -> Result<(), RuntimeError> {
        let inner = self.inner.clone();
        let id = run_id.to_string();
        let patch = update.to_patch()?;

        tokio::task::spawn_blocking(move || {
            inner
                .update(&id, &patch)
                .map(|_| ())
                .map_err(|e| RuntimeError::StoreError(e.to_string()))
        })
        .await
        .map_err(|e| RuntimeError::StoreError(e.to_string()))?
    }

    async fn load(&self, run_id: &str) -> Result<Option<Run>, RuntimeError> {
        let inner = self.inner.clone();
        let id = run_id.to_string();

        let record = tokio::task::spawn_blocking(move || {
            inner
                .load(&id)
                .map_err(|e| RuntimeError::StoreError(e.to_string()))
        })
        .await
        .map_err(|e| RuntimeError::StoreError(e.to_string()))??;

        record
            .map(serde_json::from_value)
            .transpose()
            .map_err(RuntimeError::from)
    }

    async fn list_for_session(&self, session_id: &str) -> Result<Vec<Run>, RuntimeError> {
        let inner = self.inner.clone();
        let id = session_id.to_string();

        let records = tokio::task::spawn_blocking(move || {
            inner
                .list_for_session(&id)
                .map_err(|e| RuntimeError::StoreError(e.to_string()))
        })
        .await
        .map_err(|e| RuntimeError::StoreError(e.to_string()))??;

        Ok(records
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }
}

/// Credit meter backed by the SQLite ledger.
pub struct LedgerCreditMeter {
    inner: Arc<CreditLedger>,
    pricing: CreditPricing,
}

impl LedgerCreditMeter {
    pub fn new(inner: Arc<CreditLedger>, pricing: CreditPricing) -> Self {
        Self { inner, pricing }
    }

    pub fn pricing(&self) -> CreditPricing {
        self.pricing
    }
}

#[async_trait]
impl CreditMeter for LedgerCreditMeter {
    async fn balance(&self, user_id: &str) -> Result<i64, RuntimeError> {
        let inner = self.inner.clone();
        let user = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            inner
                .balance(&user)
                .map_err(|e| RuntimeError::CreditError(e.to_string()))
        })
        .await
        .map_err(|e| RuntimeError::CreditError(e.to_string()))?
    }

    async fn charge(
        &self,
        user_id: &str,
        run_id: &str,
        usage: &TokenUsage,
    ) -> Result<ChargeReceipt, RuntimeError> {
        let inner = self.inner.clone();
        let user = user_id.to_string();
        let run = run_id.to_string();
        let credits = self.pricing.credits_for(usage);
        let total_tokens = usage.total_tokens;

        let record = tokio::task::spawn_blocking(move || {
            inner
                .deduct(&user, &run, credits, total_tokens)
                .map_err(|e| RuntimeError::CreditError(e.to_string()))
        })
        .await
        .map_err(|e| RuntimeError::CreditError(e.to_string()))??;

        if record.duplicate {
            debug!(run_id, "Run already charged, returning original receipt");
        }
        Ok(ChargeReceipt {
            credits_deducted: record.credits,
            balance_after: record.balance_after,
        })
    }
}
