//! Storage engines backing the stepwise runtime's external contracts.

pub mod infra;

pub use infra::credit_ledger::{ChargeRecord, CreditLedger, LedgerError};
pub use infra::run_store::{RunStore, RunStoreError};
