pub mod credit_ledger;
pub mod run_store;
