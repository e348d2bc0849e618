use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),
}

/// Receipt for one run's deduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRecord {
    pub run_id: String,
    pub user_id: String,
    pub credits: i64,
    pub total_tokens: u64,
    pub balance_after: i64,
    /// True when the run had already been charged and this is the original receipt.
    pub duplicate: bool,
}

/// Prepaid credit balances and the per-run charge journal.
pub struct CreditLedger {
    conn: Mutex<Connection>,
}

impl CreditLedger {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, LedgerError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS charges (
                run_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                credits INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                balance_after INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_charges_user ON charges(user_id)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Current balance; unknown accounts hold zero credits.
    pub fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        let conn = self.conn.lock();
        let balance = conn
            .query_row(
                "SELECT balance FROM accounts WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    /// Add credits to an account, creating it if needed. Returns the new balance.
    pub fn grant(&self, user_id: &str, credits: i64) -> Result<i64, LedgerError> {
        if credits <= 0 {
            return Err(LedgerError::InvalidAmount(credits));
        }
        let now = chrono::Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let balance = apply_delta(&tx, user_id, credits, &now)?;
        tx.commit()?;
        Ok(balance)
    }

    /// Deduct credits for a run. A run is charged at most once: repeating
    /// the call returns the original receipt with `duplicate` set.
    pub fn deduct(
        &self,
        user_id: &str,
        run_id: &str,
        credits: i64,
        total_tokens: u64,
    ) -> Result<ChargeRecord, LedgerError> {
        if credits < 0 {
            return Err(LedgerError::InvalidAmount(credits));
        }
        let now = chrono::Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(mut existing) = find_charge(&tx, run_id)? {
            existing.duplicate = true;
            return Ok(existing);
        }

        let balance_after = apply_delta(&tx, user_id, -credits, &now)?;
        tx.execute(
            "INSERT INTO charges (run_id, user_id, credits, total_tokens, balance_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run_id, user_id, credits, total_tokens as i64, balance_after, now],
        )?;
        tx.commit()?;

        Ok(ChargeRecord {
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
            credits,
            total_tokens,
            balance_after,
            duplicate: false,
        })
    }

    pub fn charge_for_run(&self, run_id: &str) -> Result<Option<ChargeRecord>, LedgerError> {
        let conn = self.conn.lock();
        find_charge(&conn, run_id)
    }
}

fn apply_delta(conn: &Connection, user_id: &str, delta: i64, now: &str) -> Result<i64, LedgerError> {
    conn.execute(
        "INSERT INTO accounts (user_id, balance, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
            balance = balance + excluded.balance,
            updated_at = excluded.updated_at",
        params![user_id, delta, now],
    )?;
    let balance = conn.query_row(
        "SELECT balance FROM accounts WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(balance)
}

fn find_charge(conn: &Connection, run_id: &str) -> Result<Option<ChargeRecord>, LedgerError> {
    let record = conn
        .query_row(
            "SELECT run_id, user_id, credits, total_tokens, balance_after
             FROM charges WHERE run_id = ?1",
            params![run_id],
            |row| {
                let total_tokens: i64 = row.get(3)?;
                Ok(ChargeRecord {
                    run_id: row.get(0)?,
                    user_id: row.get(1)?,
                    credits: row.get(2)?,
                    total_tokens: total_tokens.max(0) as u64,
                    balance_after: row.get(4)?,
                    duplicate: false,
                })
            },
        )
        .optional()?;
    Ok(record)
}
