//! Step budget and credit admission.

use crate::interfaces::AdmissionError;

/// Who is asking for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Guest,
    User(String),
}

impl Identity {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(id) if !id.is_empty() => Identity::User(id.to_string()),
            _ => Identity::Guest,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::Guest => None,
            Identity::User(id) => Some(id),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest)
    }
}

/// Minimum balance an authenticated caller needs to start a run.
pub const MIN_ADMISSION_BALANCE: i64 = 1;

/// Guests are always admitted; users need at least one credit.
///
/// `balance` is ignored for guests and must be supplied for users.
pub fn check_admission(identity: &Identity, balance: Option<i64>) -> Result<(), AdmissionError> {
    match identity {
        Identity::Guest => Ok(()),
        Identity::User(_) => {
            let balance = balance.unwrap_or(0);
            if balance >= MIN_ADMISSION_BALANCE {
                Ok(())
            } else {
                Err(AdmissionError::InsufficientCredits { balance })
            }
        }
    }
}

/// Counts completed tool invocations against a fixed maximum.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    max_steps: u32,
    steps_used: u32,
}

impl BudgetTracker {
    pub fn new(max_steps: u32) -> Self {
        Self {
            max_steps,
            steps_used: 0,
        }
    }

    /// Count one finished tool invocation, successful or not.
    pub fn record_tool_completion(&mut self) -> u32 {
        self.steps_used = self.steps_used.saturating_add(1);
        self.steps_used
    }

    pub fn is_exhausted(&self) -> bool {
        self.steps_used >= self.max_steps
    }

    pub fn steps_used(&self) -> u32 {
        self.steps_used
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn exhausted_message(&self) -> String {
        format!(
            "Step limit reached after {} tool calls (max {}).",
            self.steps_used, self.max_steps
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_guest_always_admitted() {
        assert!(check_admission(&Identity::Guest, None).is_ok());
        assert!(check_admission(&Identity::Guest, Some(-5)).is_ok());
    }

    #[test]
    fn test_user_needs_one_credit() {
        let user = Identity::User("u1".into());
        assert!(check_admission(&user, Some(1)).is_ok());
        assert_eq!(
            check_admission(&user, Some(0)),
            Err(AdmissionError::InsufficientCredits { balance: 0 })
        );
        assert_eq!(
            check_admission(&user, None),
            Err(AdmissionError::InsufficientCredits { balance: 0 })
        );
    }

    #[test]
    fn test_identity_from_header() {
        assert_eq!(Identity::from_header(None), Identity::Guest);
        assert_eq!(Identity::from_header(Some("  ")), Identity::Guest);
        assert_eq!(
            Identity::from_header(Some(" alice ")),
            Identity::User("alice".into())
        );
    }

    #[test]
    fn test_exhaustion_message() {
        let mut budget = BudgetTracker::new(2);
        assert!(!budget.is_exhausted());
        assert_eq!(budget.record_tool_completion(), 1);
        assert_eq!(budget.record_tool_completion(), 2);
        assert!(budget.is_exhausted());
        assert_eq!(
            budget.exhausted_message(),
            "Step limit reached after 2 tool calls (max 2)."
        );
    }

    #[test]
    fn test_zero_budget_starts_exhausted() {
        assert!(BudgetTracker::new(0).is_exhausted());
    }

    proptest! {
        #[test]
        fn prop_exhausted_iff_used_reaches_max(max in 0u32..100, calls in 0u32..200) {
            let mut budget = BudgetTracker::new(max);
            for i in 0..calls {
                prop_assert_eq!(budget.record_tool_completion(), i + 1);
            }
            prop_assert_eq!(budget.is_exhausted(), calls >= max);
        }
    }
}
