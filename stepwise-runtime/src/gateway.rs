//! Gateway for session resolution.

use crate::interfaces::RuntimeError;
use crate::run::Lane;

/// Resolve the session a run belongs to.
///
/// A supplied id is used as-is after validation; without one a fresh
/// `<lane>:<uuid>` id is generated.
///
/// # Errors
/// Returns error if the supplied id is empty or contains path characters
pub fn resolve_session(lane: Lane, requested: Option<&str>) -> Result<String, RuntimeError> {
    match requested {
        None => Ok(format!("{}:{}", lane, uuid::Uuid::new_v4())),
        Some(id) => {
            let id = id.trim();
            if id.is_empty() {
                return Err(RuntimeError::SessionError(
                    "sessionId must be non-empty".to_string(),
                ));
            }
            if id.contains("..") || id.contains('/') || id.contains('\\') {
                return Err(RuntimeError::SessionError(
                    "sessionId contains path characters".to_string(),
                ));
            }
            Ok(id.to_string())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_session_is_lane_prefixed() {
        let session = resolve_session(Lane::Assistant, None).unwrap();
        assert!(session.starts_with("assistant:"));
        assert_eq!(session.len(), "assistant:".len() + 36);
    }

    #[test]
    fn test_generated_sessions_differ() {
        let a = resolve_session(Lane::Builder, None).unwrap();
        let b = resolve_session(Lane::Builder, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_supplied_session_is_kept() {
        assert_eq!(
            resolve_session(Lane::Workflow, Some("chat-42")).unwrap(),
            "chat-42"
        );
        assert_eq!(
            resolve_session(Lane::Builder, Some("user@example.com")).unwrap(),
            "user@example.com"
        );
    }

    #[test]
    fn test_empty_session_raises_error() {
        let result = resolve_session(Lane::Builder, Some("  "));
        match result {
            Err(RuntimeError::SessionError(msg)) => {
                assert!(msg.contains("non-empty"));
            }
            _ => panic!("Expected SessionError"),
        }
    }

    #[test]
    fn test_path_characters_rejected() {
        assert!(resolve_session(Lane::Builder, Some("../etc")).is_err());
        assert!(resolve_session(Lane::Builder, Some("a/b")).is_err());
        assert!(resolve_session(Lane::Builder, Some("a\\b")).is_err());
    }
}
