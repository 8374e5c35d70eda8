//! Classification of store failures into retryable conflicts.
//!
//! Serialization failures surface differently per database: PostgreSQL reports
//! SQLSTATE `40001`, CockroachDB additionally phrases it as "restart
//! transaction", and drivers sometimes wrap the real cause inside a secondary
//! (suppressed) error raised during rollback. The classifier is the single
//! place that knows these signatures; everything else sees either
//! `EngineError::TransactionRetry` or a fatal error.

use std::error::Error as StdError;

use super::r#trait::StoreError;

pub trait ConflictClassifier: Send + Sync {
    /// True when `error` (or anything it wraps) signals a serialization conflict.
    fn is_retryable(&self, error: &StoreError) -> bool;
}

/// Matches SQLSTATE codes and message fragments from configuration.
#[derive(Debug, Clone)]
pub struct SqlStateClassifier {
    codes: Vec<String>,
    message_patterns: Vec<String>,
}

impl Default for SqlStateClassifier {
    fn default() -> Self {
        Self::new(vec!["40001".to_string()], vec!["restart transaction".to_string()])
    }
}

impl SqlStateClassifier {
    pub fn new(codes: Vec<String>, message_patterns: Vec<String>) -> Self {
        Self {
            codes,
            message_patterns: message_patterns
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    fn matches_message(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.message_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && message.contains(pattern.as_str()))
    }

    fn matches(&self, error: &StoreError) -> bool {
        if let Some(code) = error.code() {
            if self.codes.iter().any(|c| c == code) {
                return true;
            }
        }
        if self.matches_message(&error.to_string()) {
            return true;
        }
        if error.suppressed().iter().any(|s| self.matches(s)) {
            return true;
        }

        let mut source = StdError::source(error);
        while let Some(cause) = source {
            if self.matches_message(&cause.to_string()) {
                return true;
            }
            source = cause.source();
        }
        false
    }
}

impl ConflictClassifier for SqlStateClassifier {
    fn is_retryable(&self, error: &StoreError) -> bool {
        self.matches(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_configured_sqlstate() {
        let classifier = SqlStateClassifier::default();
        assert!(classifier.is_retryable(&StoreError::database(Some("40001"), "could not serialize access")));
        assert!(!classifier.is_retryable(&StoreError::database(Some("23505"), "duplicate key")));
    }

    #[test]
    fn matches_message_fragment_case_insensitively() {
        let classifier = SqlStateClassifier::default();
        let err = StoreError::Connection("TransactionRetryError: RESTART TRANSACTION".into());
        assert!(classifier.is_retryable(&err));
        assert!(!classifier.is_retryable(&StoreError::Connection("connection refused".into())));
    }

    #[test]
    fn inspects_nested_suppressed_errors() {
        let classifier = SqlStateClassifier::default();
        let cause = StoreError::database(Some("40001"), "serialization failure");
        let err = StoreError::database(Some("08006"), "connection lost during commit")
            .with_suppressed(StoreError::Decode("noise".into()))
            .with_suppressed(StoreError::database(None, "rollback failed").with_suppressed(cause));
        assert!(classifier.is_retryable(&err));
    }

    #[test]
    fn signatures_come_from_configuration() {
        let classifier = SqlStateClassifier::new(vec!["40P01".into()], vec![]);
        assert!(classifier.is_retryable(&StoreError::database(Some("40P01"), "deadlock detected")));
        assert!(!classifier.is_retryable(&StoreError::database(Some("40001"), "restart transaction")));
    }
}
