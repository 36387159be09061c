//! # sluice-error
//!
//! Errors shared by the scheduler, the discovery engine and the HTTP layer.
//! A [`SluiceError`] is plain data: a stable `SLUICE-XXXX` code, a message,
//! and optionally structured context and a hint. It is `Clone` so one
//! deduplicated execution can hand the same outcome to every waiting caller.

mod code;
mod context;
mod convert;

pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SluiceError {
    pub code: ErrorCode,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// What the caller can change to make the next attempt succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl SluiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Lookup of a source id that is not configured.
    pub fn source_not_found(source_id: &str, available_sources: Vec<String>) -> Self {
        Self::new(
            ErrorCode::SourceNotFound,
            format!("Unknown data source '{}'", source_id),
        )
        .with_context(ErrorContext::SourceNotFound {
            source_id: source_id.to_string(),
            available_sources,
        })
    }

    /// A caller stopped waiting for `query_id` after `waited`.
    pub fn query_timeout(query_id: impl fmt::Display, waited: Duration) -> Self {
        Self::new(
            ErrorCode::QueryTimeout,
            format!("Query {} did not complete within {:?}", query_id, waited),
        )
    }

    /// Convert a caught panic payload into an `InternalPanic` error.
    pub fn panicked(what: &str, payload: &(dyn Any + Send)) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new(ErrorCode::InternalPanic, format!("{} panicked: {}", what, detail))
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Connection-category failures are transient, except for lookups that
    /// will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        self.code.category() == ErrorCategory::Connection
            && self.code != ErrorCode::SourceNotFound
            && self.code != ErrorCode::UnsupportedSourceType
    }

    /// Source the failure belongs to, when the context names one.
    pub fn source_id(&self) -> Option<&str> {
        match self.context.as_ref()? {
            ErrorContext::SourceNotFound { source_id, .. }
            | ErrorContext::Connection { source_id, .. }
            | ErrorContext::TableBatch { source_id, .. } => Some(source_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize SluiceError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }
}

impl fmt::Display for SluiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for SluiceError {}

pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_and_without_hint() {
        let err = SluiceError::new(ErrorCode::SyntaxError, "Unexpected token")
            .with_hint("Remove comma");
        assert_eq!(
            err.to_string(),
            "[SLUICE-2002] Unexpected token (Hint: Remove comma)"
        );
        assert_eq!(
            SluiceError::new(ErrorCode::InternalPanic, "Crash").to_string(),
            "[SLUICE-5003] Crash"
        );
    }

    #[test]
    fn test_source_not_found_names_alternatives() {
        let err = SluiceError::source_not_found("nope", vec!["shop".into(), "warehouse".into()]);
        assert_eq!(err.code, ErrorCode::SourceNotFound);
        assert_eq!(err.source_id(), Some("nope"));
        assert!(!err.is_transient());
        match err.context {
            Some(ErrorContext::SourceNotFound { available_sources, .. }) => {
                assert_eq!(available_sources, vec!["shop", "warehouse"])
            }
            other => panic!("unexpected context: {:?}", other),
        }
    }

    #[test]
    fn test_panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        let err = SluiceError::panicked("Query executor", payload.as_ref());
        assert_eq!(err.code, ErrorCode::InternalPanic);
        assert_eq!(err.message, "Query executor panicked: boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert!(SluiceError::panicked("x", payload.as_ref()).message.ends_with("bang"));
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert!(SluiceError::panicked("x", payload.as_ref())
            .message
            .ends_with("unknown panic payload"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SluiceError::new(ErrorCode::ConnectionFailed, "reset").is_transient());
        assert!(SluiceError::new(ErrorCode::PoolExhausted, "busy").is_transient());
        assert!(!SluiceError::new(ErrorCode::UnsupportedSourceType, "x").is_transient());
        assert!(!SluiceError::new(ErrorCode::SyntaxError, "bad").is_transient());
        assert!(!SluiceError::query_timeout("q1", Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn test_source_id_only_from_source_contexts() {
        let err = SluiceError::new(ErrorCode::QueryFailed, "x").with_context(ErrorContext::Query {
            query_id: "q".into(),
            priority: "high".into(),
            batched: false,
        });
        assert_eq!(err.source_id(), None);
        assert_eq!(SluiceError::new(ErrorCode::QueryFailed, "x").source_id(), None);
    }
}
