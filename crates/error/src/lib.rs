//! # cirrus-error
//!
//! Unified error types for the cirrus remote-table engine.
//!
//! Every error carries:
//! - A numeric error code (CIRRUS-XXXX) grouped by failure class
//! - Optional structured context (request, statement, catalog object)
//! - An optional hint pointing at the supported alternative

mod code;
mod context;
mod convert;

pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hint attached to every rejected write or schema change on an attached database.
pub const RAW_SQL_HINT: &str =
    "use d1_execute(sql, secret, database_id) or a BEGIN ... COMMIT transaction";

/// The unified error type for all cirrus operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CirrusError {
    /// Numeric error code (e.g., "CIRRUS-2002")
    pub code: ErrorCode,

    /// Human-readable error message, including the remote's raw error text when there is one
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl CirrusError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
        }
    }

    /// A write, schema change or other operation the remote catalog refuses.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedOperation, operation).with_hint(RAW_SQL_HINT)
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Serialize to JSON for API responses
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize CirrusError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }
}

impl fmt::Display for CirrusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for CirrusError {}

/// Result type alias for cirrus operations
pub type Result<T> = std::result::Result<T, CirrusError>;
