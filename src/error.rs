//! Error taxonomy for loading, validating and saving line items.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Shown when the backend rejects a save without a message of its own
pub const GENERIC_SAVE_ERROR: &str = "An error occurred while saving changes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    Network,
    Unauthorized,
    Validation,
    NotFound,
    Internal,
}

/// Failure reported by the record store
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?} backend error: {}", .message.as_deref().unwrap_or("no message"))]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: Option<String>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn without_message(kind: BackendErrorKind) -> Self {
        Self { kind, message: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Internal, message)
    }

    /// Backend-supplied message, or the generic fallback
    pub fn user_message(&self) -> &str {
        self.message.as_deref().unwrap_or(GENERIC_SAVE_ERROR)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("parent id must not be empty")]
    InvalidParent,

    #[error("failed to load line items: {0}")]
    Backend(#[from] BackendError),

    #[error("load timed out after {0:?}")]
    Timeout(Duration),
}

impl LoadError {
    pub fn user_message(&self) -> String {
        match self {
            LoadError::Backend(e) => e
                .message
                .clone()
                .unwrap_or_else(|| "Unable to load line items".to_string()),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Total cost ({total_cost:.2}) must equal reference amount ({reference_total:.2})")]
    Unbalanced { total_cost: f64, reference_total: f64 },

    #[error("this table is read-only")]
    ReadOnly,

    #[error("there are no pending changes to save")]
    NoChanges,

    #[error("nothing is loaded yet")]
    NotLoaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cost {input:?} for row {row_id}")]
pub struct ParseError {
    pub row_id: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpdateError {
    #[error("update rejected: {}", .0.user_message())]
    Rejected(BackendError),

    /// Sequential strategy stopped part-way; earlier rows stay persisted
    #[error(
        "saved {} row(s) before row {failed} failed: {message}",
        .persisted.len()
    )]
    Partial {
        persisted: Vec<String>,
        failed: String,
        not_attempted: Vec<String>,
        message: String,
    },

    #[error("update timed out after {0:?}")]
    Timeout(Duration),
}

impl UpdateError {
    pub fn user_message(&self) -> String {
        match self {
            UpdateError::Rejected(e) => e.user_message().to_string(),
            UpdateError::Partial {
                persisted,
                failed,
                not_attempted,
                message,
            } => {
                let mut text = format!("{} (row {} failed", message, failed);
                if !persisted.is_empty() {
                    text.push_str(&format!("; saved: {}", persisted.join(", ")));
                }
                if !not_attempted.is_empty() {
                    text.push_str(&format!("; not attempted: {}", not_attempted.join(", ")));
                }
                text.push(')');
                text
            }
            UpdateError::Timeout(_) => self.to_string(),
        }
    }
}

/// Anything a table operation can fail with
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    /// Another save or refresh is in flight
    #[error("another operation is already in progress")]
    Busy,
}

impl LedgerError {
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::Load(e) => e.user_message(),
            LedgerError::Update(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
