use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ItemId, Operation, TierStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Persistence,
    Integrity,
    Forbidden,
    NoSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssessmentError {
    #[error("control item {item_id} not found")]
    ItemNotFound { item_id: ItemId },
    #[error("subtask {subtask_id} not found on control item {item_id}")]
    SubtaskNotFound { item_id: ItemId, subtask_id: String },
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("integrity violation on control item {item_id}: {detail}")]
    Integrity { item_id: ItemId, detail: String },
    #[error("{operation} is not available on the {tier} tier")]
    TierDenied {
        operation: Operation,
        tier: TierStatus,
    },
    #[error("no active assessment session")]
    NoSession,
    #[error("session was superseded by a newer session")]
    SessionSuperseded,
}

impl AssessmentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AssessmentError::ItemNotFound { .. } | AssessmentError::SubtaskNotFound { .. } => {
                ErrorCode::NotFound
            }
            AssessmentError::Persistence(_) => ErrorCode::Persistence,
            AssessmentError::Integrity { .. } => ErrorCode::Integrity,
            AssessmentError::TierDenied { .. } => ErrorCode::Forbidden,
            AssessmentError::NoSession | AssessmentError::SessionSuperseded => {
                ErrorCode::NoSession
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }
}

/// Machine-readable error body for front ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&AssessmentError> for ErrorPayload {
    fn from(value: &AssessmentError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
