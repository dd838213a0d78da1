//! Progress reporting for long-running load and save operations

use crate::error::{ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// A step of the load or save pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressStatus {
    ReadingHeader,
    DerivingKey { done: u64, total: u64 },
    Decrypting,
    Parsing,
    Serializing,
    Encrypting,
    Writing,
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressStatus::ReadingHeader => write!(f, "Reading header"),
            ProgressStatus::DerivingKey { done, total } if *total > 0 => {
                write!(f, "Deriving key ({}%)", done.saturating_mul(100) / total)
            }
            ProgressStatus::DerivingKey { .. } => write!(f, "Deriving key"),
            ProgressStatus::Decrypting => write!(f, "Decrypting"),
            ProgressStatus::Parsing => write!(f, "Parsing"),
            ProgressStatus::Serializing => write!(f, "Serializing"),
            ProgressStatus::Encrypting => write!(f, "Encrypting"),
            ProgressStatus::Writing => write!(f, "Writing"),
        }
    }
}

/// Outcome of a background task as seen by the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_kind: None,
            message: None,
        }
    }

    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self {
                success: false,
                error_kind: Some(e.kind()),
                message: Some(e.to_string()),
            },
        }
    }
}

/// Receives status updates from the load/save pipeline
pub trait ProgressListener {
    fn on_status(&mut self, status: ProgressStatus);

    fn on_finish(&mut self, _result: &TaskResult) {}
}

/// Discards all progress
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressListener for NoProgress {
    fn on_status(&mut self, _status: ProgressStatus) {}
}

impl<F: FnMut(ProgressStatus)> ProgressListener for F {
    fn on_status(&mut self, status: ProgressStatus) {
        self(status)
    }
}
