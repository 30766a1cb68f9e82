//! Operation status
//!
//! Flat outcome values for callers that prefer a status code over a
//! `Result`, such as a binding layer.

use crate::error::{EmberError, Result};

/// Outcome of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    Conflict,
    Error { code: i32, message: String },
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Numeric code (0 for success)
    pub fn code(&self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::NotFound => EmberError::NotFound.code(),
            Status::Conflict => EmberError::Conflict.code(),
            Status::Error { code, .. } => *code,
        }
    }
}

/// Status plus the value a read produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub status: Status,
    pub value: Option<Vec<u8>>,
}

impl OpResult {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            value: None,
        }
    }

    pub fn found(value: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            value: Some(value),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            value: None,
        }
    }

    pub fn error(err: &EmberError) -> Self {
        Self {
            status: err.status(),
            value: None,
        }
    }
}

impl From<Result<()>> for OpResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => OpResult::ok(),
            Err(e) => OpResult::error(&e),
        }
    }
}

impl From<Result<Option<Vec<u8>>>> for OpResult {
    fn from(result: Result<Option<Vec<u8>>>) -> Self {
        match result {
            Ok(Some(value)) => OpResult::found(value),
            Ok(None) => OpResult::not_found(),
            Err(e) => OpResult::error(&e),
        }
    }
}

impl EmberError {
    pub fn status(&self) -> Status {
        match self {
            EmberError::NotFound => Status::NotFound,
            EmberError::Conflict => Status::Conflict,
            other => Status::Error {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}
