//! Wire status carried by backend RPC replies and status reports.
//!
//! Contract:
//! - a status is OK, CANCELLED, or an error with one or more messages;
//! - once non-OK it never goes back to OK (`update` keeps the first failure);
//! - per-target cancellation failures accumulate via `add_error_msg` without
//!   changing an already-failed code.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::KiteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
/// Status codes understood by every backend in the cluster.
pub enum StatusCode {
    /// Execution is (so far) successful.
    #[default]
    Ok,
    /// Execution was cancelled; not an error.
    Cancelled,
    /// Execution failed.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
/// Sticky execution status for one query or fragment instance.
pub struct ExecStatus {
    /// Current status code.
    pub code: StatusCode,
    /// Accumulated error messages, oldest first.
    pub error_msgs: Vec<String>,
}

impl ExecStatus {
    /// OK status.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Cancelled status.
    pub fn cancelled() -> Self {
        Self {
            code: StatusCode::Cancelled,
            error_msgs: Vec::new(),
        }
    }

    /// Error status with one message.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            error_msgs: vec![msg.into()],
        }
    }

    /// Returns whether the status is OK.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Returns whether the status is CANCELLED.
    pub fn is_cancelled(&self) -> bool {
        self.code == StatusCode::Cancelled
    }

    /// Adopts `other` only if this status is still OK.
    pub fn update(&mut self, other: &ExecStatus) {
        if self.is_ok() && !other.is_ok() {
            *self = other.clone();
        }
    }

    /// Appends an error message without promoting an OK/CANCELLED code to Error
    /// unless the status was OK.
    pub fn add_error_msg(&mut self, msg: impl Into<String>) {
        if self.is_ok() {
            self.code = StatusCode::Error;
        }
        self.error_msgs.push(msg.into());
    }

    /// Joined error messages.
    pub fn message(&self) -> String {
        self.error_msgs.join("; ")
    }

    /// Converts a stored status into a caller-facing result.
    pub fn to_result(&self) -> crate::error::Result<()> {
        match self.code {
            StatusCode::Ok => Ok(()),
            StatusCode::Cancelled => Err(KiteError::Cancelled(self.message())),
            StatusCode::Error => Err(KiteError::Execution(self.message())),
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::Cancelled => write!(f, "CANCELLED"),
            StatusCode::Error => write!(f, "ERROR: {}", self.message()),
        }
    }
}

impl From<&KiteError> for ExecStatus {
    fn from(err: &KiteError) -> Self {
        match err {
            KiteError::Cancelled(msg) => {
                let mut status = ExecStatus::cancelled();
                if !msg.is_empty() {
                    status.error_msgs.push(msg.clone());
                }
                status
            }
            other => ExecStatus::error(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecStatus, StatusCode};

    #[test]
    fn update_keeps_first_failure() {
        let mut status = ExecStatus::ok();
        status.update(&ExecStatus::error("first"));
        status.update(&ExecStatus::error("second"));
        status.update(&ExecStatus::ok());
        assert_eq!(status.code, StatusCode::Error);
        assert_eq!(status.message(), "first");
    }

    #[test]
    fn add_error_msg_preserves_cancelled_code() {
        let mut status = ExecStatus::cancelled();
        status.add_error_msg("cancel rpc to host-3 failed");
        assert!(status.is_cancelled());
        assert_eq!(status.message(), "cancel rpc to host-3 failed");
    }

    #[test]
    fn ok_to_result_round_trips() {
        assert!(ExecStatus::ok().to_result().is_ok());
        assert!(ExecStatus::cancelled().to_result().is_err());
        assert!(ExecStatus::error("boom").to_result().is_err());
    }
}
