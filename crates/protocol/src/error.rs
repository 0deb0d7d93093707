use serde::{Deserialize, Serialize};

/// Stable error codes surfaced to panel callers and in frames.
pub mod error_codes {
    pub const AGENT_OFFLINE: &str = "AGENT_OFFLINE";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const SEND_ERROR: &str = "SEND_ERROR";
    pub const DB_ERROR: &str = "DB_ERROR";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

/// Structured error returned across the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_shape_displays_code_and_message() {
        let e = ErrorShape::new(error_codes::TIMEOUT, "command timeout");
        assert_eq!(e.to_string(), "TIMEOUT: command timeout");
        assert!(e.is(error_codes::TIMEOUT));
    }
}
