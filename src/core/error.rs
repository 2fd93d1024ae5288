use thiserror::Error;

/// Core error types for nftpolicy
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Policy or firewall spec failed validation
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Snapshot store operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Apply did not finish before its deadline
    #[error("Apply timed out after {0:?}")]
    ApplyTimeout(std::time::Duration),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Snapshot store errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot store checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot store format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Snapshot store contains invalid policy key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Parses nft error output into readable messages
///
/// Attempts to extract meaningful error information from nft's
/// stderr output, falling back to raw lines if parsing fails.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    // JSON error format first
    if let Ok(json_err) = serde_json::from_str::<serde_json::Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nft_errors_plain_text() {
        let stderr = "Error: syntax error, unexpected $end\nError: invalid expression\n";
        let errors = parse_nft_errors(stderr);

        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], "syntax error, unexpected $end");
        assert_eq!(errors[1], "invalid expression");
    }

    #[test]
    fn test_parse_nft_errors_json() {
        let stderr = r#"{"errors": [{"message": "Could not process rule"}]}"#;
        assert_eq!(parse_nft_errors(stderr), vec!["Could not process rule"]);
    }

    #[test]
    fn test_parse_nft_errors_empty() {
        assert!(parse_nft_errors("").is_empty());
        assert!(parse_nft_errors("\n  \n").is_empty());
    }

    #[test]
    fn test_parse_nft_errors_with_nft_prefix() {
        let errors = parse_nft_errors("nft: syntax error\n");
        assert_eq!(errors, vec!["syntax error"]);
    }

    #[test]
    fn test_error_display() {
        let err = Error::validation("spec.egress[0].to[0].cidr", "invalid CIDR");
        assert_eq!(
            err.to_string(),
            "Validation error in spec.egress[0].to[0].cidr: invalid CIDR"
        );
        assert_eq!(
            Error::ApplyTimeout(std::time::Duration::from_secs(20)).to_string(),
            "Apply timed out after 20s"
        );
        assert_eq!(
            Error::ApplyTimeout(std::time::Duration::from_millis(50)).to_string(),
            "Apply timed out after 50ms"
        );
    }
}
