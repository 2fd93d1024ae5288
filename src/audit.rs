/// Audit logging for ruleset changes
///
/// Every apply attempt, and every policy rejected by validation, leaves one
/// JSON line in the audit log.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyRuleset,
    SkipUnchanged,
    RejectPolicy,
    PersistSnapshots,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    async fn log_or_warn(&self, event: AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Logs an apply attempt
///
/// # Arguments
///
/// * `reason` - Why the ruleset was rebuilt
/// * `rule_count` - Number of forward-chain rules in the ruleset
/// * `checksum` - SHA-256 of the rendered ruleset
/// * `error` - Error message if the apply failed
pub async fn log_apply(
    audit: Option<&AuditLog>,
    reason: &str,
    rule_count: usize,
    checksum: &str,
    error: Option<String>,
) {
    if let Some(audit) = audit {
        let event = AuditEvent::new(
            EventType::ApplyRuleset,
            error.is_none(),
            serde_json::json!({
                "reason": reason,
                "rule_count": rule_count,
                "checksum": checksum,
            }),
            error,
        );
        audit.log_or_warn(event).await;
    }
}

/// Logs an apply that found the target already up to date
pub async fn log_unchanged(audit: Option<&AuditLog>, checksum: &str) {
    if let Some(audit) = audit {
        let event = AuditEvent::new(
            EventType::SkipUnchanged,
            true,
            serde_json::json!({ "checksum": checksum }),
            None,
        );
        audit.log_or_warn(event).await;
    }
}

/// Logs a policy left out of the ruleset
pub async fn log_rejected(audit: Option<&AuditLog>, policy: &str) {
    if let Some(audit) = audit {
        let event = AuditEvent::new(
            EventType::RejectPolicy,
            false,
            serde_json::json!({ "policy": policy }),
            Some("validation failed".to_string()),
        );
        audit.log_or_warn(event).await;
    }
}

/// Logs persisting the snapshot store
pub async fn log_persist(audit: Option<&AuditLog>, count: usize, error: Option<String>) {
    if let Some(audit) = audit {
        let event = AuditEvent::new(
            EventType::PersistSnapshots,
            error.is_none(),
            serde_json::json!({ "snapshot_count": count }),
            error,
        );
        audit.log_or_warn(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audit_event_creation() {
        let event = AuditEvent::new(
            EventType::ApplyRuleset,
            true,
            serde_json::json!({"rule_count": 5}),
            None,
        );

        assert!(event.success);
        assert!(event.error.is_none());
        assert_eq!(event.details["rule_count"], 5);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::RejectPolicy,
            false,
            serde_json::json!({"policy": "firewall/web"}),
            Some("validation failed".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("reject_policy"));
        assert!(json.contains("validation failed"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"apply_ruleset","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::ApplyRuleset);
    }

    #[tokio::test]
    async fn test_log_and_read_recent() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));

        log_apply(Some(&audit), "policy firewall/web has not been applied yet", 3, "abc", None).await;
        log_unchanged(Some(&audit), "abc").await;
        log_apply(None, "ignored", 0, "", None).await;

        let events = audit.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::SkipUnchanged);
        assert_eq!(events[1].details["rule_count"], 3);
    }
}
