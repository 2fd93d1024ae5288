use crate::core::error::{Error, Result};
use crate::utils::{get_config_dir, get_state_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`ControllerConfig::nft_command`]
pub const NFT_COMMAND_ENV: &str = "NFTPOLICY_NFT_COMMAND";

const MAX_INTERVAL_SECS: u64 = 3600;
const MAX_APPLY_TIMEOUT_SECS: u64 = 600;

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Seconds between timer-driven reconciliations (default: 30s, max: 3600s)
    #[serde(default = "default_interval")]
    pub reconcile_interval_secs: u64,
    /// Deadline for checking and loading one ruleset (default: 20s, max: 600s)
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    /// Where the applied ruleset is persisted
    #[serde(default = "default_ruleset_path")]
    pub ruleset_path: PathBuf,
    #[serde(default = "default_nft_command")]
    pub nft_command: String,
    /// Render and persist, but never call `nft`
    #[serde(default)]
    pub dry_run: bool,
    /// Overrides the XDG state directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_interval(),
            apply_timeout_secs: default_apply_timeout(),
            ruleset_path: default_ruleset_path(),
            nft_command: default_nft_command(),
            dry_run: false,
            state_dir: None,
        }
    }
}

fn default_interval() -> u64 {
    30
}

fn default_apply_timeout() -> u64 {
    20
}

fn default_ruleset_path() -> PathBuf {
    PathBuf::from("/etc/nftables/nftpolicy.v4")
}

fn default_nft_command() -> String {
    "nft".to_string()
}

impl ControllerConfig {
    /// Clamps intervals into their supported range
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.reconcile_interval_secs = self.reconcile_interval_secs.clamp(1, MAX_INTERVAL_SECS);
        self.apply_timeout_secs = self.apply_timeout_secs.clamp(1, MAX_APPLY_TIMEOUT_SECS);
        self
    }

    /// Applies environment overrides
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Ok(command) = std::env::var(NFT_COMMAND_ENV)
            && !command.trim().is_empty()
        {
            self.nft_command = command;
        }
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir.clone().or_else(get_state_dir)
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.state_dir().map(|dir| dir.join("snapshots.json"))
    }

    pub fn audit_path(&self) -> Option<PathBuf> {
        self.state_dir().map(|dir| dir.join("audit.log"))
    }
}

/// `config.json` in the XDG config directory
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the controller config from `path`.
///
/// A missing file yields the defaults. Environment overrides and clamping are
/// applied in both cases.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
pub async fn load_config(path: &Path) -> Result<ControllerConfig> {
    let config = match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str::<ControllerConfig>(&json)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ControllerConfig::default(),
        Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
    };
    Ok(config.with_env().clamped())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: ControllerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.apply_timeout(), Duration::from_secs(20));
        assert_eq!(config.nft_command, "nft");
        assert!(!config.dry_run);
    }

    #[test]
    fn test_clamping() {
        let config = ControllerConfig {
            reconcile_interval_secs: 0,
            apply_timeout_secs: u64::MAX,
            ..ControllerConfig::default()
        }
        .clamped();
        assert_eq!(config.reconcile_interval_secs, 1);
        assert_eq!(config.apply_timeout_secs, MAX_APPLY_TIMEOUT_SECS);
    }

    #[test]
    fn test_state_paths_follow_override() {
        let config = ControllerConfig {
            state_dir: Some(PathBuf::from("/tmp/np")),
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.snapshot_path(),
            Some(PathBuf::from("/tmp/np/snapshots.json"))
        );
        assert_eq!(config.audit_path(), Some(PathBuf::from("/tmp/np/audit.log")));
    }

    #[tokio::test]
    async fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let missing = load_config(&path).await.unwrap();
        assert_eq!(missing.reconcile_interval_secs, 30);

        std::fs::write(
            &path,
            r#"{"reconcile_interval_secs": 5000, "dry_run": true}"#,
        )
        .unwrap();
        let loaded = load_config(&path).await.unwrap();
        assert_eq!(loaded.reconcile_interval_secs, MAX_INTERVAL_SECS);
        assert!(loaded.dry_run);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_config(&path).await, Err(Error::Config(_))));
    }
}
