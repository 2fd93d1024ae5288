//! Ruleset application
//!
//! [`NftApplier`] loads a rendered ruleset in three steps:
//!
//! 1. The text is written next to the target as a staging file.
//! 2. `nft -c -f <staging>` checks it without touching the kernel.
//! 3. `nft -f <staging>` loads it, and the staging file replaces the target.
//!
//! `nft -f` applies a file as one transaction, so a failure in step 3 leaves
//! the previous ruleset in place. If the target already holds byte-identical
//! text nothing is executed and [`ApplyOutcome::Unchanged`] is returned.

use crate::core::error::{Error, Result, parse_nft_errors};
use crate::utils::write_atomic;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// What an apply did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { checksum: String },
    Unchanged { checksum: String },
}

impl ApplyOutcome {
    pub fn checksum(&self) -> &str {
        match self {
            ApplyOutcome::Applied { checksum } | ApplyOutcome::Unchanged { checksum } => checksum,
        }
    }
}

/// Loads rendered rulesets into the dataplane
pub trait RulesetApplier: Send + Sync {
    /// Applies `ruleset` as a whole or not at all
    fn apply(&self, ruleset: &str) -> impl Future<Output = Result<ApplyOutcome>> + Send;
}

impl<T: RulesetApplier> RulesetApplier for std::sync::Arc<T> {
    fn apply(&self, ruleset: &str) -> impl Future<Output = Result<ApplyOutcome>> + Send {
        (**self).apply(ruleset)
    }
}

/// SHA-256 of a rendered ruleset
pub fn checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Line diff in `- `/`+ ` notation, or `None` if the texts are equal
pub fn diff(old_text: &str, new_text: &str) -> Option<String> {
    use std::fmt::Write;

    let diff = similar::TextDiff::from_lines(old_text, new_text);
    let mut result = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => continue,
        };
        let _ = write!(result, "{sign}{change}");
    }
    (!result.is_empty()).then_some(result)
}

/// Applies rulesets with the `nft` binary
#[derive(Debug, Clone)]
pub struct NftApplier {
    program: String,
    args: Vec<String>,
    target: PathBuf,
    dry_run: bool,
}

impl NftApplier {
    /// `nft_command` is split on whitespace, so wrappers like `sudo nft` work
    pub fn new(nft_command: &str, target: impl Into<PathBuf>, dry_run: bool) -> Result<Self> {
        let mut parts = nft_command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("nft command must not be empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            target: target.into(),
            dry_run,
        })
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .target
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".staging");
        self.target.with_file_name(name)
    }

    async fn run_nft(&self, extra: &[&str], file: &Path) -> Result<()> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .args(extra)
            .arg("-f")
            .arg(file)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Internal(format!("Failed to spawn {}: {e}", self.program))
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let errors = parse_nft_errors(&stderr);
        let message = if errors.is_empty() {
            format!("{} exited with {}", self.program, output.status)
        } else {
            errors.join("; ")
        };
        Err(Error::Nftables {
            message,
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }

    async fn previous(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.target).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl RulesetApplier for NftApplier {
    async fn apply(&self, ruleset: &str) -> Result<ApplyOutcome> {
        let checksum = checksum(ruleset);
        let previous = self.previous().await?;

        if let Some(previous) = &previous {
            if *previous == ruleset {
                info!("Ruleset unchanged ({}), skipping reload", &checksum[..12]);
                return Ok(ApplyOutcome::Unchanged { checksum });
            }
            if let Some(diff) = diff(previous, ruleset) {
                debug!("Ruleset changes:\n{diff}");
            }
        }

        let staging = self.staging_path();
        write_atomic(&staging, ruleset.as_bytes().to_vec()).await?;

        if self.dry_run {
            info!("Dry run: not loading {}", staging.display());
        } else {
            let loaded = async {
                self.run_nft(&["-c"], &staging).await?;
                self.run_nft(&[], &staging).await
            }
            .await;
            if let Err(e) = loaded {
                warn!("Loading ruleset failed: {e}");
                if let Err(rm) = tokio::fs::remove_file(&staging).await {
                    debug!("Could not remove {}: {rm}", staging.display());
                }
                return Err(e);
            }
        }

        tokio::fs::rename(&staging, &self.target).await?;
        info!(
            "Applied ruleset {} to {}",
            &checksum[..12],
            self.target.display()
        );
        Ok(ApplyOutcome::Applied { checksum })
    }
}
