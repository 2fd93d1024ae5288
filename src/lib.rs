//! nftpolicy - cluster-wide network policies as nftables rulesets
//!
//! Compiles egress and ingress policies, including DNS-name based egress
//! selectors, into the forward chain of a firewall, and keeps the loaded
//! ruleset in sync with both policy changes and changing DNS resolutions.
//!
//! # Architecture
//!
//! - [`core`] - Compilation, change detection, rendering and `nft` integration
//! - [`scheduler`] - Timer- and signal-driven single-flight reconciliation
//! - [`audit`] - Audit logging of every ruleset change
//! - [`config`] - Controller configuration
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Safety Features
//!
//! - Pre-load verification with `nft -c`
//! - Snapshots recorded only after a successful load
//! - SHA-256 checksums for the snapshot store and applied ruleset
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::policy::{ClusterState, ClusterwideNetworkPolicy, PolicySpec, Protocol};
pub use core::render::Ruleset;
