//! Policy compilation and dataplane programming
//!
//! - [`policy`]: Cluster objects the ruleset is derived from
//! - [`validate`]: Structural checks run before compilation
//! - [`resolver`]: FQDN selector → firewall set resolution
//! - [`compiler`]: Policy → rule text translation
//! - [`render`]: Full ruleset assembly and nftables text output
//! - [`apply`]: Checking and loading rulesets with `nft`
//! - [`snapshot`]: Last-applied policy specs
//! - [`detector`]: Decides whether a rebuild is needed
//! - [`error`]: Error types

pub mod apply;
pub mod compiler;
pub mod detector;
pub mod error;
pub mod policy;
pub mod render;
pub mod resolver;
pub mod snapshot;
pub mod validate;

#[cfg(test)]
pub mod test_helpers;
