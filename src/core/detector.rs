//! Change detection
//!
//! Decides whether the ruleset has to be recompiled. Two independent sources
//! of change are checked:
//!
//! 1. **Spec drift**: a current policy differs from its snapshot, or has none.
//! 2. **Resolution drift**: an FQDN selector recorded in a snapshot now
//!    resolves to a different set of firewall sets. The policy objects do not
//!    change when this happens, so it is only visible by asking the resolver.
//!
//! FQDN selectors are compared pairwise by index on match name and pattern.
//! Reordering the selectors of an egress entry therefore counts as drift.

use crate::core::policy::{
    ClusterwideNetworkPolicy, EgressRule, FqdnSelector, IngressRule, PolicyKey, PolicySpec,
    SetRef,
};
use crate::core::resolver::SetResolver;
use crate::core::snapshot::SnapshotStore;
use std::collections::BTreeSet;
use std::fmt;

/// Why a reconciliation is needed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    /// The policy has never been applied
    NewPolicy(PolicyKey),
    /// The policy's spec differs from the applied one
    SpecChanged(PolicyKey),
    /// A selector of the applied policy resolves to different sets
    SetsChanged { policy: PolicyKey, selector: String },
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Drift::NewPolicy(key) => write!(f, "policy {key} has not been applied yet"),
            Drift::SpecChanged(key) => write!(f, "spec of policy {key} changed"),
            Drift::SetsChanged { policy, selector } => {
                write!(f, "sets of selector {selector} in policy {policy} changed")
            }
        }
    }
}

/// Returns true if the applied ruleset is stale
pub fn should_reconcile(
    policies: &[ClusterwideNetworkPolicy],
    store: &SnapshotStore,
    resolver: &impl SetResolver,
) -> bool {
    detect(policies, store, resolver).is_some()
}

/// Returns the first reason found for the applied ruleset being stale
pub fn detect(
    policies: &[ClusterwideNetworkPolicy],
    store: &SnapshotStore,
    resolver: &impl SetResolver,
) -> Option<Drift> {
    spec_drift(policies, store).or_else(|| resolution_drift(store, resolver))
}

/// Compares current policies against their snapshots
pub fn spec_drift(policies: &[ClusterwideNetworkPolicy], store: &SnapshotStore) -> Option<Drift> {
    policies.iter().find_map(|policy| {
        let key = policy.key();
        match store.get(&key) {
            None => Some(Drift::NewPolicy(key)),
            Some(applied) if !specs_equal(&policy.spec, applied) => Some(Drift::SpecChanged(key)),
            Some(_) => None,
        }
    })
}

/// Compares recorded selector sets against the resolver's current answers
pub fn resolution_drift(store: &SnapshotStore, resolver: &impl SetResolver) -> Option<Drift> {
    for (key, spec) in store.iter() {
        for entry in spec.egress.iter().filter(|e| e.to.is_empty()) {
            for selector in &entry.to_fqdns {
                let current = resolver.get_sets(selector, false);
                if !same_set_names(selector, &current) {
                    return Some(Drift::SetsChanged {
                        policy: key.clone(),
                        selector: selector.key().to_string(),
                    });
                }
            }
        }
    }
    None
}

fn specs_equal(current: &PolicySpec, applied: &PolicySpec) -> bool {
    ingress_equal(&current.ingress, &applied.ingress)
        && current.egress.len() == applied.egress.len()
        && current
            .egress
            .iter()
            .zip(&applied.egress)
            .all(|(c, a)| egress_entry_equal(c, a))
}

fn ingress_equal(current: &[IngressRule], applied: &[IngressRule]) -> bool {
    current == applied
}

/// Ports and CIDR blocks structurally; selectors by index on what they match,
/// ignoring the sets they resolved to.
fn egress_entry_equal(current: &EgressRule, applied: &EgressRule) -> bool {
    current.ports == applied.ports
        && current.to == applied.to
        && selectors_equal(&current.to_fqdns, &applied.to_fqdns)
}

fn selectors_equal(current: &[FqdnSelector], applied: &[FqdnSelector]) -> bool {
    current.len() == applied.len()
        && current
            .iter()
            .zip(applied)
            .all(|(c, a)| c.same_selection(a))
}

/// Order-insensitive comparison of recorded and current set names
fn same_set_names(selector: &FqdnSelector, current: &[SetRef]) -> bool {
    let recorded: BTreeSet<&str> = selector.sets.iter().map(|s| s.name.as_str()).collect();
    let current: BTreeSet<&str> = current.iter().map(|s| s.name.as_str()).collect();
    recorded == current
}
