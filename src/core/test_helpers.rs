//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::policy::{
    ClusterwideNetworkPolicy, EgressRule, FirewallNetwork, FirewallSpec, FqdnSelector,
    NetworkType, PolicyPort, PolicySpec, Protocol, SetRef,
};
use crate::core::resolver::{IpSet, SetResolver};
use std::collections::HashMap;

/// Deterministic resolver keyed by match name or pattern.
///
/// Selectors without an entry resolve to no sets.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    answers: HashMap<String, Vec<SetRef>>,
}

impl StaticResolver {
    pub fn with(entries: &[(&str, &[&str])]) -> Self {
        let mut resolver = Self::default();
        for (selector, sets) in entries {
            resolver.set(selector, sets);
        }
        resolver
    }

    pub fn set(&mut self, selector: &str, sets: &[&str]) {
        self.answers.insert(
            selector.to_string(),
            sets.iter().map(|s| SetRef::new(*s)).collect(),
        );
    }
}

impl SetResolver for StaticResolver {
    fn get_sets(&self, selector: &FqdnSelector, _create: bool) -> Vec<SetRef> {
        self.answers
            .get(&selector.key().to_string())
            .cloned()
            .unwrap_or_default()
    }

    fn sets_for_rendering(&self) -> Vec<IpSet> {
        let mut names: Vec<&String> = self.answers.values().flatten().map(|s| &s.name).collect();
        names.sort();
        names.dedup();
        names.into_iter().map(IpSet::empty).collect()
    }
}

/// Creates a policy in the default namespace
pub fn policy(name: &str, spec: PolicySpec) -> ClusterwideNetworkPolicy {
    ClusterwideNetworkPolicy::new(name, spec)
}

/// Creates a policy with one FQDN egress entry allowing DNS (tcp/53, udp/53)
pub fn egress_fqdn_policy(name: &str, selectors: Vec<FqdnSelector>) -> ClusterwideNetworkPolicy {
    policy(
        name,
        PolicySpec {
            ingress: vec![],
            egress: vec![EgressRule {
                to: vec![],
                to_fqdns: selectors,
                ports: vec![
                    PolicyPort::new(Protocol::Tcp, 53),
                    PolicyPort::new(Protocol::Udp, 53),
                ],
            }],
        },
    )
}

/// Firewall spec with a primary private network (VRF 3981) and an internet
/// network (VRF 104009)
pub fn firewall_spec() -> FirewallSpec {
    FirewallSpec {
        internal_prefixes: vec!["10.0.0.0/22".to_string()],
        networks: vec![
            FirewallNetwork {
                network_id: "tenant".to_string(),
                network_type: NetworkType::Privateprimary,
                vrf: Some(3981),
                prefixes: vec!["10.0.0.0/22".to_string()],
            },
            FirewallNetwork {
                network_id: "internet".to_string(),
                network_type: NetworkType::External,
                vrf: Some(104_009),
                prefixes: vec!["185.1.2.0/24".to_string()],
            },
        ],
        rate_limits: vec![],
        egress_snat: vec![],
    }
}
