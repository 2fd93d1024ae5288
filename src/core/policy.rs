//! Policy data structures
//!
//! This module defines the inputs of the rule compiler: cluster-wide network
//! policies, the services that contribute ingress rules, and the spec of the
//! managed firewall object. Field names serialize in the camelCase form used by
//! the Kubernetes resources they mirror.
//!
//! # Example
//!
//! ```
//! use nftpolicy::core::policy::{ClusterwideNetworkPolicy, IngressRule, IpBlock, PolicyPort, PolicySpec, Protocol};
//!
//! let policy = ClusterwideNetworkPolicy::new(
//!     "allow-web",
//!     PolicySpec {
//!         ingress: vec![IngressRule {
//!             from: vec![IpBlock::new("10.0.0.0/8")],
//!             ports: vec![PolicyPort::new(Protocol::Tcp, 443)],
//!         }],
//!         egress: vec![],
//!     },
//! );
//! assert_eq!(policy.key().to_string(), "firewall/allow-web");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace that holds cluster-wide network policies.
///
/// Policies outside this namespace never take effect.
pub const POLICY_NAMESPACE: &str = "firewall";

/// Transport protocol of a policy port
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    #[strum(serialize = "tcp")]
    Tcp,
    #[serde(rename = "UDP")]
    #[strum(serialize = "udp")]
    Udp,
    /// Accepted by the schema but never rendered into rules
    #[serde(rename = "SCTP")]
    #[strum(serialize = "sctp")]
    Sctp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// A port (or port range) a policy entry applies to.
///
/// A missing protocol means TCP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
}

impl PolicyPort {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self {
            protocol: Some(protocol),
            port,
            end_port: None,
        }
    }

    pub fn range(protocol: Protocol, port: u16, end_port: u16) -> Self {
        Self {
            protocol: Some(protocol),
            port,
            end_port: Some(end_port),
        }
    }

    pub fn effective_protocol(&self) -> Protocol {
        self.protocol.unwrap_or(Protocol::Tcp)
    }
}

impl fmt::Display for PolicyPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end_port {
            Some(end) if end != self.port => write!(f, "{}-{}", self.port, end),
            _ => write!(f, "{}", self.port),
        }
    }
}

/// A CIDR block with optional carve-outs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IpBlock {
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

impl IpBlock {
    pub fn new(cidr: impl Into<String>) -> Self {
        Self {
            cidr: cidr.into(),
            except: Vec::new(),
        }
    }

    pub fn with_except(cidr: impl Into<String>, except: &[&str]) -> Self {
        Self {
            cidr: cidr.into(),
            except: except.iter().map(|e| (*e).to_string()).collect(),
        }
    }
}

/// Opaque reference to a named firewall set.
///
/// Identity is the name; two references with the same name are the same set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetRef {
    #[serde(rename = "setName")]
    pub name: String,
}

impl SetRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for SetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// DNS-name selector of an egress entry.
///
/// `sets` records the firewall sets the selector resolved to when the policy
/// was last compiled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FqdnSelector {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub match_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub match_pattern: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sets: Vec<SetRef>,
}

impl FqdnSelector {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            match_name: name.into(),
            ..Self::default()
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            match_pattern: pattern.into(),
            ..Self::default()
        }
    }

    /// Returns the identity of the selector, ignoring resolved sets
    pub fn key(&self) -> SelectorKey {
        SelectorKey {
            match_name: self.match_name.clone(),
            match_pattern: self.match_pattern.clone(),
        }
    }

    /// Whether two selectors select the same names (resolved sets are ignored)
    pub fn same_selection(&self, other: &FqdnSelector) -> bool {
        self.match_name == other.match_name && self.match_pattern == other.match_pattern
    }
}

/// Hashable identity of an [`FqdnSelector`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorKey {
    #[serde(default)]
    pub match_name: String,
    #[serde(default)]
    pub match_pattern: String,
}

impl fmt::Display for SelectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.match_pattern.is_empty() {
            f.write_str(&self.match_name)
        } else {
            f.write_str(&self.match_pattern)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IngressRule {
    #[serde(default)]
    pub from: Vec<IpBlock>,
    #[serde(default)]
    pub ports: Vec<PolicyPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EgressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<IpBlock>,
    #[serde(default, rename = "toFQDNs", skip_serializing_if = "Vec::is_empty")]
    pub to_fqdns: Vec<FqdnSelector>,
    #[serde(default)]
    pub ports: Vec<PolicyPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicySpec {
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    #[serde(default)]
    pub egress: Vec<EgressRule>,
}

/// Key of a policy in the snapshot store: `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for PolicyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Self::new(ns, name)),
            _ => Err(format!("invalid policy key '{s}', expected namespace/name")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterwideNetworkPolicy {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub spec: PolicySpec,
}

fn default_namespace() -> String {
    POLICY_NAMESPACE.to_string()
}

impl ClusterwideNetworkPolicy {
    /// Creates a policy in [`POLICY_NAMESPACE`]
    pub fn new(name: impl Into<String>, spec: PolicySpec) -> Self {
        Self {
            namespace: default_namespace(),
            name: name.into(),
            spec,
        }
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(&self.namespace, &self.name)
    }
}

/// Kubernetes service type; only load balancers contribute rules
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    pub port: u16,
}

/// The slice of a Kubernetes service the ingress rules are derived from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub namespace: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
    /// Load balancer ingress addresses from the service status
    #[serde(default)]
    pub ingress_ips: Vec<String>,
    #[serde(default, rename = "loadBalancerSourceRanges")]
    pub source_ranges: Vec<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// Role of a network attached to the firewall
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetworkType {
    Privateprimary,
    Private,
    External,
    Underlay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallNetwork {
    pub network_id: String,
    pub network_type: NetworkType,
    #[serde(default)]
    pub vrf: Option<u64>,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Bandwidth limit for traffic entering through a network, in Mbytes/s
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub network_id: String,
    pub rate: u32,
}

/// Source-NAT addresses for traffic leaving through a network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EgressSnat {
    pub network_id: String,
    pub ips: Vec<String>,
}

/// Spec of the managed firewall object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FirewallSpec {
    #[serde(default)]
    pub internal_prefixes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<FirewallNetwork>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimit>,
    #[serde(default)]
    pub egress_snat: Vec<EgressSnat>,
}

impl FirewallSpec {
    /// VRF of the primary private network, if one is attached
    pub fn private_vrf(&self) -> Option<u64> {
        self.networks
            .iter()
            .find(|n| n.network_type == NetworkType::Privateprimary)
            .and_then(|n| n.vrf)
    }

    pub fn network(&self, network_id: &str) -> Option<&FirewallNetwork> {
        self.networks.iter().find(|n| n.network_id == network_id)
    }
}

/// Everything a reconciliation reads from the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterState {
    #[serde(default)]
    pub policies: Vec<ClusterwideNetworkPolicy>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub firewall: FirewallSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_port_display() {
        assert_eq!(PolicyPort::new(Protocol::Tcp, 80).to_string(), "80");
        assert_eq!(
            PolicyPort::range(Protocol::Udp, 8000, 9000).to_string(),
            "8000-9000"
        );
        assert_eq!(PolicyPort::range(Protocol::Udp, 53, 53).to_string(), "53");
    }

    #[test]
    fn test_missing_protocol_is_tcp() {
        let port: PolicyPort = serde_json::from_str(r#"{"port": 22}"#).unwrap();
        assert_eq!(port.effective_protocol(), Protocol::Tcp);
    }

    #[test]
    fn test_policy_key_parse() {
        let key: PolicyKey = "firewall/allow-dns".parse().unwrap();
        assert_eq!(key, PolicyKey::new("firewall", "allow-dns"));
        assert!("no-slash".parse::<PolicyKey>().is_err());
        assert!("/name".parse::<PolicyKey>().is_err());
    }

    #[test]
    fn test_policy_deserialization_uses_kubernetes_names() {
        let json = r#"{
            "name": "dns",
            "spec": {
                "egress": [{
                    "toFQDNs": [{"matchName": "example.com", "sets": [{"setName": "s1"}]}],
                    "ports": [{"protocol": "UDP", "port": 53}]
                }]
            }
        }"#;
        let policy: ClusterwideNetworkPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.namespace, POLICY_NAMESPACE);
        let egress = &policy.spec.egress[0];
        assert!(egress.to.is_empty());
        assert_eq!(egress.to_fqdns[0].match_name, "example.com");
        assert_eq!(egress.to_fqdns[0].sets, vec![SetRef::new("s1")]);
        assert_eq!(egress.ports[0].protocol, Some(Protocol::Udp));
    }

    #[test]
    fn test_private_vrf() {
        let spec = FirewallSpec {
            networks: vec![
                FirewallNetwork {
                    network_id: "internet".to_string(),
                    network_type: NetworkType::External,
                    vrf: Some(104_009),
                    prefixes: vec![],
                },
                FirewallNetwork {
                    network_id: "tenant".to_string(),
                    network_type: NetworkType::Privateprimary,
                    vrf: Some(3981),
                    prefixes: vec!["10.0.0.0/22".to_string()],
                },
            ],
            ..FirewallSpec::default()
        };
        assert_eq!(spec.private_vrf(), Some(3981));
        assert!(spec.network("internet").is_some());
        assert!(spec.network("missing").is_none());
    }
}
