//! Policy → nftables rule compiler
//!
//! Translates one [`ClusterwideNetworkPolicy`] into rule text for the forward
//! chain. Compilation is pure given a resolver answer: the same policy and the
//! same resolver state always yield byte-identical output, because every rule
//! list leaves through [`unique_sorted`].
//!
//! # Rule Shape
//!
//! ```text
//! ip saddr != { <except> } ip saddr { <allow> } tcp dport { 80, 443 } counter accept comment "..."
//! ip saddr == @cluster_prefixes ip daddr @<set> udp dport { 53 } counter accept comment "..."
//! ```

use crate::core::policy::{ClusterwideNetworkPolicy, EgressRule, IpBlock, PolicyPort, Protocol};
use crate::core::resolver::SetResolver;

/// nftables set holding the cluster's internal prefixes
pub const CLUSTER_PREFIXES_SET: &str = "cluster_prefixes";

/// Allow-list entry that matches every IPv4 destination
const ALLOW_ALL: &str = "0.0.0.0/0";

/// One line of rule text
pub type CompiledRule = String;

/// Output of [`compile_policy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPolicy {
    pub ingress: Vec<CompiledRule>,
    pub egress: Vec<CompiledRule>,
    /// Input policy with every selector's `sets` replaced by the answer the
    /// egress rules were built from
    pub policy: ClusterwideNetworkPolicy,
}

/// Compiles both directions of a policy
pub fn compile_policy(
    policy: &ClusterwideNetworkPolicy,
    resolver: &impl SetResolver,
) -> CompiledPolicy {
    let ingress = compile_ingress(policy);
    let (egress, updated) = compile_egress(policy, resolver);
    CompiledPolicy {
        ingress,
        egress,
        policy: updated,
    }
}

/// Compiles the ingress entries of a policy
pub fn compile_ingress(policy: &ClusterwideNetworkPolicy) -> Vec<CompiledRule> {
    let mut rules = Vec::new();
    let comment = format!("accept traffic for k8s network policy {}", policy.name);

    for entry in &policy.spec.ingress {
        let (allow, except) = allow_except(&entry.from);
        let mut common = Vec::with_capacity(2);
        if !except.is_empty() {
            common.push(format!("ip saddr != {}", nft_set(&except)));
        }
        if !allow.is_empty() {
            common.push(format!("ip saddr {}", nft_set(&allow)));
        }
        push_port_rules(&mut rules, &common, &entry.ports, &comment);
    }

    unique_sorted(rules)
}

/// Compiles the egress entries of a policy.
///
/// Returns the rules and a copy of the policy whose FQDN selectors carry the
/// sets the rules reference. Only `to_fqdns[*].sets` differs from the input.
pub fn compile_egress(
    policy: &ClusterwideNetworkPolicy,
    resolver: &impl SetResolver,
) -> (Vec<CompiledRule>, ClusterwideNetworkPolicy) {
    let mut rules = Vec::new();
    let mut updated = policy.clone();
    let comment = format!("accept traffic for np {}", policy.name);

    for entry in &mut updated.spec.egress {
        let bases = if entry.to.is_empty() {
            fqdn_rule_bases(entry, resolver)
        } else {
            vec![cidr_rule_base(&entry.to)]
        };
        for base in &bases {
            push_port_rules(&mut rules, base, &entry.ports, &comment);
        }
    }

    (unique_sorted(rules), updated)
}

fn cidr_rule_base(to: &[IpBlock]) -> Vec<String> {
    let (allow, except) = allow_except(to);
    let mut base = vec![cluster_source()];
    if !except.is_empty() {
        base.push(format!("ip daddr != {}", nft_set(&except)));
    }
    // An allow-all clause matches everything; leave it out
    if !allow.is_empty() && allow != [ALLOW_ALL] {
        base.push(format!("ip daddr {}", nft_set(&allow)));
    }
    base
}

/// One rule base per resolved set. Writes the answer back onto the selector.
fn fqdn_rule_bases(entry: &mut EgressRule, resolver: &impl SetResolver) -> Vec<Vec<String>> {
    let mut bases = Vec::new();
    for selector in &mut entry.to_fqdns {
        selector.sets = resolver.get_sets(selector, false);
        for set in &selector.sets {
            bases.push(vec![cluster_source(), format!("ip daddr @{}", set.name)]);
        }
    }
    bases
}

fn cluster_source() -> String {
    format!("ip saddr == @{CLUSTER_PREFIXES_SET}")
}

fn allow_except(blocks: &[IpBlock]) -> (Vec<String>, Vec<String>) {
    let mut allow = Vec::with_capacity(blocks.len());
    let mut except = Vec::new();
    for block in blocks {
        allow.push(block.cidr.clone());
        except.extend(block.except.iter().cloned());
    }
    (allow, except)
}

/// Splits ports into TCP and UDP buckets, keeping input order. Other
/// protocols are dropped.
pub(crate) fn port_buckets(
    ports: impl IntoIterator<Item = (Protocol, String)>,
) -> (Vec<String>, Vec<String>) {
    let mut tcp = Vec::new();
    let mut udp = Vec::new();
    for (protocol, port) in ports {
        match protocol {
            Protocol::Tcp => tcp.push(port),
            Protocol::Udp => udp.push(port),
            Protocol::Sctp => {}
        }
    }
    (tcp, udp)
}

fn push_port_rules(
    rules: &mut Vec<CompiledRule>,
    common: &[String],
    ports: &[PolicyPort],
    comment: &str,
) {
    let (tcp, udp) = port_buckets(
        ports
            .iter()
            .map(|p| (p.effective_protocol(), p.to_string())),
    );
    if !tcp.is_empty() {
        rules.push(assemble_destination_port_rule(
            common,
            Protocol::Tcp,
            &tcp,
            &format!("{comment} tcp"),
        ));
    }
    if !udp.is_empty() {
        rules.push(assemble_destination_port_rule(
            common,
            Protocol::Udp,
            &udp,
            &format!("{comment} udp"),
        ));
    }
}

/// Joins a match prefix, a destination port match and an accept verdict
pub(crate) fn assemble_destination_port_rule(
    common: &[String],
    protocol: Protocol,
    ports: &[String],
    comment: &str,
) -> CompiledRule {
    let mut parts = common.to_vec();
    parts.push(format!("{} dport {}", protocol.as_str(), nft_set(ports)));
    parts.push("counter".to_string());
    parts.push("accept".to_string());
    parts.push(format!("comment \"{comment}\""));
    parts.join(" ")
}

/// Formats an anonymous nftables set: `{ a, b }`
pub(crate) fn nft_set(items: &[impl AsRef<str>]) -> String {
    let items: Vec<&str> = items.iter().map(|i| i.as_ref()).collect();
    format!("{{ {} }}", items.join(", "))
}

/// Sorts rules lexically and drops duplicates
pub fn unique_sorted(mut rules: Vec<CompiledRule>) -> Vec<CompiledRule> {
    rules.sort_unstable();
    rules.dedup();
    rules
}
