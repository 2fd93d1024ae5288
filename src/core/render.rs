//! Ruleset assembly and nftables text rendering
//!
//! [`Ruleset::build`] gathers everything the forward chain needs: compiled
//! policy rules, service-derived ingress rules, rate limits, SNAT rules and the
//! declared sets. [`Ruleset::to_nft_text`] turns it into the artifact handed to
//! `nft -f`.
//!
//! # Layout
//!
//! ```text
//! table inet firewall {
//!     set cluster_prefixes { ... }
//!     set <fqdn sets> { ... }
//!     chain forward {
//!         <rate limits>
//!         ct state established,related accept
//!         jump forward_ingress / forward_egress
//!     }
//!     chain forward_ingress { <ingress rules> }
//!     chain forward_egress { <egress rules> }
//!     chain postrouting { <snat rules> }
//! }
//! ```

use crate::core::compiler::{
    CLUSTER_PREFIXES_SET, CompiledRule, assemble_destination_port_rule, compile_egress, compile_policy,
    nft_set, port_buckets, unique_sorted,
};
use crate::core::error::{Error, Result};
use crate::core::policy::{
    ClusterwideNetworkPolicy, FirewallSpec, Protocol, Service, ServiceType,
};
use crate::core::resolver::{ConsistentView, IpSet, SetResolver};
use crate::core::validate::validate_policy;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Name of the nftables table the ruleset owns
pub const TABLE_NAME: &str = "firewall";

/// Everything rendered into one nftables artifact
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ruleset {
    pub ingress: Vec<CompiledRule>,
    pub egress: Vec<CompiledRule>,
    pub rate_limit_rules: Vec<CompiledRule>,
    pub snat_rules: Vec<CompiledRule>,
    pub sets: Vec<IpSet>,
    pub internal_prefixes: Vec<String>,
    pub private_vrf: u64,
}

/// A built ruleset together with the policies as compiled
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub ruleset: Ruleset,
    /// Valid policies with the selector sets the rules were built from
    pub applied: Vec<ClusterwideNetworkPolicy>,
    /// Policies left out because they failed validation, with their
    /// selectors' sets filled in like the applied ones
    pub skipped: Vec<ClusterwideNetworkPolicy>,
}

impl Ruleset {
    /// Compiles all policies and services into a ruleset.
    ///
    /// Policies that fail validation are skipped with a warning. Resolver
    /// answers are pinned for the whole build.
    pub fn build(
        policies: &[ClusterwideNetworkPolicy],
        services: &[Service],
        firewall: &FirewallSpec,
        resolver: &impl SetResolver,
    ) -> Result<BuildOutput> {
        let private_vrf = firewall
            .private_vrf()
            .ok_or_else(|| Error::validation("firewall.networks", "no primary private network with a VRF"))?;

        let view = ConsistentView::new(resolver);
        let mut ingress = Vec::new();
        let mut egress = Vec::new();
        let mut applied = Vec::with_capacity(policies.len());
        let mut skipped = Vec::new();

        for policy in policies {
            if let Err(e) = validate_policy(policy) {
                warn!("Skipping policy {}: {e}", policy.key());
                let (_, resolved) = compile_egress(policy, &view);
                skipped.push(resolved);
                continue;
            }
            let compiled = compile_policy(policy, &view);
            ingress.extend(compiled.ingress);
            egress.extend(compiled.egress);
            applied.push(compiled.policy);
        }

        for service in services {
            ingress.extend(service_rules(service));
        }

        let sets = declared_sets(view.sets_for_rendering(), &applied);
        debug!(
            "Built ruleset: {} ingress, {} egress rule(s), {} set(s)",
            ingress.len(),
            egress.len(),
            sets.len()
        );

        Ok(BuildOutput {
            ruleset: Ruleset {
                ingress: unique_sorted(ingress),
                egress: unique_sorted(egress),
                rate_limit_rules: rate_limit_rules(firewall),
                snat_rules: snat_rules(firewall)?,
                sets,
                internal_prefixes: firewall.internal_prefixes.clone(),
                private_vrf,
            },
            applied,
            skipped,
        })
    }

    /// Renders the nftables text artifact
    pub fn to_nft_text(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "table inet {TABLE_NAME} {{");

        let _ = writeln!(out, "    set {CLUSTER_PREFIXES_SET} {{");
        let _ = writeln!(out, "        type ipv4_addr");
        let _ = writeln!(out, "        flags interval");
        if !self.internal_prefixes.is_empty() {
            let _ = writeln!(out, "        elements = {}", nft_set(&self.internal_prefixes));
        }
        let _ = writeln!(out, "    }}\n");

        for set in &self.sets {
            let _ = writeln!(out, "    set {} {{", set.name);
            let _ = writeln!(out, "        type {}", set.family);
            if !set.members.is_empty() {
                let _ = writeln!(out, "        elements = {}", nft_set(&set.members));
            }
            let _ = writeln!(out, "    }}\n");
        }

        let _ = writeln!(out, "    chain forward {{");
        let _ = writeln!(out, "        type filter hook forward priority 0; policy drop;");
        for rule in &self.rate_limit_rules {
            let _ = writeln!(out, "        {rule}");
        }
        let _ = writeln!(
            out,
            "        ct state invalid drop comment \"drop invalid packets\""
        );
        let _ = writeln!(
            out,
            "        ct state established,related accept comment \"accept established connections\""
        );
        let _ = writeln!(
            out,
            "        iifname \"vrf{}\" jump forward_egress comment \"traffic leaving the cluster\"",
            self.private_vrf
        );
        let _ = writeln!(
            out,
            "        oifname \"vrf{}\" jump forward_ingress comment \"traffic entering the cluster\"",
            self.private_vrf
        );
        let _ = writeln!(out, "        counter comment \"count dropped packets\"");
        let _ = writeln!(out, "    }}\n");

        Self::write_chain(&mut out, "forward_ingress", &self.ingress);
        Self::write_chain(&mut out, "forward_egress", &self.egress);

        let _ = writeln!(out, "    chain postrouting {{");
        let _ = writeln!(out, "        type nat hook postrouting priority 100; policy accept;");
        for rule in &self.snat_rules {
            let _ = writeln!(out, "        {rule}");
        }
        let _ = writeln!(out, "    }}");

        let _ = writeln!(out, "}}");
        out
    }

    fn write_chain(out: &mut String, name: &str, rules: &[CompiledRule]) {
        use std::fmt::Write;

        let _ = writeln!(out, "    chain {name} {{");
        for rule in rules {
            let _ = writeln!(out, "        {rule}");
        }
        let _ = writeln!(out, "    }}\n");
    }
}

/// Sets the resolver declares, plus empty declarations for sets the compiled
/// rules reference but the resolver no longer lists, so `nft` never sees a
/// dangling `@set`.
fn declared_sets(mut sets: Vec<IpSet>, applied: &[ClusterwideNetworkPolicy]) -> Vec<IpSet> {
    let referenced: BTreeSet<&str> = applied
        .iter()
        .flat_map(|p| &p.spec.egress)
        .filter(|e| e.to.is_empty())
        .flat_map(|e| &e.to_fqdns)
        .flat_map(|s| &s.sets)
        .map(|s| s.name.as_str())
        .collect();

    for name in referenced {
        if !sets.iter().any(|s| s.name == name) {
            sets.push(IpSet::empty(name));
        }
    }
    sets.sort_by(|a, b| a.name.cmp(&b.name));
    sets.dedup_by(|a, b| a.name == b.name);
    sets
}

/// Ingress rules for a load balancer service's ingress addresses
pub fn service_rules(service: &Service) -> Vec<CompiledRule> {
    if service.service_type != ServiceType::LoadBalancer || service.ingress_ips.is_empty() {
        return Vec::new();
    }

    let mut common = Vec::with_capacity(2);
    if !service.source_ranges.is_empty() {
        common.push(format!("ip saddr {}", nft_set(&service.source_ranges)));
    }
    common.push(format!("ip daddr {}", nft_set(&service.ingress_ips)));

    let comment = format!(
        "accept traffic for k8s service {}/{}",
        service.namespace, service.name
    );
    let (tcp, udp) = port_buckets(
        service
            .ports
            .iter()
            .map(|p| (p.protocol.unwrap_or(Protocol::Tcp), p.port.to_string())),
    );

    let mut rules = Vec::with_capacity(2);
    if !tcp.is_empty() {
        rules.push(assemble_destination_port_rule(&common, Protocol::Tcp, &tcp, &comment));
    }
    if !udp.is_empty() {
        rules.push(assemble_destination_port_rule(&common, Protocol::Udp, &udp, &comment));
    }
    rules
}

/// Drops traffic entering through a network above its configured rate
pub fn rate_limit_rules(firewall: &FirewallSpec) -> Vec<CompiledRule> {
    firewall
        .rate_limits
        .iter()
        .filter_map(|limit| {
            let Some(vrf) = firewall.network(&limit.network_id).and_then(|n| n.vrf) else {
                warn!("Ignoring rate limit for unknown network {}", limit.network_id);
                return None;
            };
            Some(format!(
                "meta iifname \"vrf{vrf}\" limit rate over {} mbytes/second counter name drop_ratelimit drop",
                limit.rate
            ))
        })
        .collect()
}

/// Source-NATs cluster traffic leaving through each configured network
pub fn snat_rules(firewall: &FirewallSpec) -> Result<Vec<CompiledRule>> {
    let mut rules = Vec::with_capacity(firewall.egress_snat.len());
    for snat in &firewall.egress_snat {
        let vrf = firewall
            .network(&snat.network_id)
            .and_then(|n| n.vrf)
            .ok_or_else(|| {
                Error::validation(
                    "firewall.egressSnat",
                    format!("network {} is not attached or has no VRF", snat.network_id),
                )
            })?;
        let target = match snat.ips.as_slice() {
            [] => continue,
            [ip] => ip.clone(),
            ips => {
                let map = ips
                    .iter()
                    .enumerate()
                    .map(|(i, ip)| format!("{i} : {ip}"))
                    .collect::<Vec<_>>();
                format!(
                    "jhash ip daddr . ip saddr mod {} map {}",
                    ips.len(),
                    nft_set(&map)
                )
            }
        };
        rules.push(format!(
            "ip saddr @{CLUSTER_PREFIXES_SET} oifname \"vlan{vrf}\" counter snat to {target} comment \"snat for {}\"",
            snat.network_id
        ));
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{
        EgressSnat, FqdnSelector, IngressRule, IpBlock, PolicyKey, PolicyPort, PolicySpec,
        RateLimit, ServicePort, SetRef,
    };
    use crate::core::resolver::FqdnCache;
    use crate::core::test_helpers::{StaticResolver, egress_fqdn_policy, firewall_spec, policy};

    fn lb_service() -> Service {
        Service {
            namespace: "default".to_string(),
            name: "web".to_string(),
            service_type: ServiceType::LoadBalancer,
            ingress_ips: vec!["185.1.2.3".to_string()],
            source_ranges: vec!["1.2.3.0/24".to_string()],
            ports: vec![
                ServicePort {
                    protocol: Some(Protocol::Tcp),
                    port: 443,
                },
                ServicePort {
                    protocol: None,
                    port: 80,
                },
            ],
        }
    }

    #[test]
    fn test_service_rules() {
        let rules = service_rules(&lb_service());
        assert_eq!(
            rules,
            vec![
                r#"ip saddr { 1.2.3.0/24 } ip daddr { 185.1.2.3 } tcp dport { 443, 80 } counter accept comment "accept traffic for k8s service default/web""#
            ]
        );
    }

    #[test]
    fn test_service_rules_ignore_non_load_balancers() {
        let mut svc = lb_service();
        svc.service_type = ServiceType::ClusterIP;
        assert!(service_rules(&svc).is_empty());

        let mut svc = lb_service();
        svc.ingress_ips.clear();
        assert!(service_rules(&svc).is_empty());
    }

    #[test]
    fn test_rate_limit_rules() {
        let mut fw = firewall_spec();
        fw.rate_limits = vec![
            RateLimit {
                network_id: "internet".to_string(),
                rate: 10,
            },
            RateLimit {
                network_id: "unknown".to_string(),
                rate: 5,
            },
        ];
        assert_eq!(
            rate_limit_rules(&fw),
            vec![
                "meta iifname \"vrf104009\" limit rate over 10 mbytes/second counter name drop_ratelimit drop"
            ]
        );
    }

    #[test]
    fn test_snat_rules() {
        let mut fw = firewall_spec();
        fw.egress_snat = vec![EgressSnat {
            network_id: "internet".to_string(),
            ips: vec!["185.1.2.10".to_string(), "185.1.2.11".to_string()],
        }];
        let rules = snat_rules(&fw).unwrap();
        assert_eq!(
            rules,
            vec![
                r#"ip saddr @cluster_prefixes oifname "vlan104009" counter snat to jhash ip daddr . ip saddr mod 2 map { 0 : 185.1.2.10, 1 : 185.1.2.11 } comment "snat for internet""#
            ]
        );

        fw.egress_snat[0].ips.truncate(1);
        assert!(snat_rules(&fw).unwrap()[0].contains("snat to 185.1.2.10 comment"));

        fw.egress_snat[0].network_id = "missing".to_string();
        assert!(snat_rules(&fw).is_err());
    }

    #[test]
    fn test_build_requires_private_network() {
        let fw = FirewallSpec::default();
        let err = Ruleset::build(&[], &[], &fw, &StaticResolver::default()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_build_skips_invalid_policies() {
        let valid = policy(
            "valid",
            PolicySpec {
                ingress: vec![IngressRule {
                    from: vec![IpBlock::new("10.0.0.0/8")],
                    ports: vec![PolicyPort::new(Protocol::Tcp, 22)],
                }],
                egress: vec![],
            },
        );
        let invalid = policy(
            "invalid",
            PolicySpec {
                ingress: vec![IngressRule {
                    from: vec![IpBlock::new("not-a-cidr")],
                    ports: vec![PolicyPort::new(Protocol::Tcp, 22)],
                }],
                egress: vec![],
            },
        );

        let out = Ruleset::build(
            &[valid, invalid],
            &[lb_service()],
            &firewall_spec(),
            &StaticResolver::default(),
        )
        .unwrap();
        assert_eq!(out.applied.len(), 1);
        let skipped: Vec<PolicyKey> = out.skipped.iter().map(ClusterwideNetworkPolicy::key).collect();
        assert_eq!(skipped, vec![PolicyKey::new("firewall", "invalid")]);
        assert_eq!(out.ruleset.ingress.len(), 2);
        assert_eq!(out.ruleset.private_vrf, 3981);
    }

    #[test]
    fn test_build_records_resolved_sets() {
        let cache = FqdnCache::new();
        cache.update(
            FqdnSelector::name("example.com").key(),
            vec![IpSet {
                name: "example_v4".to_string(),
                family: crate::core::resolver::SetFamily::Ipv4,
                members: vec!["93.184.216.34".to_string()],
            }],
        );
        let np = egress_fqdn_policy("dns", vec![FqdnSelector::name("example.com")]);

        let out = Ruleset::build(&[np], &[], &firewall_spec(), &cache).unwrap();
        assert_eq!(
            out.applied[0].spec.egress[0].to_fqdns[0].sets,
            vec![SetRef::new("example_v4")]
        );
        assert_eq!(out.ruleset.egress.len(), 2);
        assert_eq!(out.ruleset.sets.len(), 1);

        let text = out.ruleset.to_nft_text();
        assert!(text.contains("set example_v4 {"));
        assert!(text.contains("type ipv4_addr"));
        assert!(text.contains("elements = { 93.184.216.34 }"));
        assert!(text.contains("ip daddr @example_v4 udp dport { 53 }"));
    }

    #[test]
    fn test_skipped_policy_carries_resolved_sets() {
        let resolver = StaticResolver::with(&[("example.com", &["example_v4"])]);
        let mut np = egress_fqdn_policy("broken", vec![FqdnSelector::name("example.com")]);
        np.spec.ingress.push(IngressRule {
            from: vec![IpBlock::new("not-a-cidr")],
            ports: vec![],
        });

        let out = Ruleset::build(&[np], &[], &firewall_spec(), &resolver).unwrap();
        assert!(out.applied.is_empty());
        assert!(out.ruleset.egress.is_empty());
        assert_eq!(
            out.skipped[0].spec.egress[0].to_fqdns[0].sets,
            vec![SetRef::new("example_v4")]
        );
    }

    #[test]
    fn test_declared_sets_fill_in_dangling_references() {
        let mut selector = FqdnSelector::name("example.com");
        selector.sets = vec![SetRef::new("gone")];
        let np = egress_fqdn_policy("dns", vec![selector]);

        let sets = declared_sets(vec![IpSet::empty("other")], &[np]);
        let names: Vec<_> = sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["gone", "other"]);
    }

    #[test]
    fn test_nft_text_layout() {
        let ruleset = Ruleset {
            ingress: vec!["tcp dport { 22 } counter accept".to_string()],
            egress: vec!["ip saddr == @cluster_prefixes udp dport { 53 } counter accept".to_string()],
            rate_limit_rules: vec![],
            snat_rules: vec!["oifname \"vlan1\" counter snat to 1.1.1.1".to_string()],
            sets: vec![],
            internal_prefixes: vec!["10.0.0.0/22".to_string()],
            private_vrf: 42,
        };

        let text = ruleset.to_nft_text();
        assert!(text.starts_with("table inet firewall {"));
        assert!(text.contains("elements = { 10.0.0.0/22 }"));
        assert!(text.contains("iifname \"vrf42\" jump forward_egress"));
        assert!(text.contains("chain forward_ingress {\n        tcp dport { 22 } counter accept\n    }"));
        assert!(text.contains("type nat hook postrouting priority 100; policy accept;"));
        assert!(text.trim_end().ends_with('}'));
    }

    #[test]
    fn test_render_is_deterministic() {
        let np = egress_fqdn_policy(
            "dns",
            vec![FqdnSelector::name("a.com"), FqdnSelector::name("b.com")],
        );
        let resolver = StaticResolver::with(&[("a.com", &["sa"]), ("b.com", &["sb"])]);
        let first = Ruleset::build(&[np.clone()], &[], &firewall_spec(), &resolver).unwrap();
        let second = Ruleset::build(&[np], &[], &firewall_spec(), &resolver).unwrap();
        assert_eq!(first.ruleset.to_nft_text(), second.ruleset.to_nft_text());
    }
}
