//! Policy validation
//!
//! Rejects policies the compiler would turn into rules `nft` refuses to load,
//! or into rules that silently match something other than what was written.
//! Invalid policies are skipped during a ruleset build; they never abort it.

use crate::core::error::{Error, Result};
use crate::core::policy::{
    ClusterwideNetworkPolicy, EgressRule, FqdnSelector, IpBlock, POLICY_NAMESPACE, PolicyPort,
};
use ipnetwork::Ipv4Network;

/// Validates one policy.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first offending field.
pub fn validate_policy(policy: &ClusterwideNetworkPolicy) -> Result<()> {
    if policy.namespace != POLICY_NAMESPACE {
        return Err(Error::validation(
            "metadata.namespace",
            format!(
                "policy {} must live in namespace {POLICY_NAMESPACE}",
                policy.key()
            ),
        ));
    }
    if policy.name.is_empty() {
        return Err(Error::validation("metadata.name", "name must not be empty"));
    }

    for (i, entry) in policy.spec.ingress.iter().enumerate() {
        for block in &entry.from {
            validate_block(&format!("spec.ingress[{i}].from"), block)?;
        }
        validate_ports(&format!("spec.ingress[{i}].ports"), &entry.ports)?;
    }

    for (i, entry) in policy.spec.egress.iter().enumerate() {
        validate_egress(i, entry)?;
    }

    Ok(())
}

fn validate_egress(index: usize, entry: &EgressRule) -> Result<()> {
    let field = format!("spec.egress[{index}]");
    for block in &entry.to {
        validate_block(&format!("{field}.to"), block)?;
    }
    for selector in &entry.to_fqdns {
        validate_selector(&format!("{field}.toFQDNs"), selector)?;
    }
    validate_ports(&format!("{field}.ports"), &entry.ports)
}

/// Parses a CIDR, accepting a bare address as a /32
pub fn parse_cidr(input: &str) -> Option<Ipv4Network> {
    input.parse::<Ipv4Network>().ok()
}

fn validate_block(field: &str, block: &IpBlock) -> Result<()> {
    let network = parse_cidr(&block.cidr)
        .ok_or_else(|| Error::validation(field, format!("invalid CIDR {}", block.cidr)))?;

    for except in &block.except {
        let excluded = parse_cidr(except)
            .ok_or_else(|| Error::validation(field, format!("invalid except CIDR {except}")))?;
        if !network.contains(excluded.network()) || excluded.prefix() < network.prefix() {
            return Err(Error::validation(
                field,
                format!("except {except} is not within {}", block.cidr),
            ));
        }
    }
    Ok(())
}

fn validate_selector(field: &str, selector: &FqdnSelector) -> Result<()> {
    match (
        selector.match_name.is_empty(),
        selector.match_pattern.is_empty(),
    ) {
        (true, true) => Err(Error::validation(
            field,
            "selector needs a matchName or a matchPattern",
        )),
        (false, false) => Err(Error::validation(
            field,
            format!(
                "selector sets both matchName {} and matchPattern {}",
                selector.match_name, selector.match_pattern
            ),
        )),
        _ => Ok(()),
    }
}

fn validate_ports(field: &str, ports: &[PolicyPort]) -> Result<()> {
    for port in ports {
        if port.port == 0 {
            return Err(Error::validation(field, "port must be between 1 and 65535"));
        }
        if let Some(end) = port.end_port
            && end < port.port
        {
            return Err(Error::validation(
                field,
                format!("end port {end} is below start port {}", port.port),
            ));
        }
    }
    Ok(())
}
