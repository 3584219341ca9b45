//! Rule templates and the concrete rules built from them.

use serde::{Deserialize, Serialize};

/// Remote-address keyword matching the directly attached subnets.
pub const LOCAL_SUBNET: &str = "LocalSubnet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    fn carries_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule has no name")]
    MissingName,

    #[error("invalid port specification '{0}'")]
    InvalidPorts(String),

    #[error("ports can only be given for TCP or UDP rules, not {0:?}")]
    PortsWithoutTransport(Protocol),
}

/// A rule installed in the filtering backend.
///
/// `correlation_id` ties the rule to the exception (or global feature) that
/// produced it; the same id prefixes the display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub correlation_id: String,
    pub direction: Direction,
    pub protocol: Protocol,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addresses: Option<String>,
    pub enabled: bool,
}

impl Rule {
    /// Whether the rule's correlation id starts with `prefix`.
    pub fn has_tag(&self, prefix: &str) -> bool {
        self.correlation_id.starts_with(prefix)
    }
}

/// Reusable rule shape from a profile, not yet bound to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTemplate {
    pub name: String,
    pub action: Action,
    pub direction: Direction,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addresses: Option<String>,
}

impl RuleTemplate {
    pub fn new(
        name: impl Into<String>,
        action: Action,
        direction: Direction,
        protocol: Protocol,
    ) -> Self {
        Self {
            name: name.into(),
            action,
            direction,
            protocol,
            local_ports: None,
            remote_ports: None,
            remote_addresses: None,
        }
    }

    pub fn local_ports(mut self, ports: impl Into<String>) -> Self {
        self.local_ports = Some(ports.into());
        self
    }

    pub fn remote_ports(mut self, ports: impl Into<String>) -> Self {
        self.remote_ports = Some(ports.into());
        self
    }

    pub fn remote_addresses(mut self, addresses: impl Into<String>) -> Self {
        self.remote_addresses = Some(addresses.into());
        self
    }

    /// Build an enabled rule bound to `application`/`service` and tagged
    /// with `correlation_id`.
    pub fn construct(
        &self,
        correlation_id: &str,
        application: Option<&str>,
        service: Option<&str>,
    ) -> Result<Rule, RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::MissingName);
        }
        for ports in [&self.local_ports, &self.remote_ports].into_iter().flatten() {
            if !self.protocol.carries_ports() {
                return Err(RuleError::PortsWithoutTransport(self.protocol));
            }
            validate_ports(ports)?;
        }

        Ok(Rule {
            name: format!("{} {}", correlation_id, self.name),
            correlation_id: correlation_id.to_string(),
            direction: self.direction,
            protocol: self.protocol,
            action: self.action,
            application: application.filter(|a| !a.is_empty()).map(str::to_string),
            service: service.filter(|s| !s.is_empty()).map(str::to_string),
            local_ports: self.local_ports.clone(),
            remote_ports: self.remote_ports.clone(),
            remote_addresses: self.remote_addresses.clone(),
            enabled: true,
        })
    }
}

/// Check a comma-separated port list: `*`, single ports, or `low-high` ranges.
pub fn validate_ports(spec: &str) -> Result<(), RuleError> {
    let invalid = || RuleError::InvalidPorts(spec.to_string());

    if spec.trim().is_empty() {
        return Err(invalid());
    }

    for entry in spec.split(',').map(str::trim) {
        if entry == "*" {
            continue;
        }
        match entry.split_once('-') {
            Some((low, high)) => {
                let low = parse_port(low).ok_or_else(invalid)?;
                let high = parse_port(high).ok_or_else(invalid)?;
                if low > high {
                    return Err(invalid());
                }
            }
            None => {
                parse_port(entry).ok_or_else(invalid)?;
            }
        }
    }

    Ok(())
}

fn parse_port(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|p| *p != 0)
}
