//! Packet-filter backend contract.
//!
//! The engine only talks to [`FirewallBackend`]; the concrete binding
//! behind it is interchangeable. [`MemoryBackend`] is the record-only
//! implementation shipped with the daemon and used by the tests.

mod memory;

pub use memory::{EventSink, MemoryBackend};

use std::collections::HashMap;
use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};

use crate::policy::{Action, Rule};

/// Event property naming the executable that made a change.
pub const ACTOR_PROPERTY: &str = "modifying_application";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no rule at index {0}")]
    NoSuchRule(usize),

    #[error("no active network profile")]
    NoActiveProfile,

    #[error("backend refused operation: {0}")]
    Refused(String),
}

/// Network classification reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkProfile {
    Private,
    Domain,
    Public,
}

impl NetworkProfile {
    pub fn zone_name(self) -> &'static str {
        match self {
            NetworkProfile::Private => "Private",
            NetworkProfile::Domain => "Domain",
            NetworkProfile::Public => "Public",
        }
    }
}

/// Path recorded as the actor of this process's own backend changes.
pub fn own_executable() -> String {
    std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string())
}

/// Pick the zone for the active profiles: Private, then Domain, then Public.
pub fn zone_name_for(active: &[NetworkProfile]) -> Result<&'static str, BackendError> {
    [
        NetworkProfile::Private,
        NetworkProfile::Domain,
        NetworkProfile::Public,
    ]
    .into_iter()
    .find(|p| active.contains(p))
    .map(NetworkProfile::zone_name)
    .ok_or(BackendError::NoActiveProfile)
}

/// Global switches of the packet filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub enabled: bool,
    pub default_inbound: Action,
    pub default_outbound: Action,
    pub block_all_inbound: bool,
    pub notifications_disabled: bool,
}

impl PolicySettings {
    /// Host defaults restored by `reset()`.
    pub fn host_default() -> Self {
        Self {
            enabled: true,
            default_inbound: Action::Block,
            default_outbound: Action::Allow,
            block_all_inbound: false,
            notifications_disabled: false,
        }
    }

    /// Default-deny in both directions; the base of every managed mode.
    pub fn managed_baseline() -> Self {
        Self {
            enabled: true,
            default_inbound: Action::Block,
            default_outbound: Action::Block,
            block_all_inbound: false,
            notifications_disabled: true,
        }
    }
}

/// Classified kinds of backend change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    SettingChanged,
    RuleAdded,
    RuleChanged,
    RuleDeleted,
    ProfileSwitched,
    ResetToDefaults,
}

impl ChangeKind {
    pub const fn code(self) -> u32 {
        match self {
            ChangeKind::SettingChanged => 2003,
            ChangeKind::RuleAdded => 2004,
            ChangeKind::RuleChanged => 2005,
            ChangeKind::RuleDeleted => 2006,
            ChangeKind::ProfileSwitched => 2010,
            ChangeKind::ResetToDefaults => 2032,
        }
    }

    pub fn classify(code: u32) -> Option<Self> {
        [
            ChangeKind::SettingChanged,
            ChangeKind::RuleAdded,
            ChangeKind::RuleChanged,
            ChangeKind::RuleDeleted,
            ChangeKind::ProfileSwitched,
            ChangeKind::ResetToDefaults,
        ]
        .into_iter()
        .find(|k| k.code() == code)
    }
}

/// One entry of the backend's change-notification feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    pub kind: u32,
    pub properties: HashMap<String, String>,
}

impl BackendEvent {
    pub fn new(kind: ChangeKind) -> Self {
        Self {
            kind: kind.code(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn change_kind(&self) -> Option<ChangeKind> {
        ChangeKind::classify(self.kind)
    }

    /// Path of the process that made the change, if recorded.
    pub fn actor(&self) -> Option<&str> {
        self.properties
            .get(ACTOR_PROPERTY)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Capabilities the engine needs from the packet filter.
///
/// Only the policy authority holds a backend, so implementations need not
/// be `Sync`.
pub trait FirewallBackend: Send {
    /// Restore host defaults: default policy and built-in rules only.
    fn reset(&mut self) -> Result<(), BackendError>;

    fn policy(&self) -> PolicySettings;

    fn apply_policy(&mut self, settings: PolicySettings) -> Result<(), BackendError>;

    fn current_profiles(&self) -> Vec<NetworkProfile>;

    /// Whether a higher authority (e.g. group policy) overrides local rules.
    fn local_policy_overridden(&self) -> bool {
        false
    }

    fn rules(&self) -> &[Rule];

    /// Install `rules` as one unit.
    fn add_rules(&mut self, rules: Vec<Rule>) -> Result<(), BackendError>;

    /// Install `rules` enabled.
    fn enable_rules(&mut self, mut rules: Vec<Rule>) -> Result<(), BackendError> {
        for rule in &mut rules {
            rule.enabled = true;
        }
        self.add_rules(rules)
    }

    fn remove_at(&mut self, index: usize) -> Result<Rule, BackendError>;

    fn set_rule_enabled(&mut self, index: usize, enabled: bool) -> Result<(), BackendError>;

    fn disable_all(&mut self) -> Result<(), BackendError>;

    /// Indices of rules whose correlation id starts with `prefix`.
    fn find_by_tag(&self, prefix: &str) -> Vec<usize> {
        self.rules()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.has_tag(prefix))
            .map(|(i, _)| i)
            .collect()
    }

    /// Remove every rule matching `predicate`. Returns how many went.
    fn remove_where(&mut self, predicate: &dyn Fn(&Rule) -> bool) -> Result<usize, BackendError> {
        let doomed: Vec<usize> = self
            .rules()
            .iter()
            .enumerate()
            .filter(|(_, r)| predicate(r))
            .map(|(i, _)| i)
            .collect();
        for &index in doomed.iter().rev() {
            self.remove_at(index)?;
        }
        Ok(doomed.len())
    }

    /// Open a change-notification feed.
    fn subscribe(&mut self) -> Receiver<BackendEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_precedence() {
        use NetworkProfile::*;
        assert_eq!(zone_name_for(&[Public, Private]).unwrap(), "Private");
        assert_eq!(zone_name_for(&[Public, Domain]).unwrap(), "Domain");
        assert_eq!(zone_name_for(&[Public]).unwrap(), "Public");
        assert!(matches!(
            zone_name_for(&[]),
            Err(BackendError::NoActiveProfile)
        ));
    }

    #[test]
    fn event_kinds_classify() {
        assert_eq!(ChangeKind::classify(2010), Some(ChangeKind::ProfileSwitched));
        assert_eq!(ChangeKind::classify(2032), Some(ChangeKind::ResetToDefaults));
        assert_eq!(ChangeKind::classify(1), None);
    }

    #[test]
    fn event_actor_property() {
        let event = BackendEvent::new(ChangeKind::RuleAdded);
        assert_eq!(event.actor(), None);

        let event = event.with_property(ACTOR_PROPERTY, "/usr/bin/iptables");
        assert_eq!(event.actor(), Some("/usr/bin/iptables"));
        assert_eq!(event.change_kind(), Some(ChangeKind::RuleAdded));
    }
}
