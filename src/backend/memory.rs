//! Record-only backend.
//!
//! Keeps policy switches and the rule list in memory and reports its own
//! mutations on the change feed, attributed to this executable. Events from
//! other actors can be injected through an [`EventSink`].

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use super::{
    ACTOR_PROPERTY, BackendError, BackendEvent, ChangeKind, FirewallBackend, NetworkProfile,
    PolicySettings, own_executable,
};
use crate::policy::{Action, Direction, Protocol, Rule};

/// Fan-out of change events to every subscriber.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<Sender<BackendEvent>>>>,
}

impl EventSink {
    pub fn subscribe(&self) -> Receiver<BackendEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to all live subscribers, forgetting closed ones.
    pub fn emit(&self, event: BackendEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Debug)]
pub struct MemoryBackend {
    policy: PolicySettings,
    rules: Vec<Rule>,
    defaults: Vec<Rule>,
    profiles: Vec<NetworkProfile>,
    overridden: bool,
    actor: String,
    sink: EventSink,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Backend on the Private profile with the stock host rules installed.
    pub fn new() -> Self {
        Self::with_defaults(host_default_rules())
    }

    pub fn with_defaults(defaults: Vec<Rule>) -> Self {
        Self {
            policy: PolicySettings::host_default(),
            rules: defaults.clone(),
            defaults,
            profiles: vec![NetworkProfile::Private],
            overridden: false,
            actor: own_executable(),
            sink: EventSink::default(),
        }
    }

    /// Handle for injecting events from other actors.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn set_network_profiles(&mut self, profiles: Vec<NetworkProfile>) {
        self.profiles = profiles;
        self.emit(ChangeKind::ProfileSwitched);
    }

    pub fn set_overridden(&mut self, overridden: bool) {
        self.overridden = overridden;
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    fn emit(&self, kind: ChangeKind) {
        self.sink
            .emit(BackendEvent::new(kind).with_property(ACTOR_PROPERTY, self.actor.clone()));
    }
}

impl FirewallBackend for MemoryBackend {
    fn reset(&mut self) -> Result<(), BackendError> {
        self.policy = PolicySettings::host_default();
        self.rules = self.defaults.clone();
        self.emit(ChangeKind::ResetToDefaults);
        Ok(())
    }

    fn policy(&self) -> PolicySettings {
        self.policy
    }

    fn apply_policy(&mut self, settings: PolicySettings) -> Result<(), BackendError> {
        if self.policy != settings {
            self.policy = settings;
            self.emit(ChangeKind::SettingChanged);
        }
        Ok(())
    }

    fn current_profiles(&self) -> Vec<NetworkProfile> {
        self.profiles.clone()
    }

    fn local_policy_overridden(&self) -> bool {
        self.overridden
    }

    fn rules(&self) -> &[Rule] {
        &self.rules
    }

    fn add_rules(&mut self, rules: Vec<Rule>) -> Result<(), BackendError> {
        if rules.is_empty() {
            return Ok(());
        }
        self.rules.extend(rules);
        self.emit(ChangeKind::RuleAdded);
        Ok(())
    }

    fn remove_at(&mut self, index: usize) -> Result<Rule, BackendError> {
        if index >= self.rules.len() {
            return Err(BackendError::NoSuchRule(index));
        }
        let rule = self.rules.remove(index);
        self.emit(ChangeKind::RuleDeleted);
        Ok(rule)
    }

    fn set_rule_enabled(&mut self, index: usize, enabled: bool) -> Result<(), BackendError> {
        let rule = self
            .rules
            .get_mut(index)
            .ok_or(BackendError::NoSuchRule(index))?;
        if rule.enabled != enabled {
            rule.enabled = enabled;
            self.emit(ChangeKind::RuleChanged);
        }
        Ok(())
    }

    fn disable_all(&mut self) -> Result<(), BackendError> {
        let mut changed = false;
        for rule in &mut self.rules {
            changed |= rule.enabled;
            rule.enabled = false;
        }
        if changed {
            self.emit(ChangeKind::RuleChanged);
        }
        Ok(())
    }

    fn subscribe(&mut self) -> Receiver<BackendEvent> {
        self.sink.subscribe()
    }
}

/// Built-in rules present on a freshly reset host.
pub fn host_default_rules() -> Vec<Rule> {
    let host_rule = |name: &str, direction, protocol, ports: &str, action| Rule {
        name: name.to_string(),
        correlation_id: String::new(),
        direction,
        protocol,
        action,
        application: None,
        service: None,
        local_ports: (!ports.is_empty()).then(|| ports.to_string()),
        remote_ports: None,
        remote_addresses: None,
        enabled: true,
    };

    vec![
        host_rule("Core Networking - DHCP (In)", Direction::In, Protocol::Udp, "68", Action::Allow),
        host_rule("Core Networking - ICMP Echo (In)", Direction::In, Protocol::Icmp, "", Action::Allow),
        host_rule("Core Networking - Teredo (In)", Direction::In, Protocol::Udp, "3544", Action::Block),
    ]
}
