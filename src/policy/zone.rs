//! Zones, application exceptions and machine-wide settings.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of every correlation id this daemon generates.
pub const CORRELATION_PREFIX: &str = "[ZW";

/// Marks correlation ids that do not belong to a zone exception.
pub const GLOBAL_MARKER: char = '+';

/// Fresh correlation id for a zone exception.
pub fn generate_correlation_id() -> String {
    format!("{}{}]", CORRELATION_PREFIX, Uuid::new_v4().as_simple())
}

/// Fresh correlation id for rules not owned by a zone exception.
pub fn generate_global_id() -> String {
    format!("{}{}", GLOBAL_MARKER, generate_correlation_id())
}

/// Whether `id` names a zone exception (as opposed to a global rule).
pub fn is_exception_id(id: &str) -> bool {
    id.starts_with(CORRELATION_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerPolicy {
    #[default]
    Permanent,
    UntilReboot,
    ExpireAfterMinutes(u32),
}

/// Extra ports opened for an exception on top of its profiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraPorts {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tcp_listen_local: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub udp_listen_local: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tcp_outbound_remote: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub udp_outbound_remote: String,
}

impl ExtraPorts {
    pub fn is_empty(&self) -> bool {
        self.tcp_listen_local.is_empty()
            && self.udp_listen_local.is_empty()
            && self.tcp_outbound_remote.is_empty()
            && self.udp_outbound_remote.is_empty()
    }
}

/// Permission granting traffic for one application or service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub executable_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default)]
    pub profiles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "ExtraPorts::is_empty")]
    pub extra_ports: ExtraPorts,
    #[serde(default)]
    pub timer: TimerPolicy,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Exception {
    pub fn new(executable_path: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            executable_path: executable_path.into(),
            service_name: None,
            profiles: BTreeSet::new(),
            extra_ports: ExtraPorts::default(),
            timer: TimerPolicy::Permanent,
            created_at: Utc::now(),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles.insert(profile.into());
        self
    }

    pub fn with_timer(mut self, timer: TimerPolicy) -> Self {
        self.timer = timer;
        self
    }

    /// Assign a correlation id if there is none. Returns `true` when a new
    /// id was generated.
    pub fn ensure_correlation_id(&mut self) -> bool {
        if self.correlation_id.as_deref().is_some_and(|id| !id.is_empty()) {
            return false;
        }
        self.correlation_id = Some(generate_correlation_id());
        true
    }

    pub fn id(&self) -> Option<&str> {
        self.correlation_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Short label for log lines.
    pub fn display_name(&self) -> String {
        if let Some(service) = self.service_name.as_deref().filter(|s| !s.is_empty()) {
            return service.to_string();
        }
        Path::new(&self.executable_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "(any application)".to_string())
    }

    /// Whether a time-limited exception has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.timer {
            TimerPolicy::ExpireAfterMinutes(minutes) if minutes > 0 => {
                self.created_at + Duration::minutes(i64::from(minutes)) <= now
            }
            _ => false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Network-profile-scoped bundle of exceptions and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    #[serde(default)]
    pub exceptions: Vec<Exception>,
    #[serde(default)]
    pub special_exceptions: Vec<String>,
    #[serde(default)]
    pub allow_local_subnet: bool,
    #[serde(default = "default_true")]
    pub block_malware_ports: bool,
    #[serde(default = "default_true")]
    pub enable_default_backend_rules: bool,
}

impl Zone {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exceptions: Vec::new(),
            special_exceptions: Vec::new(),
            allow_local_subnet: false,
            block_malware_ports: true,
            enable_default_backend_rules: true,
        }
    }

    /// Add an exception, replacing any existing one with the same id.
    pub fn add_exception(&mut self, exception: Exception) {
        self.exceptions.push(exception);
        self.normalize();
    }

    /// Keep exceptions unique by correlation id; the newest entry wins.
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        let mut kept: Vec<Exception> = Vec::with_capacity(self.exceptions.len());
        for exception in self.exceptions.drain(..).rev() {
            match exception.id() {
                Some(id) if !seen.insert(id.to_string()) => continue,
                _ => kept.push(exception),
            }
        }
        kept.reverse();
        self.exceptions = kept;
    }

    pub fn has_exception(&self, id: &str) -> bool {
        self.exceptions.iter().any(|e| e.id() == Some(id))
    }

    pub fn remove_exception(&mut self, id: &str) -> Option<Exception> {
        let index = self.exceptions.iter().position(|e| e.id() == Some(id))?;
        Some(self.exceptions.remove(index))
    }

    /// Ids of exceptions whose timer has run out at `now`.
    pub fn expired_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.exceptions
            .iter()
            .filter(|e| e.is_expired(now))
            .filter_map(|e| e.id().map(str::to_string))
            .collect()
    }

    /// Drop exceptions that only last until reboot. Returns `true` if any
    /// were removed.
    pub fn drop_until_reboot(&mut self) -> bool {
        let before = self.exceptions.len();
        self.exceptions
            .retain(|e| e.timer != TimerPolicy::UntilReboot);
        self.exceptions.len() != before
    }
}

/// Machine-wide settings shared by every zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSettings {
    /// Hold the hosts file read-only while the daemon runs.
    #[serde(default)]
    pub lock_hosts_file: bool,

    /// Start the daemon at boot.
    #[serde(default = "default_true")]
    pub autostart: bool,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            lock_hosts_file: false,
            autostart: true,
        }
    }
}
