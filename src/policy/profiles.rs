//! Profile templates and the catalog that serves them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::rule::{Action, Direction, Protocol, RuleTemplate};
use super::zone::Exception;

/// Reserved profile applied when a zone blocks malware ports.
pub const MALWARE_PROFILE: &str = "Malware port block";

/// A named, reusable set of rule templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RuleTemplate>,
}

impl Profile {
    pub fn new(name: impl Into<String>, rules: Vec<RuleTemplate>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

/// A well-known application that a zone can enable by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub name: String,
    #[serde(default)]
    pub executable_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default)]
    pub profiles: BTreeSet<String>,
}

impl AppDescriptor {
    /// Build a fresh exception from this descriptor.
    pub fn to_exception(&self) -> Result<Exception, LookupError> {
        if self.profiles.is_empty() {
            return Err(LookupError::Incomplete(self.name.clone()));
        }
        let mut exception = Exception::new(self.executable_path.clone());
        exception.service_name = self.service_name.clone();
        exception.profiles = self.profiles.clone();
        Ok(exception)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("unknown application '{0}'")]
    UnknownApplication(String),

    #[error("application '{0}' references no profiles")]
    Incomplete(String),
}

/// Lookup capability the rule synthesizer consumes.
#[cfg_attr(test, mockall::automock)]
pub trait ProfileSource {
    fn profile(&self, name: &str) -> Option<Profile>;

    /// Resolve a special-exception name to an exception descriptor.
    fn special_exception(&self, name: &str) -> Result<Exception, LookupError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCatalog {
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    pub applications: BTreeMap<String, AppDescriptor>,
}

impl ProfileCatalog {
    /// Load the catalog from `path`, falling back to the built-in catalog
    /// when the file is missing or unreadable.
    pub fn load_or_builtin(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No profile catalog at {}, using built-in", path.display());
                return Self::builtin();
            }
            Err(e) => {
                warn!("Cannot read profile catalog {}: {}", path.display(), e);
                return Self::builtin();
            }
        };

        match serde_json::from_str::<Self>(&content) {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!("Invalid profile catalog {}: {}", path.display(), e);
                Self::builtin()
            }
        }
    }

    pub fn builtin() -> Self {
        let profiles = [
            Profile::new(
                MALWARE_PROFILE,
                vec![
                    RuleTemplate::new("Block RPC and SMB", Action::Block, Direction::In, Protocol::Tcp)
                        .local_ports("135,137-139,445"),
                    RuleTemplate::new("Block NetBIOS", Action::Block, Direction::In, Protocol::Udp)
                        .local_ports("137-138"),
                ],
            ),
            Profile::new(
                "Web browser",
                vec![
                    RuleTemplate::new("Web", Action::Allow, Direction::Out, Protocol::Tcp)
                        .remote_ports("80,443,8080"),
                    RuleTemplate::new("QUIC", Action::Allow, Direction::Out, Protocol::Udp)
                        .remote_ports("443"),
                ],
            ),
            Profile::new(
                "Name resolution",
                vec![
                    RuleTemplate::new("DNS", Action::Allow, Direction::Out, Protocol::Udp)
                        .remote_ports("53"),
                    RuleTemplate::new("DNS over TCP", Action::Allow, Direction::Out, Protocol::Tcp)
                        .remote_ports("53"),
                ],
            ),
            Profile::new(
                "Time sync",
                vec![
                    RuleTemplate::new("NTP", Action::Allow, Direction::Out, Protocol::Udp)
                        .remote_ports("123"),
                ],
            ),
            Profile::new(
                "Outbound only",
                vec![RuleTemplate::new(
                    "Outbound",
                    Action::Allow,
                    Direction::Out,
                    Protocol::Any,
                )],
            ),
            Profile::new(
                "Remote login server",
                vec![
                    RuleTemplate::new("SSH", Action::Allow, Direction::In, Protocol::Tcp)
                        .local_ports("22"),
                ],
            ),
        ];

        let applications = [
            AppDescriptor {
                name: "Name resolution".into(),
                executable_path: String::new(),
                service_name: Some("systemd-resolved".into()),
                profiles: BTreeSet::from(["Name resolution".to_string()]),
            },
            AppDescriptor {
                name: "Time sync".into(),
                executable_path: String::new(),
                service_name: Some("systemd-timesyncd".into()),
                profiles: BTreeSet::from(["Time sync".to_string()]),
            },
            AppDescriptor {
                name: "OpenSSH server".into(),
                executable_path: "/usr/sbin/sshd".into(),
                service_name: Some("sshd".into()),
                profiles: BTreeSet::from(["Remote login server".to_string()]),
            },
        ];

        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
            applications: applications
                .into_iter()
                .map(|a| (a.name.clone(), a))
                .collect(),
        }
    }
}

impl ProfileSource for ProfileCatalog {
    fn profile(&self, name: &str) -> Option<Profile> {
        self.profiles.get(name).cloned()
    }

    fn special_exception(&self, name: &str) -> Result<Exception, LookupError> {
        self.applications
            .get(name)
            .ok_or_else(|| LookupError::UnknownApplication(name.to_string()))?
            .to_exception()
    }
}
