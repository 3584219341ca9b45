//! Declarative policy model and the rule synthesizer.

mod profiles;
mod rule;
mod synth;
mod zone;

pub use profiles::{
    AppDescriptor, LookupError, MALWARE_PROFILE, Profile, ProfileCatalog, ProfileSource,
};
pub use rule::{Action, Direction, LOCAL_SUBNET, Protocol, Rule, RuleError, RuleTemplate, validate_ports};
pub use synth::{Diagnostic, Synthesis, is_global_rule, local_subnet_template, rules_for_exception, synthesize};
pub use zone::{
    CORRELATION_PREFIX, Exception, ExtraPorts, GLOBAL_MARKER, MachineSettings, TimerPolicy, Zone,
    generate_correlation_id, generate_global_id, is_exception_id,
};

#[cfg(test)]
pub use profiles::MockProfileSource;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Top-level enforcement posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Normal,
    AllowOutgoing,
    BlockAll,
    Disabled,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Normal, Mode::AllowOutgoing, Mode::BlockAll, Mode::Disabled];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::AllowOutgoing => "allow_outgoing",
            Mode::BlockAll => "block_all",
            Mode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| format!("unknown mode '{}'", s))
    }
}
