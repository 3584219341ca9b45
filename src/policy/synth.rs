//! Rule synthesis: zone + profile catalog -> concrete rule list.
//!
//! Every step yields a `Result`; failures are folded into
//! [`Synthesis::diagnostics`] and the remaining items are still processed,
//! so one bad exception never blocks the valid ones.

use tracing::warn;

use super::profiles::{LookupError, MALWARE_PROFILE, ProfileSource};
use super::rule::{Action, Direction, LOCAL_SUBNET, Protocol, Rule, RuleError, RuleTemplate};
use super::zone::{Exception, GLOBAL_MARKER, Zone, generate_global_id};

/// Why a single item was left out of the synthesized set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    #[error("special exception '{name}' skipped: {source}")]
    SpecialException { name: String, source: LookupError },

    #[error("rule '{template}' of profile '{profile}' for {subject} skipped: {source}")]
    Template {
        profile: String,
        template: String,
        subject: String,
        source: RuleError,
    },

    #[error("extra ports '{kind}' for {subject} skipped: {source}")]
    ExtraPorts {
        kind: &'static str,
        subject: String,
        source: RuleError,
    },
}

#[derive(Debug, Default)]
pub struct Synthesis {
    pub rules: Vec<Rule>,
    pub diagnostics: Vec<Diagnostic>,
    /// Some exception received a fresh correlation id; the zone must be saved.
    pub ids_assigned: bool,
}

impl Synthesis {
    fn fold(&mut self, result: Result<Rule, Diagnostic>) {
        match result {
            Ok(rule) => self.rules.push(rule),
            Err(diagnostic) => {
                warn!("{}", diagnostic);
                self.diagnostics.push(diagnostic);
            }
        }
    }
}

/// Rule template for the local-subnet allowance shared by Normal and
/// BlockAll.
pub fn local_subnet_template() -> RuleTemplate {
    RuleTemplate::new(
        "Allow local subnet",
        Action::Allow,
        Direction::InOut,
        Protocol::Any,
    )
    .remote_addresses(LOCAL_SUBNET)
}

/// Build the Normal-mode rule set for `zone`.
///
/// Exceptions without a correlation id get one assigned in place.
pub fn synthesize<P: ProfileSource + ?Sized>(zone: &mut Zone, profiles: &P) -> Synthesis {
    let mut out = Synthesis::default();

    for name in &zone.special_exceptions {
        match profiles.special_exception(name) {
            Ok(mut exception) => {
                exception.correlation_id = Some(generate_global_id());
                rules_for_exception(&exception, profiles, &mut out);
            }
            Err(source) => {
                let diagnostic = Diagnostic::SpecialException {
                    name: name.clone(),
                    source,
                };
                warn!("{}", diagnostic);
                out.diagnostics.push(diagnostic);
            }
        }
    }

    for exception in &mut zone.exceptions {
        if exception.ensure_correlation_id() {
            out.ids_assigned = true;
        }
        rules_for_exception(exception, profiles, &mut out);
    }

    if zone.block_malware_ports
        && let Some(profile) = profiles.profile(MALWARE_PROFILE)
    {
        let id = generate_global_id();
        for template in &profile.rules {
            let result = template
                .construct(&id, None, None)
                .map_err(|source| Diagnostic::Template {
                    profile: profile.name.clone(),
                    template: template.name.clone(),
                    subject: "malware port block".to_string(),
                    source,
                });
            out.fold(result);
        }
    }

    if zone.allow_local_subnet {
        let template = local_subnet_template();
        let result = template
            .construct(&generate_global_id(), None, None)
            .map_err(|source| Diagnostic::Template {
                profile: String::new(),
                template: template.name.clone(),
                subject: "local subnet".to_string(),
                source,
            });
        out.fold(result);
    }

    out
}

/// Append the rules of one exception (profiles plus extra ports) to `out`.
///
/// The exception must already carry a correlation id.
pub fn rules_for_exception<P: ProfileSource + ?Sized>(
    exception: &Exception,
    profiles: &P,
    out: &mut Synthesis,
) {
    let Some(id) = exception.id() else {
        return;
    };
    let subject = exception.display_name();
    let application = Some(exception.executable_path.as_str());
    let service = exception.service_name.as_deref();

    for name in &exception.profiles {
        let Some(profile) = profiles.profile(name) else {
            continue;
        };
        for template in &profile.rules {
            let result = template
                .construct(id, application, service)
                .map_err(|source| Diagnostic::Template {
                    profile: profile.name.clone(),
                    template: template.name.clone(),
                    subject: subject.clone(),
                    source,
                });
            out.fold(result);
        }
    }

    let extra = &exception.extra_ports;
    let extras = [
        ("Extra Tcp Listen Ports", &extra.tcp_listen_local, Direction::In, Protocol::Tcp),
        ("Extra Udp Listen Ports", &extra.udp_listen_local, Direction::In, Protocol::Udp),
        ("Extra Tcp Outbound Ports", &extra.tcp_outbound_remote, Direction::Out, Protocol::Tcp),
        ("Extra Udp Outbound Ports", &extra.udp_outbound_remote, Direction::Out, Protocol::Udp),
    ];
    for (kind, ports, direction, protocol) in extras {
        if ports.is_empty() {
            continue;
        }
        let template = RuleTemplate::new(kind, Action::Allow, direction, protocol);
        let template = match direction {
            Direction::In => template.local_ports(ports.as_str()),
            _ => template.remote_ports(ports.as_str()),
        };
        let result = template
            .construct(id, application, None)
            .map_err(|source| Diagnostic::ExtraPorts {
                kind,
                subject: subject.clone(),
                source,
            });
        out.fold(result);
    }
}

/// Whether a rule belongs to a global feature rather than a zone exception.
pub fn is_global_rule(rule: &Rule) -> bool {
    rule.correlation_id.starts_with(GLOBAL_MARKER)
}
