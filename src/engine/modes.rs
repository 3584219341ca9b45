//! Mode transitions and full reinitialization.

use tracing::{info, warn};

use super::{Authority, EngineError};
use crate::backend::{FirewallBackend, PolicySettings, zone_name_for};
use crate::policy::{
    Action, Direction, Mode, ProfileCatalog, Protocol, RuleTemplate, Zone, generate_global_id,
    local_subnet_template, synthesize,
};

fn allow_all_outbound() -> RuleTemplate {
    RuleTemplate::new("Allow all outbound", Action::Allow, Direction::Out, Protocol::Any)
}

fn allow_everything() -> RuleTemplate {
    RuleTemplate::new("Allow everything", Action::Allow, Direction::InOut, Protocol::Any)
}

impl<B: FirewallBackend> Authority<B> {
    /// Put the backend into `target`. `previous` is the mode currently in
    /// force, or `None` when the backend state is unknown (reinit).
    ///
    /// Every mode other than Normal is layered on the Normal baseline, which
    /// is rebuilt first unless it is exactly what the backend holds now.
    pub(crate) fn apply_mode(&mut self, target: Mode, previous: Option<Mode>) -> Result<(), EngineError> {
        if target == Mode::Normal || previous != Some(Mode::Normal) {
            self.enter_normal()?;
        }
        match target {
            Mode::Normal => Ok(()),
            Mode::AllowOutgoing => self.install_global(allow_all_outbound()),
            Mode::BlockAll => self.enter_block_all(),
            Mode::Disabled => self.enter_disabled(),
        }
    }

    fn enter_normal(&mut self) -> Result<(), EngineError> {
        let synthesis = synthesize(&mut self.zone, &self.catalog);
        if synthesis.ids_assigned {
            match self.persist_zone() {
                Ok(()) => {
                    self.shared.bump_changeset();
                }
                Err(e) => warn!("Failed to save new correlation ids: {}", e),
            }
        }

        self.backend.reset()?;
        self.backend.apply_policy(PolicySettings::managed_baseline())?;
        if !self.zone.enable_default_backend_rules {
            self.backend.disable_all()?;
        }
        self.backend.add_rules(synthesis.rules)?;
        Ok(())
    }

    fn enter_block_all(&mut self) -> Result<(), EngineError> {
        self.backend.disable_all()?;
        if self.zone.allow_local_subnet {
            self.install_global(local_subnet_template())?;
        }
        Ok(())
    }

    fn enter_disabled(&mut self) -> Result<(), EngineError> {
        self.install_global(allow_everything())?;
        let blocking: Vec<usize> = self
            .backend
            .rules()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.action == Action::Block && r.enabled)
            .map(|(i, _)| i)
            .collect();
        for index in blocking {
            self.backend.set_rule_enabled(index, false)?;
        }
        Ok(())
    }

    fn install_global(&mut self, template: RuleTemplate) -> Result<(), EngineError> {
        let rule = template.construct(&generate_global_id(), None, None)?;
        self.backend.enable_rules(vec![rule])?;
        Ok(())
    }

    /// Reload everything from disk and re-apply the current mode from scratch.
    pub(crate) fn reinitialize(&mut self) -> Result<(), EngineError> {
        let zone_name = zone_name_for(&self.backend.current_profiles())?;

        self.catalog = ProfileCatalog::load_or_builtin(&self.catalog_path);
        self.machine = self.store.load_machine().unwrap_or_else(|e| {
            warn!("Using default machine settings: {}", e);
            Default::default()
        });
        self.zone = self.store.load_zone(zone_name).unwrap_or_else(|e| {
            warn!("Using empty zone '{}': {}", zone_name, e);
            Zone::new(zone_name)
        });

        self.apply_mode(self.mode, None)?;
        self.update_hosts_protection();

        info!(
            "Policy applied: zone '{}', mode {}, {} rule(s) installed",
            self.zone.name,
            self.mode,
            self.backend.rules().len()
        );
        Ok(())
    }

    fn update_hosts_protection(&mut self) {
        if self.machine.lock_hosts_file {
            let hosts = self.hosts_file.clone();
            self.protect(&hosts);
        } else {
            self.guard.release(&self.hosts_file);
        }
    }
}
