//! Per-command handlers.

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use super::{Authority, EngineError};
use crate::backend::FirewallBackend;
use crate::policy::{
    Exception, MachineSettings, Mode, Rule, Synthesis, Zone, is_exception_id, rules_for_exception,
};
use crate::protocol::{Command, Message, to_arg};

impl<B: FirewallBackend> Authority<B> {
    pub(crate) fn dispatch(&mut self, request: &Message) -> Result<Message, EngineError> {
        match request.command() {
            Command::Ping => Ok(Message::ok()),
            Command::ModeSwitch => self.mode_switch(request),
            Command::PutSettings => self.put_settings(request),
            Command::GetSettings => self.get_settings(request),
            Command::Reload => {
                self.reinitialize()?;
                Ok(Message::ok())
            }
            Command::GetProfile => Ok(Message::ok_with(vec![Value::from(
                self.zone.name.clone(),
            )])),
            Command::Unlock => self.unlock(request),
            Command::Lock => {
                self.shared.lock.set_locked(true);
                Ok(Message::ok())
            }
            Command::GetLockState => {
                let lock = &self.shared.lock;
                Ok(Message::ok_with(vec![
                    Value::from(i32::from(lock.has_secret())),
                    Value::from(i32::from(lock.is_locked())),
                ]))
            }
            Command::SetPassphrase => self.set_passphrase(request),
            Command::GetMode => Ok(Message::ok_with(vec![to_arg(&self.mode)?])),
            Command::StopDisable => self.stop_disable(),
            Command::NewException => self.new_exception(request),
            Command::CheckScheduledRules => self.check_scheduled_rules(),
            Command::ResponseOk
            | Command::ResponseWarning
            | Command::ResponseError
            | Command::ResponseLocked => Ok(Message::error("not a request")),
        }
    }

    fn mode_switch(&mut self, request: &Message) -> Result<Message, EngineError> {
        let target: Mode = request.arg(0)?;
        let previous = self.mode;
        self.apply_mode(target, Some(previous))?;
        self.mode = target;
        info!("Mode switched from {} to {}", previous, target);

        if self.backend.local_policy_overridden() {
            Ok(Message::warning())
        } else {
            Ok(Message::ok())
        }
    }

    fn put_settings(&mut self, request: &Message) -> Result<Message, EngineError> {
        let machine: MachineSettings = request.arg(0)?;
        let mut zone: Zone = request.arg(1)?;
        zone.normalize();

        self.store.save_machine(&machine)?;
        self.store.save_zone(&zone)?;
        self.machine = machine;
        self.zone = zone;
        self.shared.bump_changeset();

        self.reinitialize()?;
        Ok(Message::ok())
    }

    fn get_settings(&mut self, request: &Message) -> Result<Message, EngineError> {
        let client: u64 = request.arg(0)?;
        let current = self.shared.changeset();
        if client == current {
            return Ok(Message::ok_with(vec![Value::from(current)]));
        }
        Ok(Message::ok_with(vec![
            Value::from(current),
            to_arg(&self.machine)?,
            to_arg(&self.zone)?,
        ]))
    }

    fn unlock(&mut self, request: &Message) -> Result<Message, EngineError> {
        let secret: String = request.arg(0)?;
        if self.passphrase.verify(&secret) {
            self.shared.lock.set_locked(false);
            Ok(Message::ok())
        } else {
            warn!("Unlock attempt with a wrong passphrase");
            Ok(Message::error("wrong passphrase"))
        }
    }

    fn set_passphrase(&mut self, request: &Message) -> Result<Message, EngineError> {
        let secret: String = request.arg(0)?;
        let path = self.passphrase.path().to_path_buf();

        self.guard.release(&path);
        let result = self.passphrase.set(&secret);
        self.protect(&path);

        self.shared.lock.set_has_secret(self.passphrase.has_secret());
        result?;
        Ok(Message::ok())
    }

    fn stop_disable(&mut self) -> Result<Message, EngineError> {
        info!("Stop requested: disabling autostart and restoring host defaults");
        self.machine.autostart = false;
        if let Err(e) = self.store.save_machine(&self.machine) {
            warn!("Failed to disable autostart: {}", e);
        }
        if let Err(e) = self.backend.reset() {
            warn!("Failed to reset backend: {}", e);
        }
        self.exit_requested = true;
        Ok(Message::ok())
    }

    fn new_exception(&mut self, request: &Message) -> Result<Message, EngineError> {
        let mut exception: Exception = request.arg(0)?;
        exception.ensure_correlation_id();
        let id = exception.id().unwrap_or_default().to_string();

        self.zone.add_exception(exception.clone());
        self.persist_zone()?;
        self.shared.bump_changeset();
        info!("Added exception {} for {}", id, exception.display_name());

        if self.mode == Mode::Normal {
            let mut out = Synthesis::default();
            rules_for_exception(&exception, &self.catalog, &mut out);
            self.backend
                .remove_where(&|r: &Rule| r.correlation_id == id)?;
            self.backend.enable_rules(out.rules)?;
        }

        let zone = &self.zone;
        let pruned = self.backend.remove_where(&|r: &Rule| {
            is_exception_id(&r.correlation_id) && !zone.has_exception(&r.correlation_id)
        })?;
        if pruned > 0 {
            info!("Removed {} rule(s) with no matching exception", pruned);
        }

        Ok(Message::ok())
    }

    fn check_scheduled_rules(&mut self) -> Result<Message, EngineError> {
        let now = Utc::now();
        let expired = self.zone.expired_ids(now);

        let mut pruned = self.zone.clone();
        for id in &expired {
            pruned.remove_exception(id);
        }
        pruned
            .exceptions
            .retain(|e| e.id().is_some() || !e.is_expired(now));
        if pruned.exceptions.len() == self.zone.exceptions.len() {
            return Ok(Message::ok());
        }

        // Saved first: a failed save leaves the exceptions and their rules in place.
        self.store.save_zone(&pruned)?;
        self.zone = pruned;
        self.shared.bump_changeset();

        for id in &expired {
            let removed = self
                .backend
                .remove_where(&|r: &Rule| r.correlation_id.contains(id.as_str()))?;
            info!("Exception {} expired, removed {} rule(s)", id, removed);
        }
        Ok(Message::ok())
    }
}
