use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;

use super::*;
use crate::backend::{FirewallBackend, MemoryBackend, PolicySettings};
use crate::paths::Paths;
use crate::policy::{
    Action, Direction, Exception, LOCAL_SUBNET, Profile, Protocol, Rule, RuleTemplate,
    TimerPolicy, is_global_rule,
};
use crate::protocol::{Command, PendingRequest, SHUTTING_DOWN, to_arg};
use crate::store::SettingsStore;

struct Harness {
    _tmp: TempDir,
    paths: Paths,
    hosts_file: PathBuf,
    shared: Arc<SharedState>,
    authority: Authority<MemoryBackend>,
}

fn p1() -> Profile {
    Profile::new(
        "p1",
        vec![RuleTemplate::new("Inbound", Action::Allow, Direction::In, Protocol::Tcp).local_ports("8080")],
    )
}

fn exception(path: &str, id: &str) -> Exception {
    let mut ex = Exception::new(path).with_profile("p1");
    ex.correlation_id = Some(id.to_string());
    ex
}

impl Harness {
    /// Authority over a fresh data dir holding `zone` as the Private zone,
    /// after the initial RELOAD.
    fn with_zone(zone: Option<Zone>) -> Self {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::rooted(tmp.path());
        let hosts_file = tmp.path().join("hosts");
        fs::create_dir_all(&paths.data_dir).unwrap();
        fs::write(&hosts_file, "127.0.0.1 localhost\n").unwrap();

        let mut catalog = ProfileCatalog::builtin();
        catalog.profiles.insert("p1".into(), p1());
        fs::write(paths.profile_catalog(), serde_json::to_string(&catalog).unwrap()).unwrap();

        if let Some(zone) = zone {
            SettingsStore::new(&paths.data_dir).save_zone(&zone).unwrap();
        }

        let shared = Arc::new(SharedState::new());
        let mut authority = Authority::new(
            MemoryBackend::new(),
            &paths,
            hosts_file.clone(),
            Arc::clone(&shared),
        );
        assert!(authority.handle(&Message::new(Command::Reload)).is_ok());

        Self {
            _tmp: tmp,
            paths,
            hosts_file,
            shared,
            authority,
        }
    }

    fn new() -> Self {
        Self::with_zone(None)
    }

    fn send(&mut self, command: Command, args: Vec<Value>) -> Message {
        self.authority.handle(&Message::with_args(command, args))
    }

    fn switch(&mut self, mode: Mode) -> Message {
        self.send(Command::ModeSwitch, vec![to_arg(&mode).unwrap()])
    }

    fn rules(&self) -> Vec<Rule> {
        self.authority.backend().rules().to_vec()
    }

    fn enabled_rules(&self) -> Vec<Rule> {
        self.rules().into_iter().filter(|r| r.enabled).collect()
    }
}

/// Global rules get fresh ids on every synthesis; blank them for comparison.
fn normalized(rules: &[Rule]) -> Vec<Rule> {
    rules
        .iter()
        .cloned()
        .map(|mut r| {
            if is_global_rule(&r) {
                let label = r
                    .name
                    .split_once(' ')
                    .map(|(_, rest)| rest.to_string())
                    .unwrap_or_default();
                r.correlation_id = "+".into();
                r.name = format!("+ {}", label);
            }
            r
        })
        .collect()
}

fn private_zone_with(exceptions: Vec<Exception>) -> Zone {
    let mut zone = Zone::new("Private");
    zone.allow_local_subnet = true;
    for ex in exceptions {
        zone.add_exception(ex);
    }
    zone
}

#[test]
fn reload_selects_zone_from_network_profile() {
    let mut h = Harness::new();
    let response = h.send(Command::GetProfile, vec![]);
    assert_eq!(response.arg::<String>(0).unwrap(), "Private");
    assert_eq!(h.authority.backend().policy(), PolicySettings::managed_baseline());
}

#[test]
fn normal_mode_twice_is_idempotent() {
    let mut h = Harness::with_zone(Some(private_zone_with(vec![exception("/usr/bin/app", "[ZWa]")])));
    assert!(h.switch(Mode::Normal).is_ok());
    let once = normalized(&h.rules());
    assert!(h.switch(Mode::Normal).is_ok());
    let twice = normalized(&h.rules());

    assert_eq!(once, twice);
    assert!(once.iter().any(|r| r.correlation_id == "[ZWa]"));
}

#[test]
fn disabled_then_allow_outgoing_restores_baseline_plus_one() {
    let mut h = Harness::with_zone(Some(private_zone_with(vec![exception("/usr/bin/app", "[ZWa]")])));
    let baseline = normalized(&h.rules());

    assert!(h.switch(Mode::Disabled).is_ok());
    assert!(h.switch(Mode::AllowOutgoing).is_ok());

    let rules = h.rules();
    assert_eq!(rules.len(), baseline.len() + 1);
    assert_eq!(normalized(&rules[..baseline.len()]), baseline);

    let extra = rules.last().unwrap();
    assert_eq!(extra.direction, Direction::Out);
    assert_eq!(extra.action, Action::Allow);
    assert!(extra.enabled);
    assert!(is_global_rule(extra));
    assert_eq!(h.authority.mode(), Mode::AllowOutgoing);
}

#[test]
fn allow_outgoing_from_normal_adds_single_rule() {
    let mut h = Harness::new();
    let before = h.rules().len();
    assert!(h.switch(Mode::AllowOutgoing).is_ok());
    assert_eq!(h.rules().len(), before + 1);

    // Repeating the switch rebuilds the baseline instead of stacking rules.
    assert!(h.switch(Mode::AllowOutgoing).is_ok());
    assert_eq!(h.rules().len(), before + 1);
}

#[test]
fn block_all_leaves_only_local_subnet_active() {
    let mut h = Harness::with_zone(Some(private_zone_with(vec![exception("/usr/bin/app", "[ZWa]")])));
    assert!(h.switch(Mode::BlockAll).is_ok());

    let active = h.enabled_rules();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].remote_addresses.as_deref(), Some(LOCAL_SUBNET));
}

#[test]
fn disabled_keeps_block_rules_as_disabled_entries() {
    let mut h = Harness::new();
    let block_count = h.rules().iter().filter(|r| r.action == Action::Block).count();
    assert!(block_count > 0);

    assert!(h.switch(Mode::Disabled).is_ok());
    let rules = h.rules();
    assert_eq!(
        rules.iter().filter(|r| r.action == Action::Block).count(),
        block_count
    );
    assert!(rules.iter().filter(|r| r.action == Action::Block).all(|r| !r.enabled));
    assert!(rules.iter().filter(|r| r.action == Action::Allow).all(|r| r.enabled));
    assert_eq!(
        rules
            .iter()
            .filter(|r| r.name.ends_with("Allow everything"))
            .count(),
        1
    );
}

fn tamper(h: &mut Harness) {
    let foreign = RuleTemplate::new("Foreign", Action::Allow, Direction::In, Protocol::Tcp)
        .local_ports("4444")
        .construct("", None, None)
        .unwrap();
    h.authority.backend_mut().add_rules(vec![foreign]).unwrap();
}

#[test]
fn reload_in_block_all_rebuilds_from_scratch() {
    let mut h = Harness::with_zone(Some(private_zone_with(vec![exception("/usr/bin/app", "[ZWa]")])));
    assert!(h.switch(Mode::BlockAll).is_ok());
    let applied = normalized(&h.rules());

    tamper(&mut h);
    for _ in 0..3 {
        assert!(h.send(Command::Reload, vec![]).is_ok());
    }

    assert_eq!(normalized(&h.rules()), applied);
    let active = h.enabled_rules();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].remote_addresses.as_deref(), Some(LOCAL_SUBNET));
    assert_eq!(h.authority.mode(), Mode::BlockAll);
}

#[test]
fn reload_in_disabled_keeps_a_single_allow_everything_rule() {
    let mut h = Harness::new();
    assert!(h.switch(Mode::Disabled).is_ok());
    let applied = normalized(&h.rules());

    tamper(&mut h);
    for _ in 0..3 {
        assert!(h.send(Command::Reload, vec![]).is_ok());
    }

    let rules = h.rules();
    assert_eq!(normalized(&rules), applied);
    assert_eq!(
        rules
            .iter()
            .filter(|r| r.name.ends_with("Allow everything"))
            .count(),
        1
    );
    assert!(!rules.iter().any(|r| r.name.ends_with("Foreign")));
}

#[test]
fn repeated_switch_to_the_same_mode_does_not_stack_rules() {
    for mode in [Mode::BlockAll, Mode::Disabled] {
        let mut h = Harness::with_zone(Some(private_zone_with(vec![])));
        assert!(h.switch(mode).is_ok());
        let once = normalized(&h.rules());
        assert!(h.switch(mode).is_ok());
        assert!(h.switch(mode).is_ok());
        assert_eq!(normalized(&h.rules()), once, "{}", mode);
    }
}

#[test]
fn default_backend_rules_can_be_suppressed() {
    let mut zone = Zone::new("Private");
    zone.enable_default_backend_rules = false;
    let h = Harness::with_zone(Some(zone));

    for rule in h.rules() {
        assert_eq!(rule.enabled, !rule.correlation_id.is_empty(), "{}", rule.name);
    }
}

#[test]
fn invalid_mode_is_rejected_without_side_effects() {
    let mut h = Harness::new();
    let before = h.rules();

    let response = h.send(Command::ModeSwitch, vec![Value::from("party")]);
    assert_eq!(response.command(), Command::ResponseError);
    assert_eq!(h.rules(), before);
    assert_eq!(h.authority.mode(), Mode::Normal);

    let response = h.send(Command::ModeSwitch, vec![]);
    assert_eq!(response.command(), Command::ResponseError);
}

#[test]
fn overridden_policy_yields_warning() {
    let mut h = Harness::new();
    h.authority.backend_mut().set_overridden(true);
    assert_eq!(h.switch(Mode::BlockAll).command(), Command::ResponseWarning);
    assert_eq!(h.authority.mode(), Mode::BlockAll);
}

#[test]
fn new_exception_in_normal_installs_one_tagged_rule() {
    let mut h = Harness::new();
    let changeset = h.shared.changeset();

    let ex = Exception::new("/usr/bin/app").with_profile("p1");
    let response = h.send(Command::NewException, vec![to_arg(&ex).unwrap()]);
    assert!(response.is_ok());

    let zone = h.authority.zone();
    assert_eq!(zone.exceptions.len(), 1);
    let id = zone.exceptions[0].id().unwrap().to_string();

    let tagged: Vec<Rule> = h
        .rules()
        .into_iter()
        .filter(|r| r.correlation_id == id)
        .collect();
    assert_eq!(tagged.len(), 1);
    assert!(tagged[0].enabled);
    assert_eq!(tagged[0].application.as_deref(), Some("/usr/bin/app"));
    assert!(h.shared.changeset() > changeset);
}

#[test]
fn new_exception_in_block_all_installs_nothing_active() {
    let mut h = Harness::new();
    assert!(h.switch(Mode::BlockAll).is_ok());

    let ex = Exception::new("/usr/bin/app").with_profile("p1");
    assert!(h.send(Command::NewException, vec![to_arg(&ex).unwrap()]).is_ok());

    assert_eq!(h.authority.zone().exceptions.len(), 1);
    assert!(h.enabled_rules().is_empty());
}

#[test]
fn new_exception_prunes_orphaned_rules() {
    let mut h = Harness::with_zone(Some(private_zone_with(vec![exception("/usr/bin/keep", "[ZWkeep]")])));
    let orphan = p1().rules[0].construct("[ZWgone]", Some("/usr/bin/gone"), None).unwrap();
    h.authority.backend_mut().add_rules(vec![orphan]).unwrap();
    let globals = h.rules().iter().filter(|r| is_global_rule(r)).count();

    let ex = Exception::new("/usr/bin/new").with_profile("p1");
    assert!(h.send(Command::NewException, vec![to_arg(&ex).unwrap()]).is_ok());

    let rules = h.rules();
    assert!(!rules.iter().any(|r| r.correlation_id == "[ZWgone]"));
    assert!(rules.iter().any(|r| r.correlation_id == "[ZWkeep]"));
    assert_eq!(rules.iter().filter(|r| is_global_rule(r)).count(), globals);
}

#[test]
fn replacing_an_exception_does_not_duplicate_rules() {
    let mut h = Harness::with_zone(Some(private_zone_with(vec![exception("/usr/bin/app", "[ZWa]")])));
    let ex = exception("/usr/bin/app", "[ZWa]");
    assert!(h.send(Command::NewException, vec![to_arg(&ex).unwrap()]).is_ok());

    assert_eq!(h.authority.zone().exceptions.len(), 1);
    assert_eq!(h.authority.backend().find_by_tag("[ZWa]").len(), 1);
}

#[test]
fn expiry_sweep_removes_only_expired_exceptions() {
    let mut expired = exception("/usr/bin/old", "[ZWold]")
        .with_timer(TimerPolicy::ExpireAfterMinutes(5));
    expired.created_at = Utc::now() - chrono::Duration::minutes(10);
    let fresh = exception("/usr/bin/fresh", "[ZWfresh]").with_timer(TimerPolicy::ExpireAfterMinutes(60));
    let permanent = exception("/usr/bin/perm", "[ZWperm]");

    let mut h = Harness::with_zone(Some(private_zone_with(vec![expired, fresh, permanent])));
    assert_eq!(h.authority.backend().find_by_tag("[ZWold]").len(), 1);
    let changeset = h.shared.changeset();

    assert!(h.send(Command::CheckScheduledRules, vec![]).is_ok());
    assert_eq!(h.shared.changeset(), changeset + 1);
    assert!(h.authority.backend().find_by_tag("[ZWold]").is_empty());
    assert_eq!(h.authority.backend().find_by_tag("[ZWfresh]").len(), 1);
    assert_eq!(h.authority.backend().find_by_tag("[ZWperm]").len(), 1);

    let ids: Vec<&str> = h
        .authority
        .zone()
        .exceptions
        .iter()
        .filter_map(Exception::id)
        .collect();
    assert_eq!(ids, vec!["[ZWfresh]", "[ZWperm]"]);

    // Nothing left to expire: no save, no bump.
    assert!(h.send(Command::CheckScheduledRules, vec![]).is_ok());
    assert_eq!(h.shared.changeset(), changeset + 1);

    // Permanent exceptions survive a restart.
    let saved = SettingsStore::new(&h.paths.data_dir).load_zone("Private").unwrap();
    assert!(saved.has_exception("[ZWperm]"));
    assert!(!saved.has_exception("[ZWold]"));
}

#[test]
fn failed_expiry_save_keeps_exception_and_rules() {
    let mut expired = exception("/usr/bin/old", "[ZWold]")
        .with_timer(TimerPolicy::ExpireAfterMinutes(5));
    expired.created_at = Utc::now() - chrono::Duration::minutes(10);

    let mut h = Harness::with_zone(Some(private_zone_with(vec![expired])));
    let changeset = h.shared.changeset();

    let zones = h.paths.data_dir.join("zones");
    fs::remove_dir_all(&zones).unwrap();
    fs::write(&zones, "not a directory").unwrap();

    let response = h.send(Command::CheckScheduledRules, vec![]);
    assert_eq!(response.command(), Command::ResponseError);
    assert_eq!(h.shared.changeset(), changeset);
    assert!(h.authority.zone().has_exception("[ZWold]"));
    assert_eq!(h.authority.backend().find_by_tag("[ZWold]").len(), 1);

    // The next sweep succeeds once the store is writable again.
    fs::remove_file(&zones).unwrap();
    assert!(h.send(Command::CheckScheduledRules, vec![]).is_ok());
    assert_eq!(h.shared.changeset(), changeset + 1);
    assert!(h.authority.backend().find_by_tag("[ZWold]").is_empty());
}

#[test]
fn get_settings_reports_staleness() {
    let mut h = Harness::new();

    let fresh = h.send(Command::GetSettings, vec![Value::from(0u64)]);
    assert_eq!(fresh.arguments().len(), 1);
    assert_eq!(fresh.arg::<u64>(0).unwrap(), 0);

    let machine = MachineSettings {
        lock_hosts_file: false,
        autostart: true,
    };
    let mut zone = Zone::new("Private");
    zone.allow_local_subnet = true;
    let response = h.send(
        Command::PutSettings,
        vec![to_arg(&machine).unwrap(), to_arg(&zone).unwrap()],
    );
    assert!(response.is_ok());
    assert_eq!(h.shared.changeset(), 1);
    assert!(h.authority.zone().allow_local_subnet);

    let stale = h.send(Command::GetSettings, vec![Value::from(0u64)]);
    assert_eq!(stale.arguments().len(), 3);
    assert_eq!(stale.arg::<u64>(0).unwrap(), 1);
    assert_eq!(stale.arg::<MachineSettings>(1).unwrap(), machine);
    assert_eq!(stale.arg::<Zone>(2).unwrap().name, "Private");

    let current = h.send(Command::GetSettings, vec![Value::from(1u64)]);
    assert_eq!(current.arguments().len(), 1);
}

#[test]
fn changeset_untouched_by_reads_and_mode_switches() {
    let mut h = Harness::new();
    h.send(Command::Ping, vec![]);
    h.send(Command::GetMode, vec![]);
    h.switch(Mode::BlockAll);
    h.send(Command::Reload, vec![]);
    assert_eq!(h.shared.changeset(), 0);
}

#[test]
fn passphrase_lock_cycle() {
    let mut h = Harness::new();
    assert!(!h.shared.lock.is_locked());

    assert!(h.send(Command::SetPassphrase, vec![Value::from("pw")]).is_ok());
    assert!(h.authority.guard().is_protected(&h.paths.passphrase_file()));
    assert!(h.send(Command::Lock, vec![]).is_ok());

    let state = h.send(Command::GetLockState, vec![]);
    assert_eq!(state.arg::<i32>(0).unwrap(), 1);
    assert_eq!(state.arg::<i32>(1).unwrap(), 1);

    let wrong = h.send(Command::Unlock, vec![Value::from("nope")]);
    assert_eq!(wrong.command(), Command::ResponseError);
    assert!(h.shared.lock.is_locked());

    assert!(h.send(Command::Unlock, vec![Value::from("pw")]).is_ok());
    assert!(!h.shared.lock.is_locked());

    assert!(h.send(Command::SetPassphrase, vec![Value::from("")]).is_ok());
    let state = h.send(Command::GetLockState, vec![]);
    assert_eq!(state.arg::<i32>(0).unwrap(), 0);
}

#[test]
fn existing_passphrase_starts_locked() {
    let tmp = TempDir::new().unwrap();
    let paths = Paths::rooted(tmp.path());
    fs::create_dir_all(&paths.data_dir).unwrap();
    PassphraseStore::new(paths.passphrase_file()).set("pw").unwrap();

    let shared = Arc::new(SharedState::new());
    let authority = Authority::new(
        MemoryBackend::new(),
        &paths,
        tmp.path().join("hosts"),
        Arc::clone(&shared),
    );
    assert!(shared.lock.is_locked());
    assert!(shared.lock.has_secret());
    assert!(authority.guard().is_protected(&paths.passphrase_file()));
}

#[test]
fn hosts_file_protection_follows_machine_settings() {
    let mut h = Harness::new();
    assert!(!h.authority.guard().is_protected(&h.hosts_file));

    let machine = MachineSettings {
        lock_hosts_file: true,
        autostart: true,
    };
    let zone = Zone::new("Private");
    let put = |machine: &MachineSettings| {
        vec![to_arg(machine).unwrap(), to_arg(&zone).unwrap()]
    };
    assert!(h.send(Command::PutSettings, put(&machine)).is_ok());
    assert!(h.authority.guard().is_protected(&h.hosts_file));

    let machine = MachineSettings {
        lock_hosts_file: false,
        ..machine
    };
    assert!(h.send(Command::PutSettings, put(&machine)).is_ok());
    assert!(!h.authority.guard().is_protected(&h.hosts_file));
}

#[test]
fn stop_disable_restores_host_defaults() {
    let mut h = Harness::new();
    assert!(h.send(Command::StopDisable, vec![]).is_ok());

    assert!(h.authority.exit_requested());
    assert!(!h.authority.machine().autostart);
    assert_eq!(h.rules(), MemoryBackend::new().rules());
    assert_eq!(h.authority.backend().policy(), PolicySettings::host_default());

    let saved = SettingsStore::new(&h.paths.data_dir).load_machine().unwrap();
    assert!(!saved.autostart);
}

#[test]
fn responses_are_not_requests() {
    let mut h = Harness::new();
    assert_eq!(
        h.send(Command::ResponseOk, vec![]).command(),
        Command::ResponseError
    );
}

#[test]
fn lazily_assigned_ids_are_saved() {
    let zone = private_zone_with(vec![Exception::new("/usr/bin/app").with_profile("p1")]);
    let h = Harness::with_zone(Some(zone));

    assert_eq!(h.shared.changeset(), 1);
    let saved = SettingsStore::new(&h.paths.data_dir).load_zone("Private").unwrap();
    assert_eq!(
        saved.exceptions[0].id(),
        h.authority.zone().exceptions[0].id()
    );
    assert!(saved.exceptions[0].id().is_some());
}

#[test]
fn authority_thread_serves_queue_and_shuts_down() {
    let zone = private_zone_with(vec![
        exception("/usr/bin/app", "[ZWa]").with_timer(TimerPolicy::UntilReboot),
        exception("/usr/bin/perm", "[ZWperm]"),
    ]);
    let h = Harness::with_zone(Some(zone));
    let data_dir = h.paths.data_dir.clone();

    let queue = Arc::new(RequestQueue::new());
    let handle = h.authority.spawn(Arc::clone(&queue)).unwrap();

    let (request, response) = PendingRequest::new(Message::new(Command::Ping));
    queue.enqueue(request).unwrap();
    assert!(response.blocking_response().is_ok());

    queue.close();
    assert!(handle.join_timeout(Duration::from_secs(5)));

    let saved = SettingsStore::new(&data_dir).load_zone("Private").unwrap();
    assert!(!saved.has_exception("[ZWa]"));
    assert!(saved.has_exception("[ZWperm]"));
}

#[test]
fn stop_disable_through_run_loop_requests_shutdown() {
    let h = Harness::new();
    let shared = Arc::clone(&h.shared);
    let queue = Arc::new(RequestQueue::new());
    let handle = h.authority.spawn(Arc::clone(&queue)).unwrap();

    let (request, response) = PendingRequest::new(Message::new(Command::StopDisable));
    queue.enqueue(request).unwrap();
    assert!(response.blocking_response().is_ok());

    // The daemon closes the queue once it sees the request.
    for _ in 0..100 {
        if shared.is_shutdown_requested() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(shared.is_shutdown_requested());
    queue.close();
    assert!(handle.join_timeout(Duration::from_secs(5)));
}

#[test]
fn requests_queued_behind_stop_disable_are_not_applied() {
    let h = Harness::new();
    let shared = Arc::clone(&h.shared);
    let queue = Arc::new(RequestQueue::new());

    let (stop, stop_response) = PendingRequest::new(Message::new(Command::StopDisable));
    let (reload, reload_response) = PendingRequest::new(Message::new(Command::Reload));
    let (switch, switch_response) = PendingRequest::new(Message::with_args(
        Command::ModeSwitch,
        vec![to_arg(&Mode::BlockAll).unwrap()],
    ));
    queue.enqueue(stop).unwrap();
    queue.enqueue(reload).unwrap();
    queue.enqueue(switch).unwrap();

    let handle = h.authority.spawn(Arc::clone(&queue)).unwrap();

    assert!(stop_response.blocking_response().is_ok());
    assert_eq!(reload_response.blocking_response(), Message::error(SHUTTING_DOWN));
    assert_eq!(switch_response.blocking_response(), Message::error(SHUTTING_DOWN));

    // The authority stops on its own; nobody else closes the queue here.
    assert!(handle.join_timeout(Duration::from_secs(5)));
    assert!(queue.is_closed());
    assert!(shared.is_shutdown_requested());
}
