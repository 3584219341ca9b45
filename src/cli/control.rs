//! Controller commands: one request over the daemon socket each.

use anyhow::{Result, bail};
use clap::Subcommand;
use serde_json::Value;

use crate::config::Config;
use crate::ipc::IpcClient;
use crate::policy::{Exception, ExtraPorts, MachineSettings, Mode, TimerPolicy, Zone};
use crate::protocol::{Command, Message, to_arg};

#[derive(Subcommand)]
pub enum ControlCommands {
    /// Check that the daemon answers
    Ping,

    /// Show the current mode, or switch to a new one
    Mode {
        /// normal | allow-outgoing | block-all | disabled
        mode: Option<Mode>,
    },

    /// Re-apply the policy for the active zone
    Reload,

    /// Show the active zone name
    Profile,

    /// Lock privileged commands
    Lock,

    /// Unlock privileged commands
    Unlock { secret: String },

    /// Show whether a passphrase is set and whether the daemon is locked
    LockState,

    /// Set the passphrase (an empty string removes it)
    SetPassphrase { secret: String },

    /// Print the zone and machine settings
    Settings {
        /// Changeset the caller already has
        #[arg(long, default_value_t = 0)]
        changeset: u64,
    },

    /// Add an application exception to the active zone
    Allow {
        /// Executable path
        executable: String,

        /// Profile to apply (repeatable)
        #[arg(short, long = "profile")]
        profiles: Vec<String>,

        /// Service name
        #[arg(long)]
        service: Option<String>,

        /// Remove the exception after this many minutes
        #[arg(long, conflicts_with = "until_reboot")]
        minutes: Option<u32>,

        /// Remove the exception when the daemon stops
        #[arg(long)]
        until_reboot: bool,

        #[arg(long)]
        tcp_listen: Option<String>,

        #[arg(long)]
        udp_listen: Option<String>,

        #[arg(long)]
        tcp_out: Option<String>,

        #[arg(long)]
        udp_out: Option<String>,
    },

    /// Restore host defaults, disable autostart and stop the daemon
    Uninstall,
}

/// Build the request message for a controller command.
pub fn request_for(command: ControlCommands) -> Result<Message> {
    let message = match command {
        ControlCommands::Ping => Message::new(Command::Ping),
        ControlCommands::Mode { mode: None } => Message::new(Command::GetMode),
        ControlCommands::Mode { mode: Some(mode) } => {
            Message::with_args(Command::ModeSwitch, vec![to_arg(&mode)?])
        }
        ControlCommands::Reload => Message::new(Command::Reload),
        ControlCommands::Profile => Message::new(Command::GetProfile),
        ControlCommands::Lock => Message::new(Command::Lock),
        ControlCommands::Unlock { secret } => {
            Message::with_args(Command::Unlock, vec![Value::from(secret)])
        }
        ControlCommands::LockState => Message::new(Command::GetLockState),
        ControlCommands::SetPassphrase { secret } => {
            Message::with_args(Command::SetPassphrase, vec![Value::from(secret)])
        }
        ControlCommands::Settings { changeset } => {
            Message::with_args(Command::GetSettings, vec![Value::from(changeset)])
        }
        ControlCommands::Allow {
            executable,
            profiles,
            service,
            minutes,
            until_reboot,
            tcp_listen,
            udp_listen,
            tcp_out,
            udp_out,
        } => {
            let mut exception = Exception::new(executable);
            exception.service_name = service;
            exception.profiles = profiles.into_iter().collect();
            exception.timer = match (minutes, until_reboot) {
                (Some(m), _) => TimerPolicy::ExpireAfterMinutes(m),
                (None, true) => TimerPolicy::UntilReboot,
                (None, false) => TimerPolicy::Permanent,
            };
            exception.extra_ports = ExtraPorts {
                tcp_listen_local: tcp_listen.unwrap_or_default(),
                udp_listen_local: udp_listen.unwrap_or_default(),
                tcp_outbound_remote: tcp_out.unwrap_or_default(),
                udp_outbound_remote: udp_out.unwrap_or_default(),
            };
            if exception.profiles.is_empty() && exception.extra_ports.is_empty() {
                bail!("Give at least one --profile or extra port list");
            }
            Message::with_args(Command::NewException, vec![to_arg(&exception)?])
        }
        ControlCommands::Uninstall => Message::new(Command::StopDisable),
    };
    Ok(message)
}

pub async fn run(command: ControlCommands, config: &Config) -> Result<()> {
    let request = request_for(command)?;
    let mut client = IpcClient::connect(&config.socket_path()).await?;
    let response = client.request(&request).await?;
    print_response(request.command(), &response)
}

fn print_response(request: Command, response: &Message) -> Result<()> {
    match response.command() {
        Command::ResponseOk => {}
        Command::ResponseWarning => {
            println!("Applied, but the local policy is overridden by a higher authority");
            return Ok(());
        }
        Command::ResponseLocked => bail!("Daemon is locked; run 'zonewall unlock <secret>' first"),
        Command::ResponseError => {
            bail!("{}", response.reason().unwrap_or("request failed"))
        }
        other => bail!("Unexpected response {:?}", other),
    }

    match request {
        Command::GetMode => println!("{}", response.arg::<Mode>(0)?),
        Command::GetProfile => println!("{}", response.arg::<String>(0)?),
        Command::GetLockState => {
            let has_secret: i32 = response.arg(0)?;
            let locked: i32 = response.arg(1)?;
            println!("Passphrase set: {}", if has_secret != 0 { "yes" } else { "no" });
            println!("Locked: {}", if locked != 0 { "yes" } else { "no" });
        }
        Command::GetSettings => {
            let changeset: u64 = response.arg(0)?;
            println!("Changeset: {}", changeset);
            if response.arguments().len() > 1 {
                let machine: MachineSettings = response.arg(1)?;
                let zone: Zone = response.arg(2)?;
                println!("{}", serde_json::to_string_pretty(&machine)?);
                println!("{}", serde_json::to_string_pretty(&zone)?);
            } else {
                println!("Up to date");
            }
        }
        Command::Ping => println!("pong"),
        _ => println!("OK"),
    }
    Ok(())
}
