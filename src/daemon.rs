//! Daemon runtime: wires the authority, the producers and the IPC server
//! together and tears them down in order.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::backend::{FirewallBackend, MemoryBackend, own_executable};
use crate::config::Config;
use crate::engine::{Authority, DaemonContext};
use crate::ipc::{Gateway, IpcServer};
use crate::protocol::{Command, Message, PendingRequest};
use crate::triggers::{ChangeListener, Ticker};

/// Log panics through tracing and append them to `crash_log` before the
/// default hook runs.
pub fn install_panic_hook(crash_log: PathBuf) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("PANIC in zonewall: {info}");
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&crash_log)
        {
            let _ = writeln!(file, "[{}] {}", chrono::Local::now().to_rfc3339(), info);
        }
        default_hook(info);
    }));
}

/// Run the daemon until a signal, STOP_DISABLE, or a fatal error.
pub async fn run(config: Config) -> Result<()> {
    let tick_interval = config.daemon.tick_interval()?;
    let inactivity_lock = config.daemon.inactivity_lock()?;
    let shutdown_timeout = config.daemon.shutdown_timeout()?;

    let ctx = DaemonContext::new();
    let mut backend = MemoryBackend::new();
    let events = backend.subscribe();

    let authority = Authority::new(
        backend,
        &config.paths,
        config.hosts_file(),
        Arc::clone(&ctx.shared),
    );

    // Initial policy application is the first queued request.
    let _ = ctx
        .queue
        .enqueue(PendingRequest::detached(Message::new(Command::Reload)));

    let authority_handle = authority
        .spawn(Arc::clone(&ctx.queue))
        .context("Failed to start policy authority")?;

    let listener = ChangeListener::new(ctx.clone(), own_executable())
        .spawn(events)
        .context("Failed to start change listener")?;

    let ticker = Ticker::new(ctx.clone(), tick_interval, inactivity_lock);
    let ticker_task = tokio::spawn(async move { ticker.run().await });

    let socket = config.socket_path();
    let server = IpcServer::bind(&socket, Gateway::new(ctx.clone()))?;
    let server_shared = Arc::clone(&ctx.shared);
    let server_task = tokio::spawn(async move { server.run(server_shared).await });

    info!(
        "zonewall daemon running (socket: {}, tick: {:?})",
        socket.display(),
        tick_interval
    );

    wait_for_shutdown(&ctx).await;
    ctx.shared.request_shutdown();

    info!("Shutting down...");
    ctx.queue.close();
    let _ = server_task.await;
    let _ = ticker_task.await;

    let stopped = tokio::task::spawn_blocking(move || {
        let drained = authority_handle.join_timeout(shutdown_timeout);
        if listener.join().is_err() {
            warn!("Change listener panicked");
        }
        drained
    })
    .await
    .unwrap_or(false);
    if !stopped {
        warn!("Exiting with the policy authority still running");
    }

    info!("zonewall daemon stopped");
    Ok(())
}

async fn wait_for_shutdown(ctx: &DaemonContext) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = ctx.shared.shutdown_requested() => info!("Shutdown requested"),
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = ctx.shared.shutdown_requested() => info!("Shutdown requested"),
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
        _ = ctx.shared.shutdown_requested() => info!("Shutdown requested"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ipc::IpcClient;
    use crate::paths::Paths;
    use crate::policy::Mode;

    fn test_config(root: &std::path::Path) -> Config {
        let mut config = Config {
            paths: Paths::rooted(root),
            ..Config::default()
        };
        config.protection.hosts_file = root.join("hosts").display().to_string();
        config.daemon.inactivity_lock = "0".to_string();
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_requests_and_stops_on_uninstall() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        config.paths.ensure_dirs().unwrap();
        let socket = config.socket_path();

        let daemon = tokio::spawn(run(config));

        let mut client = None;
        for _ in 0..100 {
            if let Ok(c) = IpcClient::connect(&socket).await {
                client = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut client = client.expect("daemon socket never appeared");

        let mode = client.request(&Message::new(Command::GetMode)).await.unwrap();
        assert_eq!(mode.arg::<Mode>(0).unwrap(), Mode::Normal);

        let stop = client.request(&Message::new(Command::StopDisable)).await.unwrap();
        assert!(stop.is_ok());

        tokio::time::timeout(Duration::from_secs(10), daemon)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
        assert!(tmp.path().join("data/machine.json").exists());
    }
}
