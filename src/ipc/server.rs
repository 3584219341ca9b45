//! Unix socket server: one JSON message per line, answered in order.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::Gateway;
use crate::engine::SharedState;
use crate::protocol::Message;

const SOCKET_MODE: u32 = 0o600;

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    gateway: Gateway,
}

impl IpcServer {
    /// Bind the socket at `path`, replacing a stale socket file.
    pub fn bind(path: &Path, gateway: Gateway) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind socket {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        info!("Listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            gateway,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until shutdown is requested.
    pub async fn run(&self, shared: Arc<SharedState>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let gateway = self.gateway.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, gateway).await {
                                debug!("Connection closed with error: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = shared.shutdown_requested() => break,
            }
        }
        debug!("IPC server stopped");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            anyhow::bail!("{} exists but is not a socket", path.display());
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    std::fs::remove_file(path)
        .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    debug!("Removed stale socket {}", path.display());
    Ok(())
}

/// Serve sequential request/response exchanges on one connection.
async fn serve_connection(stream: UnixStream, gateway: Gateway) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match Message::decode(&line) {
            Ok(request) => gateway.handle(request).await,
            Err(e) => Message::error(e.to_string()),
        };
        let mut encoded = response
            .encode()
            .unwrap_or_else(|_| r#"{"command":"response_error"}"#.to_string());
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DaemonContext;
    use crate::ipc::IpcClient;
    use crate::protocol::Command;
    use serde_json::Value;

    fn echo_consumer(ctx: &DaemonContext) {
        let queue = Arc::clone(&ctx.queue);
        std::thread::spawn(move || {
            while let Some(request) = queue.dequeue() {
                let name = format!("{:?}", request.command());
                request.respond(Message::ok_with(vec![Value::from(name)]));
            }
        });
    }

    async fn start(ctx: &DaemonContext, path: &Path) -> tokio::task::JoinHandle<()> {
        let server = IpcServer::bind(path, Gateway::new(ctx.clone())).unwrap();
        let shared = Arc::clone(&ctx.shared);
        tokio::spawn(async move { server.run(shared).await })
    }

    #[tokio::test]
    async fn request_response_over_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zonewall.sock");
        let ctx = DaemonContext::new();
        echo_consumer(&ctx);
        let server = start(&ctx, &path).await;

        let mut client = IpcClient::connect(&path).await.unwrap();
        let first = client.request(&Message::new(Command::Ping)).await.unwrap();
        assert_eq!(first.arg::<String>(0).unwrap(), "Ping");
        let second = client.request(&Message::new(Command::GetMode)).await.unwrap();
        assert_eq!(second.arg::<String>(0).unwrap(), "GetMode");

        ctx.shared.request_shutdown();
        ctx.queue.close();
        server.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn malformed_line_gets_error_and_connection_survives() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zonewall.sock");
        let ctx = DaemonContext::new();
        echo_consumer(&ctx);
        let _server = start(&ctx, &path).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"{\"command\":\"format_disk\"}\n").await.unwrap();
        let reply = Message::decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.command(), Command::ResponseError);

        writer.write_all(b"{\"command\":\"ping\"}\n").await.unwrap();
        let reply = Message::decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(reply.is_ok());

        ctx.queue.close();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zonewall.sock");
        let _server = IpcServer::bind(&path, Gateway::new(DaemonContext::new())).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_but_regular_file_is_not() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zonewall.sock");
        {
            let first = IpcServer::bind(&path, Gateway::new(DaemonContext::new())).unwrap();
            std::mem::forget(first);
        }
        assert!(path.exists());
        let _second = IpcServer::bind(&path, Gateway::new(DaemonContext::new())).unwrap();

        let file = tmp.path().join("not-a-socket");
        std::fs::write(&file, "x").unwrap();
        assert!(IpcServer::bind(&file, Gateway::new(DaemonContext::new())).is_err());
    }
}
