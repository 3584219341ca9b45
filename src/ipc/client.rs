//! Controller-side connection to the daemon socket.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::protocol::Message;

pub struct IpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl IpcClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!(
                "Cannot connect to {} (is the daemon running?)",
                path.display()
            )
        })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Send one request and wait for its response.
    pub async fn request(&mut self, message: &Message) -> Result<Message> {
        let mut line = message.encode()?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let Some(reply) = self.lines.next_line().await? else {
            bail!("Daemon closed the connection");
        };
        Ok(Message::decode(&reply)?)
    }
}
