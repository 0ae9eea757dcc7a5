//! Per-client line loop for the command server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::command::{Command, ProtocolError};
use crate::error::Result;
use crate::store::Store;

/// Longest accepted line, excluding the terminator.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const SUCCESS: &str = "Success";

/// A connected client.
pub struct ClientConnection<S> {
    stream: BufReader<S>,
    addr: SocketAddr,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr) -> Self {
        Self {
            stream: BufReader::new(stream),
            addr,
        }
    }

    /// Serve commands until the client disconnects.
    ///
    /// Malformed commands and store failures are answered and the loop
    /// continues; I/O errors and over-long lines end the connection.
    pub async fn handle_requests(&mut self, store: Arc<dyn Store>) -> Result<()> {
        let mut buf = Vec::with_capacity(256);

        loop {
            buf.clear();
            let n = (&mut self.stream)
                .take(MAX_LINE_LENGTH as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await?;
            if n == 0 {
                tracing::debug!(client = %self.addr, "Client disconnected");
                return Ok(());
            }

            let parsed = if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LENGTH {
                Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH))
            } else {
                Command::parse(&String::from_utf8_lossy(&buf))
            };

            let reply = match parsed {
                Ok(command) => dispatch(store.as_ref(), command).await,
                Err(e) if e.is_fatal() => {
                    tracing::warn!(client = %self.addr, error = %e, "Closing connection");
                    self.write_reply(&e.to_string()).await?;
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::debug!(client = %self.addr, error = %e, "Rejected malformed command");
                    e.to_string()
                }
            };
            self.write_reply(&reply).await?;
        }
    }

    async fn write_reply(&mut self, reply: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        // Replies are exactly one line.
        let mut out = reply.replace(['\r', '\n'], " ");
        out.push('\n');
        stream.write_all(out.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Run a command against the store and render the reply line.
pub async fn dispatch(store: &dyn Store, command: Command) -> String {
    let name = command.name();
    let result = match command {
        Command::Join { node_id, addr } => store
            .join(&node_id, &addr)
            .await
            .map(|_| SUCCESS.to_string()),
        Command::Get { key } => store.get(&key).await,
        Command::Set { key, value } => store
            .set(&key, &value)
            .await
            .map(|_| SUCCESS.to_string()),
        Command::Del { key } => store.del(&key).await.map(|_| SUCCESS.to_string()),
    };

    match result {
        Ok(reply) => reply,
        Err(e) => {
            tracing::debug!(command = name, error = %e, "Command failed");
            e.to_string()
        }
    }
}
