//! Startup request asking an existing member to admit this node.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

const JOIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Covers the time a leader spends catching the joiner up and committing the change.
const JOIN_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for reaching the join target.
pub fn join_policy(retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(retries)
        .with_jitter()
}

#[derive(Debug)]
enum AttemptError {
    /// Could not reach the target or the connection broke. Retried.
    Io(std::io::Error),
    /// The target answered with something other than `Success`. Not retried.
    Rejected(String),
}

/// Send `JOIN <node_name> <raft_addr>` to the command server at `join_addr`.
///
/// Connection failures are retried up to `retries` times; any reply other
/// than `Success` fails immediately with the reply text.
pub async fn join_cluster(
    join_addr: &str,
    node_name: &str,
    raft_addr: &str,
    retries: usize,
) -> Result<()> {
    let request = format!("JOIN {} {}\n", node_name, raft_addr);

    let result = (|| async { send_join(join_addr, &request).await })
        .retry(join_policy(retries))
        .when(|e| matches!(e, AttemptError::Io(_)))
        .notify(|e, delay| {
            tracing::warn!(
                join_addr = %join_addr,
                error = ?e,
                retry_in_ms = delay.as_millis() as u64,
                "Join attempt failed"
            );
        })
        .await;

    match result {
        Ok(()) => {
            tracing::info!(join_addr = %join_addr, node = %node_name, "Joined cluster");
            Ok(())
        }
        Err(AttemptError::Rejected(reply)) => Err(Error::JoinBootstrap(reply)),
        Err(AttemptError::Io(e)) => Err(Error::JoinBootstrap(format!(
            "could not reach {}: {}",
            join_addr, e
        ))),
    }
}

async fn send_join(join_addr: &str, request: &str) -> std::result::Result<(), AttemptError> {
    let stream = timeout(JOIN_CONNECT_TIMEOUT, TcpStream::connect(join_addr))
        .await
        .map_err(|_| {
            AttemptError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })?
        .map_err(AttemptError::Io)?;

    let (read, mut write) = stream.into_split();
    write
        .write_all(request.as_bytes())
        .await
        .map_err(AttemptError::Io)?;

    let mut reply = String::new();
    let n = timeout(
        JOIN_REPLY_TIMEOUT,
        BufReader::new(read).read_line(&mut reply),
    )
    .await
    .map_err(|_| {
        AttemptError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no reply to join request",
        ))
    })?
    .map_err(AttemptError::Io)?;
    if n == 0 {
        return Err(AttemptError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before reply",
        )));
    }

    match reply.trim_end() {
        "Success" => Ok(()),
        other => Err(AttemptError::Rejected(other.to_string())),
    }
}
