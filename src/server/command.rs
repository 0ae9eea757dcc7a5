//! Client command grammar.
//!
//! One command per line, whitespace-separated tokens:
//!
//! ```text
//! JOIN <nodeID> <addr>
//! GET <key>
//! SET <key> <value>
//! DEL <key>
//! ```
//!
//! Keywords are case-sensitive and tokens after the last argument are ignored.

use thiserror::Error;

/// A malformed client line. The text is sent back to the client as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message must have at least a command and a key or nodeID")]
    TooFewTokens,

    #[error("JOIN message must have nodeID and remoteAddr")]
    JoinMissingAddr,

    #[error("SET message must have key and value")]
    SetMissingValue,

    #[error("invalid command in message: {0}")]
    UnknownCommand(String),

    /// The line exceeded the per-line limit; the connection is closed after reporting it.
    #[error("message exceeds maximum line length of {0} bytes")]
    LineTooLong(usize),
}

impl ProtocolError {
    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::LineTooLong(_))
    }
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { node_id: String, addr: String },
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
}

impl Command {
    /// Parse one line, without its terminator.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(ProtocolError::TooFewTokens);
        }

        match tokens[0] {
            "JOIN" => match tokens.get(2) {
                Some(addr) => Ok(Command::Join {
                    node_id: tokens[1].to_string(),
                    addr: addr.to_string(),
                }),
                None => Err(ProtocolError::JoinMissingAddr),
            },
            "GET" => Ok(Command::Get {
                key: tokens[1].to_string(),
            }),
            "SET" => match tokens.get(2) {
                Some(value) => Ok(Command::Set {
                    key: tokens[1].to_string(),
                    value: value.to_string(),
                }),
                None => Err(ProtocolError::SetMissingValue),
            },
            "DEL" => Ok(Command::Del {
                key: tokens[1].to_string(),
            }),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Command keyword, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Join { .. } => "JOIN",
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
        }
    }
}
