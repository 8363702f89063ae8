//! Protocol header definitions.
//!
//! Headers are compact JSON objects whose `type` field selects the
//! variant. Client and server headers are distinct sets: the client
//! drives a command (`start`, `stdin`, `close_stdin`, `resize`) and the
//! server reports its lifecycle (`pid`, `stdout`, `stderr`, `exit_code`).
//!
//! Unknown types decode to [`ProtocolError::UnknownType`] so receivers
//! can log and skip them without tearing down the transport.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// A runnable command, as carried inside the `start` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    /// Program to execute.
    pub command: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Whether to allocate a pseudo-terminal.
    pub tty: bool,
    /// Whether the server should keep a writable stdin open.
    pub stdin: bool,
    /// Initial terminal rows. Required non-zero when `tty` is set.
    pub rows: u16,
    /// Initial terminal columns. Required non-zero when `tty` is set.
    pub cols: u16,
    /// User id for the child. Zero means inherit.
    pub uid: u32,
    /// Group id for the child. Zero means inherit.
    pub gid: u32,
    /// `KEY=VALUE` entries appended to the server's own environment.
    pub env: Vec<String>,
    /// Working directory. Empty means inherit.
    pub working_dir: String,
}

/// Headers sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientHeader {
    /// Request to start a command. Exactly one per transport.
    Start {
        /// Reconnection id. Non-empty with `tty` selects the session path.
        #[serde(default)]
        id: String,
        /// The command to run.
        command: Command,
    },
    /// Raw stdin bytes follow in the body.
    Stdin,
    /// No further stdin will be sent.
    CloseStdin,
    /// Terminal window resize. `resize_header` is a legacy alias kept
    /// for older clients; `resize` is always emitted.
    #[serde(alias = "resize_header")]
    Resize {
        /// New terminal rows.
        rows: u16,
        /// New terminal columns.
        cols: u16,
    },
}

/// Headers sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerHeader {
    /// Process id of the started command. Sent exactly once, first.
    Pid {
        /// The child's process id.
        pid: i32,
    },
    /// Standard output bytes follow in the body.
    Stdout,
    /// Standard error bytes follow in the body.
    Stderr,
    /// Terminal message: the command finished. Nothing follows it.
    ExitCode {
        /// Exit code of the process. Zero when the failure was not an
        /// exit at all; `error` carries the message in that case.
        exit_code: i32,
        /// Failure description when the command could not run or wait
        /// failed for a reason other than a non-zero exit.
        #[serde(default)]
        error: String,
    },
}

/// Minimal view of any header, used to classify unknown types.
#[derive(Debug, Deserialize)]
struct RawHeader {
    #[serde(rename = "type")]
    kind: String,
}

const CLIENT_TYPES: &[&str] = &["start", "stdin", "close_stdin", "resize", "resize_header"];
const SERVER_TYPES: &[&str] = &["pid", "stdout", "stderr", "exit_code"];

fn decode_tagged<T: DeserializeOwned>(header: &[u8], known: &[&str]) -> Result<T> {
    let raw: RawHeader = serde_json::from_slice(header)
        .map_err(|err| ProtocolError::MalformedHeader(err.to_string()))?;
    if !known.contains(&raw.kind.as_str()) {
        return Err(ProtocolError::UnknownType(raw.kind));
    }
    serde_json::from_slice(header).map_err(|err| ProtocolError::MalformedHeader(err.to_string()))
}

impl ClientHeader {
    /// Decodes a client header from its JSON bytes.
    pub fn decode(header: &[u8]) -> Result<Self> {
        decode_tagged(header, CLIENT_TYPES)
    }

    /// Encodes the header as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl ServerHeader {
    /// Decodes a server header from its JSON bytes.
    pub fn decode(header: &[u8]) -> Result<Self> {
        decode_tagged(header, SERVER_TYPES)
    }

    /// Encodes the header as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
