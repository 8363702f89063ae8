//! Command execution capability set.
//!
//! An [`Execer`] starts commands and hands back a [`Process`]: a small
//! capability bundle over stdin, stdout, stderr, resize, wait, and close.
//! Two implementations exist: [`local::LocalExecer`] spawns OS processes
//! and [`crate::client::RemoteExecer`] drives a transport. Both are used
//! through the same trait objects so servers can chain execers.

use std::future::Future;
use std::pin::Pin;

use protocol::ProtocolError;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub mod local;
mod pty;

/// A runnable command.
///
/// This is the runtime form; [`protocol::Command`] is its wire shape,
/// with the reconnection id carried separately in the `start` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    /// Reconnection id. Non-empty together with `tty` selects the
    /// reconnectable session path on the server.
    pub id: String,
    /// Program to execute.
    pub command: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Whether to allocate a pseudo-terminal.
    pub tty: bool,
    /// Whether a writable stdin should be kept open.
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

impl Command {
    /// Converts to the wire representation. The id travels in the
    /// `start` header instead.
    pub fn to_wire(&self) -> protocol::Command {
        protocol::Command {
            command: self.command.clone(),
            args: self.args.clone(),
            tty: self.tty,
            stdin: self.stdin,
            rows: self.rows,
            cols: self.cols,
            uid: self.uid,
            gid: self.gid,
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
        }
    }

    /// Builds the runtime form from a wire command and the header id.
    pub fn from_wire(id: String, wire: protocol::Command) -> Self {
        Self {
            id,
            command: wire.command,
            args: wire.args,
            tty: wire.tty,
            stdin: wire.stdin,
            rows: wire.rows,
            cols: wire.cols,
            uid: wire.uid,
            gid: wire.gid,
            env: wire.env,
            working_dir: wire.working_dir,
        }
    }
}

/// The command terminated with a non-zero exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("process exited with code {code}")]
pub struct ExitError {
    /// The non-zero exit code.
    pub code: i32,
}

/// Failure modes surfaced to execer callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-order protocol traffic. Fatal to the
    /// transport.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The command could not be launched.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// A write was attempted on a stdin the command did not request.
    #[error("stdin is not enabled for this command")]
    StdinDisabled,

    /// The command ran and exited with a non-zero code.
    #[error(transparent)]
    Exit(#[from] ExitError),

    /// Waiting on the process failed for a reason other than an exit
    /// code, such as cancellation through connection loss.
    #[error("wait for process: {0}")]
    Wait(String),

    /// A reconnectable session could not be started or attached.
    #[error("session error: {0}")]
    Session(String),

    /// A session probe did not succeed within its bound.
    #[error("timed out waiting for session")]
    SessionProbeTimeout,

    /// Read or write failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operating system level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for execer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A started command.
///
/// The IO accessors hand out their endpoint once; later calls return
/// `None`. Control methods take `&self` so a shared handle can wait,
/// resize, and close concurrently.
pub trait Process: Send + Sync + std::fmt::Debug {
    /// Process id, populated during a successful start.
    fn pid(&self) -> i32;

    /// Returns the stdin writer. For commands started without stdin the
    /// writer fails every write with the stdin-disabled error.
    fn stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Returns the reader connected to standard output. The reader must
    /// be drained or output forwarding stalls.
    fn stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    /// Returns the reader connected to standard error. Empty for TTY
    /// commands, whose pty merges both streams.
    fn stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    /// Resizes the terminal. A no-op that reports success when no pty is
    /// attached.
    fn resize(
        &self,
        rows: u16,
        cols: u16,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Waits for the command to finish. Returns [`ExitError`] for a
    /// non-zero exit code.
    fn wait(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Requests cooperative termination. The process gets a grace period
    /// before it is forcibly killed.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Starts commands.
pub trait Execer: Send + Sync {
    /// Starts the command. The child is terminated when `scope` fires.
    fn start(
        &self,
        scope: CancellationToken,
        command: Command,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Process>>> + Send + '_>>;
}

/// Runs the command and collects stdout and stderr together.
///
/// Returns the collected output alongside the wait result so callers can
/// inspect what the command printed even when it failed. Start failures
/// surface as the wait result with empty output.
pub async fn combined_output(
    execer: &dyn Execer,
    scope: CancellationToken,
    command: Command,
) -> (Vec<u8>, Result<()>) {
    let mut process = match execer.start(scope, command).await {
        Ok(process) => process,
        Err(err) => return (Vec::new(), Err(err)),
    };

    let stdout = process.stdout();
    let stderr = process.stderr();
    let drain = |reader: Option<Box<dyn AsyncRead + Send + Unpin>>| async move {
        let mut collected = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut collected).await;
        }
        collected
    };

    let (mut output, errput, result) = tokio::join!(drain(stdout), drain(stderr), process.wait());
    output.extend_from_slice(&errput);
    (output, result)
}
