//! Shared helpers for the integration suites.

// Each integration binary uses a different subset of these.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, client_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

use wsexec::{Command, Execer, LocalExecer, Options, Process, RemoteExecer, Server};

/// Generous bound for anything that should finish quickly.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// An in-memory WebSocket pair: client end, server end.
pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
    let accept = tokio::spawn(accept_async(server_io));
    let (client_ws, _response) = client_async("ws://localhost/", client_io)
        .await
        .expect("client handshake");
    let server_ws = accept.await.expect("accept task").expect("server handshake");
    (client_ws, server_ws)
}

/// A remote command with its IO endpoints taken and the serve task
/// handle, for tests that drive both halves in one process.
pub struct Remote {
    pub process: Arc<dyn Process>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub serve: JoinHandle<wsexec::Result<()>>,
}

impl Remote {
    /// Simulates the client going away.
    pub async fn disconnect(&self) {
        let _ = self.process.close().await;
    }
}

/// Connects a fresh in-memory transport to `server` and starts `command`
/// over it.
pub async fn connect(server: &Arc<Server>, options: Options, command: Command) -> Remote {
    let (client_ws, server_ws) = ws_pair().await;
    let serve = {
        let server = server.clone();
        let execer: Arc<dyn Execer> = Arc::new(LocalExecer::default());
        tokio::spawn(async move { server.serve(server_ws, execer, options).await })
    };

    let execer = RemoteExecer::new(client_ws);
    let mut process = execer
        .start(CancellationToken::new(), command)
        .await
        .expect("start remote command");
    let stdin = process.stdin().expect("stdin endpoint");
    let stdout = process.stdout().expect("stdout endpoint");
    let stderr = process.stderr().expect("stderr endpoint");
    Remote {
        process: Arc::from(process),
        stdin,
        stdout,
        stderr,
        serve,
    }
}

/// A shell command for a reconnectable TTY session.
pub fn tty_command(id: &str) -> Command {
    Command {
        id: id.to_string(),
        command: "sh".to_string(),
        tty: true,
        stdin: true,
        rows: 100,
        cols: 100,
        env: vec!["TERM=xterm".to_string()],
        ..Command::default()
    }
}

/// Whether the terminal multiplexer backing reconnectable sessions is
/// on PATH. Tests that need it skip themselves otherwise.
pub fn screen_available() -> bool {
    std::env::var("PATH")
        .map(|path| {
            path.split(':')
                .filter(|dir| !dir.is_empty())
                .any(|dir| std::path::Path::new(dir).join("screen").exists())
        })
        .unwrap_or(false)
}

static UNIQUE: AtomicU64 = AtomicU64::new(0);

/// Writes a unique arithmetic echo to the shell and returns the strings
/// its output is expected to contain, in order.
pub async fn write_unique(stdin: &mut (dyn AsyncWrite + Send + Unpin)) -> Vec<String> {
    let n = UNIQUE.fetch_add(1, Ordering::SeqCst) + u64::from(std::process::id());
    let echo = format!("echo test:$(({n}+{n}))");
    stdin
        .write_all(format!("{echo}\n").as_bytes())
        .await
        .expect("write to stdin");
    vec![echo, format!("test:{}", n + n)]
}

/// Scans stdout line by line until everything in `expected` has been
/// seen in order. Returns false on end of stream or if anything in
/// `unexpected` shows up first.
pub async fn scan_stdout(
    stdout: &mut (dyn AsyncRead + Send + Unpin),
    expected: &[String],
    unexpected: &[String],
) -> bool {
    if expected.is_empty() {
        return true;
    }
    let mut index = 0;
    let mut line = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte != b'\n' {
                line.push(byte);
                continue;
            }
            let text = String::from_utf8_lossy(&line).to_string();
            line.clear();
            if unexpected.iter().any(|bad| text.contains(bad)) {
                return false;
            }
            if text.contains(&expected[index]) {
                index += 1;
                if index == expected.len() {
                    return true;
                }
            }
        }
    }
}

/// Like [`scan_stdout`] but bounded by [`TEST_TIMEOUT`].
pub async fn expect_stdout(
    stdout: &mut (dyn AsyncRead + Send + Unpin),
    expected: &[String],
    unexpected: &[String],
) -> bool {
    tokio::time::timeout(TEST_TIMEOUT, scan_stdout(stdout, expected, unexpected))
        .await
        .unwrap_or(false)
}
