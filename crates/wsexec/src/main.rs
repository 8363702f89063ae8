//! wsexec development binary.
//!
//! `serve` accepts plain WebSocket connections and executes commands
//! locally; `run` is a minimal client for driving a server by hand. TLS
//! and authentication are deliberately absent; put a real front end in
//! front of this for anything beyond a trusted network.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wsexec::{Command, Error, Execer, LocalExecer, Options, Process, RemoteExecer, Server};

/// Remote command execution over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "wsexec")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept WebSocket connections and execute commands locally
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,

        /// Seconds a detached session survives with no attachers
        #[arg(long, default_value = "300")]
        session_timeout: u64,

        /// Niceness applied to spawned children
        #[arg(long)]
        child_priority: Option<i32>,
    },

    /// Run a command on a wsexec server
    Run {
        /// Server URL
        #[arg(long, default_value = "ws://127.0.0.1:8080/")]
        url: String,

        /// Allocate a server-side pty and switch the local terminal to
        /// raw mode
        #[arg(long)]
        tty: bool,

        /// Session id; reuse it to reconnect to a tty command
        #[arg(long, default_value = "")]
        id: String,

        /// Disconnect after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            listen,
            session_timeout,
            child_priority,
        } => {
            serve(
                listen,
                Duration::from_secs(session_timeout),
                child_priority,
            )
            .await
        }
        Commands::Run {
            url,
            tty,
            id,
            timeout,
            command,
        } => run(url, tty, id, timeout, command).await,
    }
}

async fn serve(listen: String, session_timeout: Duration, child_priority: Option<i32>) -> Result<()> {
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    let server = Arc::new(Server::new());
    let execer: Arc<dyn Execer> = Arc::new(LocalExecer { child_priority });
    let options = Options { session_timeout };
    info!(%listen, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept connection")?;
                let server = server.clone();
                let execer = execer.clone();
                tokio::spawn(async move {
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(err) => {
                            warn!(%peer, error = %err, "websocket handshake failed");
                            return;
                        }
                    };
                    info!(%peer, "connection open");
                    match server.serve(ws, execer, options).await {
                        Ok(()) => info!(%peer, "connection closed"),
                        Err(err) => error!(%peer, error = %err, "connection failed"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                server.close().await;
                return Ok(());
            }
        }
    }
}

async fn run(
    url: String,
    tty: bool,
    id: String,
    timeout: Option<u64>,
    command: Vec<String>,
) -> Result<()> {
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("dial {url}"))?;
    let execer = RemoteExecer::new(ws);

    let (cols, rows) = if tty {
        crossterm::terminal::size().context("query terminal size")?
    } else {
        (0, 0)
    };

    let scope = CancellationToken::new();
    let mut process = execer
        .start(
            scope.clone(),
            Command {
                id,
                command: command[0].clone(),
                args: command[1..].to_vec(),
                tty,
                stdin: true,
                rows,
                cols,
                ..Command::default()
            },
        )
        .await?;

    let raw = if tty { Some(RawMode::enable()?) } else { None };

    let mut stdin = process.stdin().context("stdin already taken")?;
    let mut stdout = process.stdout().context("stdout already taken")?;
    let mut stderr = process.stderr().context("stderr already taken")?;
    let process: Arc<dyn Process> = Arc::from(process);

    if tty {
        let process = process.clone();
        tokio::spawn(async move {
            let Ok(mut winch) = tokio::signal::unix::signal(SignalKind::window_change()) else {
                return;
            };
            while winch.recv().await.is_some() {
                if let Ok((cols, rows)) = crossterm::terminal::size() {
                    if process.resize(rows, cols).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut input = tokio::io::stdin();
        let _ = tokio::io::copy(&mut input, &mut stdin).await;
        let _ = stdin.shutdown().await;
    });
    let stdout_task = tokio::spawn(async move {
        let mut out = tokio::io::stdout();
        let _ = tokio::io::copy(&mut stdout, &mut out).await;
        let _ = out.flush().await;
    });
    let stderr_task = tokio::spawn(async move {
        let mut out = tokio::io::stderr();
        let _ = tokio::io::copy(&mut stderr, &mut out).await;
        let _ = out.flush().await;
    });

    if let Some(seconds) = timeout {
        let process = process.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            let _ = process.close().await;
        });
    }

    let result = process.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    drop(raw);

    match result {
        Ok(()) => {
            let _ = process.close().await;
            Ok(())
        }
        Err(Error::Exit(exit)) => {
            let _ = process.close().await;
            std::process::exit(exit.code)
        }
        Err(err) => Err(err.into()),
    }
}

/// Puts the terminal into raw mode for the guard's lifetime.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode().context("enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}
