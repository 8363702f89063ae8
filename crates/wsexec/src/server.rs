//! Server-side dispatcher.
//!
//! [`Server::serve`] reads framed messages off one WebSocket and drives
//! at most one process: it accepts a single `start`, forwards `stdin`,
//! `close_stdin`, and `resize`, copies stdout and stderr back as framed
//! messages, and finally emits `exit_code`. TTY starts carrying a
//! non-empty id go through the per-server session table instead of
//! spawning directly, which is what makes them reconnectable.
//!
//! After the final `exit_code` frame the transport is closed with a
//! normal-closure status. Error paths return to the caller instead, who
//! logs them and lets the dropped connection read as abnormal closure.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use protocol::{
    encode_message, max_body_len, split_message, ClientHeader, ProtocolError, ServerHeader,
    MAX_MESSAGE_SIZE,
};

use crate::exec::{Command, Error, Execer, Process, Result};
use crate::session::{self, Session, SessionState, DEFAULT_SESSION_TIMEOUT};

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// Serve-time options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// How long a reconnectable session survives with no attachers. Zero
    /// selects the five-minute default.
    pub session_timeout: Duration,
}

impl Options {
    fn resolved(self) -> Self {
        if self.session_timeout.is_zero() {
            Options {
                session_timeout: DEFAULT_SESSION_TIMEOUT,
            }
        } else {
            self
        }
    }
}

/// Shared server state: the table of live reconnectable sessions.
///
/// One instance serves many transports. Dropping the server does not
/// tear sessions down; call [`Server::close`] for that.
#[derive(Default)]
pub struct Server {
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl Server {
    /// Creates a server with an empty session table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The retained recent output of a live session, oldest first.
    pub fn session_replay(&self, id: &str) -> Option<Vec<u8>> {
        self.sessions
            .get(id)
            .map(|session| session.replay_snapshot())
    }

    /// Closes every session and waits for their processes to exit.
    pub async fn close(&self) {
        let entries: Vec<(String, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (id, session) in entries {
            session.close().await;
            self.sessions.remove(&id);
        }
    }

    /// Runs the dispatcher for one transport.
    ///
    /// The execer may itself be remote, chaining servers. Returns an
    /// error for protocol violations and transport failures so the
    /// caller can log them and set an abnormal close reason; clean exits
    /// and client disconnects return `Ok`.
    pub async fn serve<S>(
        &self,
        ws: WebSocketStream<S>,
        execer: Arc<dyn Execer>,
        options: Options,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let options = options.resolved();
        let (sink, mut stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let scope = CancellationToken::new();
        // Direct-mode children die with this transport.
        let _guard = scope.clone().drop_guard();

        // The first meaningful frame must be start.
        let command = loop {
            let payload = match next_payload(&mut stream).await? {
                Some(payload) => payload,
                None => return Ok(()),
            };
            let (header, _body) = split_message(&payload);
            match ClientHeader::decode(header) {
                Ok(ClientHeader::Start { id, command }) => break Command::from_wire(id, command),
                Ok(other) => {
                    return Err(Error::Protocol(ProtocolError::UnexpectedType(
                        client_kind(&other).to_string(),
                    )))
                }
                Err(ProtocolError::UnknownType(kind)) => {
                    debug!(%kind, "ignoring unknown message before start");
                }
                Err(err) => return Err(Error::Protocol(err)),
            }
        };

        if command.tty && (command.rows == 0 || command.cols == 0) {
            return Err(Error::Protocol(ProtocolError::MalformedHeader(
                "tty commands require non-zero rows and cols".to_string(),
            )));
        }

        let (mut process, session) = match self
            .start_process(&scope, execer, command, &options)
            .await
        {
            Ok(started) => started,
            Err(err) => {
                warn!(error = %err, "failed to start command");
                send_header(
                    &sink,
                    &ServerHeader::ExitCode {
                        exit_code: 0,
                        error: err.to_string(),
                    },
                )
                .await?;
                let _ = sink
                    .lock()
                    .await
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "normal closure".into(),
                    })))
                    .await;
                return Ok(());
            }
        };

        let mut stdin = process.stdin();
        let stdout = process.stdout();
        let stderr = process.stderr();
        let process: Arc<dyn Process> = Arc::from(process);

        // Pid goes out before any output byte.
        send_header(&sink, &ServerHeader::Pid { pid: process.pid() }).await?;

        let mut copiers = Vec::new();
        if let Some(reader) = stdout {
            copiers.push(tokio::spawn(copy_output(
                ServerHeader::Stdout,
                reader,
                sink.clone(),
                session,
            )));
        }
        if let Some(reader) = stderr {
            copiers.push(tokio::spawn(copy_output(
                ServerHeader::Stderr,
                reader,
                sink.clone(),
                None,
            )));
        }

        let (exit_tx, mut exit_rx) = oneshot::channel();
        {
            let process = process.clone();
            tokio::spawn(async move {
                let _ = exit_tx.send(process.wait().await);
            });
        }

        let outcome = loop {
            tokio::select! {
                outcome = &mut exit_rx => break outcome,
                payload = next_payload(&mut stream) => {
                    let payload = match payload? {
                        Some(payload) => payload,
                        None => return Ok(()),
                    };
                    let (header, body) = split_message(&payload);
                    match ClientHeader::decode(header) {
                        Ok(ClientHeader::Stdin) => match stdin.as_mut() {
                            Some(writer) => writer.write_all(body).await.map_err(Error::Io)?,
                            None => {
                                return Err(Error::Protocol(ProtocolError::UnexpectedType(
                                    "stdin".to_string(),
                                )))
                            }
                        },
                        Ok(ClientHeader::CloseStdin) => {
                            if let Some(mut writer) = stdin.take() {
                                writer.shutdown().await.map_err(Error::Io)?;
                            }
                        }
                        Ok(ClientHeader::Resize { rows, cols }) => {
                            process.resize(rows, cols).await?;
                        }
                        Ok(ClientHeader::Start { .. }) => {
                            return Err(Error::Protocol(ProtocolError::UnexpectedType(
                                "start".to_string(),
                            )))
                        }
                        Err(ProtocolError::UnknownType(kind)) => {
                            debug!(%kind, "ignoring unknown message");
                        }
                        Err(err) => return Err(Error::Protocol(err)),
                    }
                }
            }
        };

        // Drain the copiers first so exit_code is the final frame.
        for copier in copiers {
            let _ = copier.await;
        }
        let header = match outcome {
            Ok(Ok(())) => ServerHeader::ExitCode {
                exit_code: 0,
                error: String::new(),
            },
            Ok(Err(Error::Exit(exit))) => ServerHeader::ExitCode {
                exit_code: exit.code,
                error: String::new(),
            },
            Ok(Err(err)) => ServerHeader::ExitCode {
                exit_code: 0,
                error: err.to_string(),
            },
            Err(_) => ServerHeader::ExitCode {
                exit_code: 0,
                error: "process waiter terminated".to_string(),
            },
        };
        send_header(&sink, &header).await?;
        let _ = sink
            .lock()
            .await
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "normal closure".into(),
            })))
            .await;
        Ok(())
    }

    /// Starts the requested process: through the session table for TTY
    /// commands with an id, directly otherwise. Reconnect silently
    /// degrades to a one-shot process when the multiplexer is missing.
    async fn start_process(
        &self,
        scope: &CancellationToken,
        execer: Arc<dyn Execer>,
        command: Command,
        options: &Options,
    ) -> Result<(Box<dyn Process>, Option<Arc<Session>>)> {
        if command.tty && !command.id.is_empty() {
            if session::multiplexer_available() {
                let session = self.lookup_or_create(execer, &command, options);
                let process = session.clone().attach(scope, &command).await?;
                return Ok((process, Some(session)));
            }
            debug!(
                multiplexer = session::MULTIPLEXER,
                "multiplexer not on PATH, reconnect disabled for this command"
            );
        }
        let process = execer.start(scope.child_token(), command).await?;
        Ok((process, None))
    }

    /// Atomic lookup-or-insert on the session table.
    fn lookup_or_create(
        &self,
        execer: Arc<dyn Execer>,
        command: &Command,
        options: &Options,
    ) -> Arc<Session> {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(command.id.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let session = Session::new(command.clone(), execer, options.session_timeout);
                entry.insert(session.clone());
                let sessions = self.sessions.clone();
                let id = command.id.clone();
                let watched = session.clone();
                tokio::spawn(async move {
                    watched.wait_state(SessionState::Closing).await;
                    // Drop the entry before the process is fully reaped
                    // so a new attach cannot race into a closing session.
                    sessions.remove(&id);
                });
                session
            }
        }
    }
}

fn client_kind(header: &ClientHeader) -> &'static str {
    match header {
        ClientHeader::Start { .. } => "start",
        ClientHeader::Stdin => "stdin",
        ClientHeader::CloseStdin => "close_stdin",
        ClientHeader::Resize { .. } => "resize",
    }
}

/// Reads the next data payload, skipping control frames. `None` means
/// the peer is gone or said goodbye.
async fn next_payload<S>(stream: &mut SplitStream<WebSocketStream<S>>) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = match stream.next().await {
            None => return Ok(None),
            Some(Err(err)) => return Err(Error::Transport(err.to_string())),
            Some(Ok(message)) => message,
        };
        let payload = match message {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => return Ok(None),
            _ => continue,
        };
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            }));
        }
        return Ok(Some(payload));
    }
}

async fn send_header<S>(sink: &Arc<Mutex<WsSink<S>>>, header: &ServerHeader) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let bytes = header.encode().map_err(Error::Protocol)?;
    sink.lock()
        .await
        .send(Message::Binary(bytes))
        .await
        .map_err(|err| Error::Transport(err.to_string()))
}

/// Frames process output back to the client in wire-budget chunks. End
/// of stream is expected; only surprising errors are logged.
async fn copy_output<S>(
    header: ServerHeader,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    sink: Arc<Mutex<WsSink<S>>>,
    session: Option<Arc<Session>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let header_bytes = match header.encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to encode output header");
            return;
        }
    };
    let budget = max_body_len(&header_bytes);
    let mut buf = vec![0u8; budget];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(session) = &session {
                    session.record_output(&buf[..n]);
                }
                let frame = encode_message(&header_bytes, &buf[..n]);
                if sink.lock().await.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                if err.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!(error = %err, "output copy failed");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_zero_selects_default_timeout() {
        let options = Options::default().resolved();
        assert_eq!(options.session_timeout, DEFAULT_SESSION_TIMEOUT);

        let options = Options {
            session_timeout: Duration::from_secs(1),
        }
        .resolved();
        assert_eq!(options.session_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_new_server_has_no_sessions() {
        assert_eq!(Server::new().session_count(), 0);
    }
}
