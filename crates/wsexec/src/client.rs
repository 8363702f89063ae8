//! Remote execution client.
//!
//! [`RemoteExecer`] implements [`Execer`] by driving the framed protocol
//! over a WebSocket: it sends `start`, requires `pid` as the first reply,
//! and exposes the running command as a [`Process`] whose stdout and
//! stderr pipes are fed by a background reader task. The readers must be
//! drained even when the output is uninteresting, otherwise the reader
//! task stalls on backpressure.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{ready, Context, Poll};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::debug;

use protocol::{encode_message, max_body_len, split_message, ClientHeader, ServerHeader};
use protocol::{ProtocolError, MAX_MESSAGE_SIZE};

use crate::exec::local::DisabledStdin;
use crate::exec::{Command, Error, Execer, ExitError, Process, Result};

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// Creates an execution interface from a WebSocket connection.
///
/// One connection drives at most one command. Once a command is started,
/// the connection belongs to the returned process; closing the process
/// closes the connection.
pub struct RemoteExecer<S> {
    ws: StdMutex<Option<WebSocketStream<S>>>,
}

impl<S> RemoteExecer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket connection.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws: StdMutex::new(Some(ws)),
        }
    }

    async fn start_inner(
        &self,
        scope: CancellationToken,
        command: Command,
    ) -> Result<Box<dyn Process>> {
        let mut ws = self
            .ws
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Protocol(ProtocolError::UnexpectedType("start".to_string())))?;

        let header = ClientHeader::Start {
            id: command.id.clone(),
            command: command.to_wire(),
        }
        .encode()
        .map_err(Error::Protocol)?;
        ws.send(Message::Binary(header))
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;

        // The first server frame must carry the pid.
        let pid = loop {
            let message = ws
                .next()
                .await
                .ok_or_else(|| Error::Transport("connection closed before pid".to_string()))?
                .map_err(|err| Error::Transport(err.to_string()))?;
            let payload = match message {
                Message::Binary(data) => data,
                Message::Text(text) => text.into_bytes(),
                Message::Close(_) => {
                    return Err(Error::Transport("connection closed before pid".to_string()))
                }
                _ => continue,
            };
            let (header, _body) = split_message(&payload);
            match ServerHeader::decode(header).map_err(Error::Protocol)? {
                ServerHeader::Pid { pid } => break pid,
                // The server reports commands that never ran on
                // exit_code instead of a pid.
                ServerHeader::ExitCode { exit_code, error } => {
                    return Err(if !error.is_empty() {
                        Error::Spawn(error)
                    } else if exit_code != 0 {
                        Error::Exit(ExitError { code: exit_code })
                    } else {
                        Error::Transport("command exited before pid".to_string())
                    })
                }
                other => {
                    return Err(Error::Protocol(ProtocolError::UnexpectedType(format!(
                        "{other:?}"
                    ))))
                }
            }
        };

        let (sink, stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let cancel = scope.child_token();

        let (stdout_write, stdout_read) = tokio::io::duplex(MAX_MESSAGE_SIZE);
        let (stderr_write, stderr_read) = tokio::io::duplex(MAX_MESSAGE_SIZE);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(read_loop(
            stream,
            stdout_write,
            stderr_write,
            exit_tx,
            cancel.clone(),
        ));

        let stdin: Box<dyn AsyncWrite + Send + Unpin> = if command.stdin {
            let (frame_tx, frame_rx) = mpsc::channel(1);
            tokio::spawn(stdin_pump(frame_rx, sink.clone()));
            Box::new(RemoteStdin::new(frame_tx)?)
        } else {
            Box::new(DisabledStdin)
        };

        Ok(Box::new(RemoteProcess {
            pid,
            stdin: StdMutex::new(Some(stdin)),
            stdout: StdMutex::new(Some(Box::new(stdout_read))),
            stderr: StdMutex::new(Some(Box::new(stderr_read))),
            sink,
            exit: exit_rx,
            cancel,
        }))
    }
}

impl<S> Execer for RemoteExecer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn start(
        &self,
        scope: CancellationToken,
        command: Command,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Process>>> + Send + '_>> {
        Box::pin(self.start_inner(scope, command))
    }
}

/// Terminal state recorded by the reader task.
#[derive(Debug, Clone)]
enum RemoteExit {
    /// The server sent `exit_code`.
    Code { exit_code: i32, error: String },
    /// The connection failed before `exit_code` arrived.
    ReadFailed(String),
}

/// A command running behind [`RemoteExecer`].
///
/// The IO endpoints live behind plain mutexes only to keep the process
/// shareable across tasks; they are taken through `&mut self` and never
/// contended.
pub struct RemoteProcess<S> {
    pid: i32,
    stdin: StdMutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    stdout: StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    stderr: StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    sink: Arc<Mutex<WsSink<S>>>,
    exit: watch::Receiver<Option<RemoteExit>>,
    cancel: CancellationToken,
}

impl<S> std::fmt::Debug for RemoteProcess<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess").field("pid", &self.pid).finish()
    }
}

impl<S> Process for RemoteProcess<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn pid(&self) -> i32 {
        self.pid
    }

    fn stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        self.stdin.get_mut().ok().and_then(|slot| slot.take())
    }

    fn stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout.get_mut().ok().and_then(|slot| slot.take())
    }

    fn stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stderr.get_mut().ok().and_then(|slot| slot.take())
    }

    fn resize(
        &self,
        rows: u16,
        cols: u16,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let sink = self.sink.clone();
        Box::pin(async move {
            let header = ClientHeader::Resize { rows, cols }
                .encode()
                .map_err(Error::Protocol)?;
            sink.lock()
                .await
                .send(Message::Binary(header))
                .await
                .map_err(|err| Error::Transport(err.to_string()))
        })
    }

    fn wait(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let mut exit = self.exit.clone();
        Box::pin(async move {
            let outcome = exit
                .wait_for(|outcome| outcome.is_some())
                .await
                .map_err(|_| Error::Transport("reader task terminated".to_string()))?
                .clone();
            let Some(outcome) = outcome else {
                return Err(Error::Transport("reader state lost".to_string()));
            };
            match outcome {
                RemoteExit::Code { exit_code: 0, error } if error.is_empty() => Ok(()),
                RemoteExit::Code { exit_code: 0, error } => Err(Error::Spawn(error)),
                RemoteExit::Code { exit_code, .. } => Err(Error::Exit(ExitError { code: exit_code })),
                RemoteExit::ReadFailed(message) => Err(Error::Transport(message)),
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let mut exit = self.exit.clone();
        Box::pin(async move {
            cancel.cancel();
            // Let the reader wind down so the close frame is the last
            // thing on the wire from our side.
            let _ = exit.wait_for(|outcome| outcome.is_some()).await;
            let result = sink
                .lock()
                .await
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "normal closure".into(),
                })))
                .await;
            match result {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(err) => Err(Error::Transport(err.to_string())),
            }
        })
    }
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    exit_tx: watch::Sender<Option<RemoteExit>>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let outcome = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break RemoteExit::ReadFailed("read canceled".to_string()),
            message = stream.next() => message,
        };
        let payload = match message {
            None | Some(Ok(Message::Close(_))) => {
                break RemoteExit::ReadFailed("connection closed before exit code".to_string())
            }
            Some(Err(err)) => break RemoteExit::ReadFailed(err.to_string()),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(_)) => continue,
        };

        let (header, body) = split_message(&payload);
        match ServerHeader::decode(header) {
            Ok(ServerHeader::Stdout) => {
                let write = tokio::select! {
                    _ = cancel.cancelled() => break RemoteExit::ReadFailed("read canceled".to_string()),
                    write = stdout.write_all(body) => write,
                };
                if let Err(err) = write {
                    break RemoteExit::ReadFailed(err.to_string());
                }
            }
            Ok(ServerHeader::Stderr) => {
                let write = tokio::select! {
                    _ = cancel.cancelled() => break RemoteExit::ReadFailed("read canceled".to_string()),
                    write = stderr.write_all(body) => write,
                };
                if let Err(err) = write {
                    break RemoteExit::ReadFailed(err.to_string());
                }
            }
            Ok(ServerHeader::ExitCode { exit_code, error }) => {
                break RemoteExit::Code { exit_code, error }
            }
            // A second pid is meaningless but harmless.
            Ok(ServerHeader::Pid { .. }) => {}
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(%kind, "ignoring unknown server message");
            }
            Err(err) => break RemoteExit::ReadFailed(err.to_string()),
        }
    };
    // Dropping the pipe writers delivers end of stream to the readers.
    let _ = exit_tx.send(Some(outcome));
}

/// One unit of work for the stdin pump.
enum StdinFrame {
    Data(Vec<u8>),
    Close,
}

async fn stdin_pump<S>(mut frames: mpsc::Receiver<StdinFrame>, sink: Arc<Mutex<WsSink<S>>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stdin_header = match ClientHeader::Stdin.encode() {
        Ok(header) => header,
        Err(_) => return,
    };
    let close_header = match ClientHeader::CloseStdin.encode() {
        Ok(header) => header,
        Err(_) => return,
    };

    while let Some(frame) = frames.recv().await {
        let (payload, last) = match frame {
            StdinFrame::Data(chunk) => (encode_message(&stdin_header, &chunk), false),
            StdinFrame::Close => (encode_message(&close_header, &[]), true),
        };
        let result = sink.lock().await.send(Message::Binary(payload)).await;
        if result.is_err() || last {
            return;
        }
    }
}

/// Stdin writer that frames every chunk and splits writes larger than
/// the wire budget. Shutting it down sends `close_stdin`.
struct RemoteStdin {
    sender: PollSender<StdinFrame>,
    max_body: usize,
    closed: bool,
}

impl RemoteStdin {
    fn new(sender: mpsc::Sender<StdinFrame>) -> Result<Self> {
        let header = ClientHeader::Stdin.encode().map_err(Error::Protocol)?;
        Ok(Self {
            sender: PollSender::new(sender),
            max_body: max_body_len(&header),
            closed: false,
        })
    }
}

impl AsyncWrite for RemoteStdin {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            )));
        }
        ready!(this.sender.poll_reserve(cx))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin pump gone"))?;
        let len = buf.len().min(this.max_body);
        this.sender
            .send_item(StdinFrame::Data(buf[..len].to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin pump gone"))?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        match ready!(this.sender.poll_reserve(cx)) {
            Ok(()) => {
                let _ = this.sender.send_item(StdinFrame::Close);
            }
            // The pump is already gone; nothing left to close.
            Err(_) => {}
        }
        this.closed = true;
        Poll::Ready(Ok(()))
    }
}
