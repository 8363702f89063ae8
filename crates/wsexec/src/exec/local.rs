//! Local process execution.
//!
//! Spawns commands on the host, optionally under a pseudo-terminal,
//! specific credentials, and a niceness override. The child is tied to a
//! cancellation scope so a dropped transport cannot leak processes.

use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pty::PtyStream;
use super::{Command, Error, ExitError, Execer, Process, Result};

/// Grace period between the cooperative SIGTERM and a forced SIGKILL.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Marker injected into the environment of children running under a pty.
const TTY_ENV_HINT: &str = "WSEP_TTY";

/// Executes commands on the local system.
#[derive(Debug, Default)]
pub struct LocalExecer {
    /// Niceness applied to children after spawn. `None` inherits the
    /// server's priority.
    pub child_priority: Option<i32>,
}

impl Execer for LocalExecer {
    fn start(
        &self,
        scope: CancellationToken,
        command: Command,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Process>>> + Send + '_>> {
        let priority = self.child_priority;
        Box::pin(async move {
            let process = LocalProcess::spawn(scope, command, priority)?;
            Ok(Box::new(process) as Box<dyn Process>)
        })
    }
}

/// Terminal state of a local child, published once by the waiter task.
#[derive(Debug, Clone)]
enum ExitOutcome {
    /// The child exited; signal deaths report code -1.
    Exited(i32),
    /// Waiting on the child failed.
    Failed(String),
    /// The cancellation scope fired and the child was killed.
    Canceled,
}

/// A command started by [`LocalExecer`].
///
/// The IO endpoints live behind plain mutexes only to keep the process
/// shareable across tasks; they are taken through `&mut self` and never
/// contended.
pub struct LocalProcess {
    pid: i32,
    /// Master side of the pty, kept for resize. `None` without a tty.
    pty: Option<OwnedFd>,
    stdin: StdMutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    stdout: StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    stderr: StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl std::fmt::Debug for LocalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcess").field("pid", &self.pid).finish()
    }
}

impl LocalProcess {
    fn spawn(
        scope: CancellationToken,
        command: Command,
        priority: Option<i32>,
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(&command.command);
        cmd.args(&command.args);
        for entry in &command.env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        if !command.working_dir.is_empty() {
            cmd.current_dir(&command.working_dir);
        }
        if command.uid != 0 {
            cmd.uid(command.uid);
        }
        if command.gid != 0 {
            cmd.gid(command.gid);
        }
        cmd.kill_on_drop(true);

        let mut pty = None;
        let stdin;
        let stdout;
        let stderr: Box<dyn AsyncRead + Send + Unpin>;

        let child = if command.tty {
            cmd.env(TTY_ENV_HINT, "true");
            let (master, slave) = openpty(command.rows, command.cols)
                .map_err(|err| Error::Spawn(format!("allocate pty: {err}")))?;
            cmd.stdin(Stdio::from(slave.try_clone().map_err(Error::Io)?));
            cmd.stdout(Stdio::from(slave.try_clone().map_err(Error::Io)?));
            cmd.stderr(Stdio::from(slave));
            // SAFETY: only async-signal-safe calls between fork and exec.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            let child = cmd
                .spawn()
                .map_err(|err| Error::Spawn(format!("start command with pty: {err}")))?;

            // The pty merges stdout and stderr; both stdin and stdout are
            // the master.
            let reader = PtyStream::new(master.try_clone().map_err(Error::Io)?)?;
            let writer = PtyStream::new(master.try_clone().map_err(Error::Io)?)?;
            stdout = Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>;
            stdin = Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>;
            stderr = Box::new(tokio::io::empty());
            pty = Some(master);
            child
        } else {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            cmd.stdin(if command.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            });
            let mut child = cmd
                .spawn()
                .map_err(|err| Error::Spawn(format!("start command: {err}")))?;

            stdin = match child.stdin.take() {
                Some(writer) => Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
                None => Box::new(DisabledStdin),
            };
            stdout = match child.stdout.take() {
                Some(reader) => Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>,
                None => Box::new(tokio::io::empty()),
            };
            stderr = match child.stderr.take() {
                Some(reader) => Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>,
                None => Box::new(tokio::io::empty()),
            };
            child
        };

        let pid = child.id().map(|pid| pid as i32).unwrap_or(-1);

        if let Some(niceness) = priority {
            // SAFETY: plain syscall on the child we just spawned.
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, niceness) };
            if rc == -1 {
                return Err(Error::Spawn(format!(
                    "set priority {niceness} for pid {pid}: {}",
                    io::Error::last_os_error()
                )));
            }
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_child(child, scope, exit_tx));

        Ok(Self {
            pid,
            pty,
            stdin: StdMutex::new(Some(stdin)),
            stdout: StdMutex::new(Some(stdout)),
            stderr: StdMutex::new(Some(stderr)),
            exit: exit_rx,
        })
    }
}

impl Process for LocalProcess {
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
        let result = match &self.pty {
            Some(master) => {
                let size = libc::winsize {
                    ws_row: rows,
                    ws_col: cols,
                    ws_xpixel: 0,
                    ws_ypixel: 0,
                };
                // SAFETY: ioctl on an owned master descriptor.
                let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
                if rc != 0 {
                    Err(Error::Io(io::Error::last_os_error()))
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        };
        Box::pin(std::future::ready(result))
    }

    fn wait(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let mut exit = self.exit.clone();
        Box::pin(async move {
            let outcome = exit
                .wait_for(|outcome| outcome.is_some())
                .await
                .map_err(|_| Error::Wait("process waiter terminated".to_string()))?
                .clone();
            let Some(outcome) = outcome else {
                return Err(Error::Wait("process state lost".to_string()));
            };
            match outcome {
                ExitOutcome::Exited(0) => Ok(()),
                ExitOutcome::Exited(code) => Err(Error::Exit(ExitError { code })),
                ExitOutcome::Failed(message) => Err(Error::Wait(message)),
                ExitOutcome::Canceled => Err(Error::Wait("execution canceled".to_string())),
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let pid = self.pid;
        let mut exit = self.exit.clone();
        Box::pin(async move {
            kill(Pid::from_raw(pid), Signal::SIGTERM)
                .map_err(|errno| Error::Io(io::Error::from(errno)))?;
            // Escalate if the child ignores the cooperative signal.
            tokio::spawn(async move {
                let exited =
                    tokio::time::timeout(CLOSE_GRACE, exit.wait_for(|o| o.is_some())).await;
                if exited.is_err() {
                    debug!(pid, "process ignored SIGTERM, sending SIGKILL");
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                }
            });
            Ok(())
        })
    }
}

async fn wait_child(
    mut child: Child,
    scope: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitOutcome::Exited(status.code().unwrap_or(-1)),
            Err(err) => ExitOutcome::Failed(err.to_string()),
        },
        _ = scope.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            ExitOutcome::Canceled
        }
    };
    let _ = exit_tx.send(Some(outcome));
}

/// Allocates a pty pair with the requested window size.
fn openpty(rows: u16, cols: u16) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: out-pointers are valid for the duration of the call.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut size,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: openpty returned descriptors we now own.
    unsafe { Ok((OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave))) }
}

/// Writer standing in for stdin when the command did not request one.
pub(crate) struct DisabledStdin;

impl AsyncWrite for DisabledStdin {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::Other,
            Error::StdinDisabled.to_string(),
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::combined_output;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn start_local(
        command: Command,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Process>>> + Send + 'static>> {
        let scope = CancellationToken::new();
        Box::pin(async move { LocalExecer::default().start(scope, command).await })
    }

    #[tokio::test]
    async fn test_local_exec_pwd() {
        let mut process = start_local(Command {
            command: "pwd".to_string(),
            ..Command::default()
        })
        .await
        .unwrap();

        let mut stdout = process.stdout().unwrap();
        let mut stderr = process.stderr().unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (read_out, read_err, result) = tokio::join!(
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err),
            process.wait(),
        );
        read_out.unwrap();
        read_err.unwrap();
        result.unwrap();

        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            String::from_utf8_lossy(&out).trim_end(),
            cwd.to_string_lossy()
        );
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn test_local_exec_exit_code() {
        let process = start_local(Command {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "\"fakecommand\"".to_string()],
            ..Command::default()
        })
        .await
        .unwrap();

        let err = process.wait().await.unwrap_err();
        match err {
            Error::Exit(exit) => assert_eq!(exit.code, 127),
            other => panic!("expected exit error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_local_exec_stdin() {
        let mut process = start_local(Command {
            command: "cat".to_string(),
            stdin: true,
            ..Command::default()
        })
        .await
        .unwrap();

        let mut stdin = process.stdin().unwrap();
        let mut stdout = process.stdout().unwrap();

        stdin.write_all(b"testing value").await.unwrap();
        stdin.shutdown().await.unwrap();
        drop(stdin);

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        process.wait().await.unwrap();

        assert_eq!(out, b"testing value");
    }

    #[tokio::test]
    async fn test_local_exec_stdin_disabled() {
        let mut process = start_local(Command {
            command: "cat".to_string(),
            stdin: false,
            ..Command::default()
        })
        .await
        .unwrap();

        let mut stdin = process.stdin().unwrap();
        let err = stdin.write_all(b"testing value").await.unwrap_err();
        assert!(err.to_string().contains("stdin is not enabled"));

        // cat without stdin reads /dev/null and exits cleanly.
        let mut stdout = process.stdout().unwrap();
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        process.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_exec_stdout_vs_stderr() {
        let mut process = start_local(Command {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo stdout-message; echo 1>&2 stderr-message".to_string(),
            ],
            ..Command::default()
        })
        .await
        .unwrap();

        let mut stdout = process.stdout().unwrap();
        let mut stderr = process.stderr().unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (read_out, read_err, result) = tokio::join!(
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err),
            process.wait(),
        );
        read_out.unwrap();
        read_err.unwrap();
        result.unwrap();

        assert_eq!(String::from_utf8_lossy(&out).trim(), "stdout-message");
        assert_eq!(String::from_utf8_lossy(&err).trim(), "stderr-message");
    }

    #[tokio::test]
    async fn test_local_exec_env_appended() {
        let (output, result) = combined_output(
            &LocalExecer::default(),
            CancellationToken::new(),
            Command {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), "echo value:$WSX_TEST_ENV".to_string()],
                env: vec!["WSX_TEST_ENV=hello".to_string()],
                ..Command::default()
            },
        )
        .await;
        result.unwrap();
        assert!(String::from_utf8_lossy(&output).contains("value:hello"));
    }

    #[tokio::test]
    async fn test_local_exec_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        let (output, result) = combined_output(
            &LocalExecer::default(),
            CancellationToken::new(),
            Command {
                command: "pwd".to_string(),
                working_dir: canonical.to_string_lossy().into_owned(),
                ..Command::default()
            },
        )
        .await;
        result.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&output).trim_end(),
            canonical.to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_local_exec_resize_noop_without_tty() {
        let process = start_local(Command {
            command: "sleep".to_string(),
            args: vec!["1".to_string()],
            ..Command::default()
        })
        .await
        .unwrap();

        process.resize(0, 0).await.unwrap();
        process.resize(50, 150).await.unwrap();
        process.close().await.unwrap();
        let _ = process.wait().await;
    }

    #[tokio::test]
    async fn test_local_exec_tty_marks_environment() {
        let mut process = start_local(Command {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo marker:$WSEP_TTY".to_string()],
            tty: true,
            stdin: true,
            rows: 24,
            cols: 80,
            env: vec!["TERM=xterm".to_string()],
            ..Command::default()
        })
        .await
        .unwrap();

        let mut stdout = process.stdout().unwrap();
        let mut out = Vec::new();
        let (_, result) = tokio::join!(stdout.read_to_end(&mut out), process.wait());
        result.unwrap();

        assert!(
            String::from_utf8_lossy(&out).contains("marker:true"),
            "missing tty marker in {:?}",
            String::from_utf8_lossy(&out)
        );
    }

    #[tokio::test]
    async fn test_local_exec_tty_resize() {
        let mut process = start_local(Command {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 1".to_string()],
            tty: true,
            stdin: true,
            rows: 24,
            cols: 80,
            ..Command::default()
        })
        .await
        .unwrap();

        process.resize(50, 150).await.unwrap();
        process.close().await.unwrap();

        let mut stdout = process.stdout().unwrap();
        let mut out = Vec::new();
        let _ = stdout.read_to_end(&mut out).await;
        let _ = process.wait().await;
    }

    #[tokio::test]
    async fn test_local_exec_close_terminates() {
        let mut process = start_local(Command {
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            ..Command::default()
        })
        .await
        .unwrap();

        process.close().await.unwrap();
        let err = process.wait().await.unwrap_err();
        match err {
            Error::Exit(exit) => assert_eq!(exit.code, -1),
            other => panic!("expected signal exit, got {other}"),
        }

        // Readers hit end of stream once the child is gone.
        let mut stdout = process.stdout().unwrap();
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_exec_cancellation_kills_child() {
        let scope = CancellationToken::new();
        let process = LocalExecer::default()
            .start(
                scope.clone(),
                Command {
                    command: "sleep".to_string(),
                    args: vec!["30".to_string()],
                    ..Command::default()
                },
            )
            .await
            .unwrap();

        scope.cancel();
        let err = process.wait().await.unwrap_err();
        assert!(matches!(err, Error::Wait(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_local_exec_spawn_failure() {
        let result = start_local(Command {
            command: "/nonexistent/program".to_string(),
            ..Command::default()
        })
        .await;
        assert!(matches!(result, Err(Error::Spawn(_))));
    }
}
