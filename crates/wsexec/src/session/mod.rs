//! Reconnectable TTY sessions.
//!
//! A session is a named, detached terminal instance that survives client
//! disconnects for an inactivity window. Detach and re-attach are
//! delegated to a terminal multiplexer (`screen`) found on PATH, which
//! also redraws the screen for late attachers; the session tracks its
//! lifecycle, keeps it alive while transports are attached, and tears it
//! down when the inactivity timer fires.
//!
//! States move forward only: Starting → Ready → Closing → Done. The
//! first error observed during any transition is preserved and reported
//! to every attacher until the session is removed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::exec::{combined_output, Command, Error, Execer, Process, Result};

pub mod replay;

use replay::ReplayBuffer;

/// The external terminal multiplexer used for detach and re-attach.
pub(crate) const MULTIPLEXER: &str = "screen";

/// Applied when the configured session timeout is zero.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Bound on session probes and on the window between session creation
/// and the first attach.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between probe retries.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// How long a quit request may take before the daemon is killed.
const QUIT_GRACE: Duration = Duration::from_secs(5);

/// Directory under the system temp dir holding the multiplexer
/// configuration and sockets.
const SCREEN_DIR_NAME: &str = "coder-screen";

/// Lifecycle state of a session. States are sequential and only move
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Initial state; the daemon is being created and probed.
    Starting,
    /// The daemon answers probes and can be attached.
    Ready,
    /// Shutdown has begun; the underlying process may still be exiting.
    Closing,
    /// The underlying process has exited.
    Done,
}

/// A detached terminal session owned by a [`crate::Server`].
pub struct Session {
    /// The command that created the session, replayed on every attach.
    command: Command,
    execer: Arc<dyn Execer>,
    /// Internal session name. Generated rather than taken from the
    /// client so stale sessions with a recycled client id cannot be
    /// matched by accident.
    name: String,
    /// Concrete `<pid>.<name>` target, known once the daemon is up.
    screen_id: StdMutex<Option<String>>,
    config_file: PathBuf,
    sockets_dir: PathBuf,
    timeout: Duration,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    /// First error observed during a state change.
    error: StdMutex<Option<String>>,
    /// Serializes attaches. The multiplexer happily creates duplicate
    /// sessions with the same name when two attaches race.
    attach_lock: Mutex<()>,
    /// Inactivity deadline; the timer task closes the session when it
    /// passes.
    deadline: StdMutex<Instant>,
    deadline_changed: Notify,
    /// Session-owned scope, independent of any transport.
    scope: CancellationToken,
    replay: StdMutex<ReplayBuffer>,
}

impl Session {
    /// Sets up a new session. Errors with starting are returned on
    /// [`Session::attach`]. The session closes itself when nothing is
    /// attached for the duration of the timeout.
    pub fn new(command: Command, execer: Arc<dyn Execer>, timeout: Duration) -> Arc<Self> {
        let root = std::env::temp_dir().join(SCREEN_DIR_NAME);
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let session = Arc::new(Self {
            command,
            execer,
            name: Uuid::new_v4().to_string(),
            screen_id: StdMutex::new(None),
            config_file: root.join("config"),
            sockets_dir: root.join("sockets"),
            timeout,
            state_tx,
            state_rx,
            error: StdMutex::new(None),
            attach_lock: Mutex::new(()),
            // The window for the first attach is far shorter than the
            // inactivity timeout; it only needs to cover daemon startup.
            deadline: StdMutex::new(Instant::now() + ATTACH_TIMEOUT),
            deadline_changed: Notify::new(),
            scope: CancellationToken::new(),
            replay: StdMutex::new(ReplayBuffer::new()),
        });
        tokio::spawn(session.clone().lifecycle());
        tokio::spawn(session.clone().run_timer());
        session
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Blocks until the target state or a later one is reached.
    pub async fn wait_state(&self, target: SessionState) -> SessionState {
        let mut state = self.state_rx.clone();
        let result = match state.wait_for(|current| *current >= target).await {
            Ok(current) => *current,
            Err(_) => SessionState::Done,
        };
        result
    }

    /// Begins shutdown and waits until the underlying process exited.
    /// Closing a session that is already done is a no-op.
    pub async fn close(&self) {
        self.set_state(SessionState::Closing, None);
        self.wait_state(SessionState::Done).await;
    }

    /// Records output bytes into the bounded replay ring.
    pub fn record_output(&self, bytes: &[u8]) {
        self.replay.lock().unwrap().write(bytes);
    }

    /// The most recent output of this session, oldest first, bounded by
    /// the ring capacity.
    pub fn replay_snapshot(&self) -> Vec<u8> {
        self.replay.lock().unwrap().snapshot()
    }

    /// Attaches to the session, waiting for it to become ready, and
    /// returns the attached process. The process ends when `scope`
    /// fires; the session itself lives on.
    pub async fn attach(
        self: Arc<Self>,
        scope: &CancellationToken,
        command: &Command,
    ) -> Result<Box<dyn Process>> {
        // Serialize against simultaneous attaches from other transports.
        let _serialized = self.attach_lock.lock().await;

        match self.wait_state(SessionState::Ready).await {
            SessionState::Closing => return Err(self.stored_error("session is closing")),
            SessionState::Done => return Err(self.stored_error("session is done")),
            _ => {}
        }

        // The attach scope ends with the transport or when the session
        // begins closing, whichever comes first.
        let attach_scope = scope.child_token();
        {
            let session = self.clone();
            let guard = attach_scope.clone();
            tokio::spawn(async move {
                session.wait_state(SessionState::Closing).await;
                guard.cancel();
            });
        }
        tokio::spawn(self.clone().heartbeat(attach_scope.clone()));

        let target = self.screen_id()?;
        // -S targets the session, -x attaches even if already attached,
        // -RR recreates the daemon if it is missing, -q drops the
        // multi-second banner, -c points at our configuration.
        let mut args = vec![
            "-S".to_string(),
            target,
            "-xRRqc".to_string(),
            self.config_file.display().to_string(),
            command.command.clone(),
        ];
        args.extend(command.args.iter().cloned());
        let attach_command = Command {
            id: String::new(),
            command: MULTIPLEXER.to_string(),
            args,
            tty: command.tty,
            stdin: command.stdin,
            rows: command.rows,
            cols: command.cols,
            uid: command.uid,
            gid: command.gid,
            env: self.merged_env(&command.env),
            working_dir: command.working_dir.clone(),
        };
        let process = match self.execer.start(attach_scope.clone(), attach_command).await {
            Ok(process) => process,
            Err(err) => {
                attach_scope.cancel();
                return Err(err);
            }
        };

        // Attaching milliseconds after creation can race "session does
        // not exist"; gate on one more successful probe.
        if let Err(err) = self.send_command("version", &[]).await {
            attach_scope.cancel();
            return Err(err);
        }

        Ok(process)
    }

    async fn lifecycle(self: Arc<Self>) {
        if let Err(err) = self.ensure_settings() {
            self.set_state(
                SessionState::Done,
                Some(format!("prepare multiplexer settings: {err}")),
            );
            return;
        }

        let mut daemon = match self.spawn_daemon().await {
            Ok(daemon) => daemon,
            Err(err) => {
                self.set_state(SessionState::Done, Some(err.to_string()));
                return;
            }
        };
        *self.screen_id.lock().unwrap() = Some(format!("{}.{}", daemon.pid(), self.name));

        // The daemon prints very little, but its pipes still need a
        // consumer.
        if let Some(mut stdout) = daemon.stdout() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            });
        }
        if let Some(mut stderr) = daemon.stderr() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            });
        }

        // Version is the only side-effect-free command; probe with it
        // until the daemon answers.
        if let Err(err) = self.send_command("version", &[]).await {
            self.set_state(SessionState::Done, Some(err.to_string()));
            self.scope.cancel();
            let _ = daemon.wait().await;
            return;
        }
        self.set_state(SessionState::Ready, None);
        debug!(session = %self.name, "session ready");

        tokio::select! {
            _ = self.wait_state(SessionState::Closing) => {
                // An already-gone session counts as a successful quit.
                if let Err(err) = self.send_command("quit", &["No screen session found"]).await {
                    error!(session = %self.name, error = %err, "failed to quit session");
                }
                if tokio::time::timeout(QUIT_GRACE, daemon.wait()).await.is_err() {
                    warn!(session = %self.name, "session ignored quit, killing");
                    self.scope.cancel();
                    let _ = daemon.wait().await;
                }
            }
            _ = daemon.wait() => {
                self.set_state(SessionState::Closing, None);
            }
        }
        self.set_state(SessionState::Done, None);
        debug!(session = %self.name, "session done");
    }

    async fn run_timer(self: Arc<Self>) {
        let mut state = self.state_rx.clone();
        loop {
            let deadline = *self.deadline.lock().unwrap();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    // The deadline may have been pushed out since we
                    // started sleeping.
                    if *self.deadline.lock().unwrap() <= Instant::now() {
                        info!(session = %self.name, "session timed out with no attachers");
                        self.set_state(SessionState::Closing, None);
                        return;
                    }
                }
                _ = self.deadline_changed.notified() => {}
                _ = state.wait_for(|s| *s >= SessionState::Closing) => return,
            }
        }
    }

    /// Keeps the inactivity timer pushed out while an attach is live,
    /// then grants the session its full window once more on the way out.
    async fn heartbeat(self: Arc<Self>, scope: CancellationToken) {
        self.reset_deadline();
        let mut ticker = tokio::time::interval(self.timeout / 2);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => self.reset_deadline(),
            }
        }
        self.reset_deadline();
    }

    fn reset_deadline(&self) {
        *self.deadline.lock().unwrap() = Instant::now() + self.timeout;
        self.deadline_changed.notify_waiters();
    }

    async fn spawn_daemon(&self) -> Result<Box<dyn Process>> {
        // -D -m runs the daemon in the foreground of the spawned child,
        // so its pid is the child's pid and shutdown is deterministic.
        let mut args = vec![
            "-S".to_string(),
            self.name.clone(),
            "-Dmc".to_string(),
            self.config_file.display().to_string(),
            self.command.command.clone(),
        ];
        args.extend(self.command.args.iter().cloned());
        self.execer
            .start(
                self.scope.child_token(),
                Command {
                    id: String::new(),
                    command: MULTIPLEXER.to_string(),
                    args,
                    tty: false,
                    stdin: false,
                    rows: 0,
                    cols: 0,
                    uid: self.command.uid,
                    gid: self.command.gid,
                    env: self.merged_env(&self.command.env),
                    working_dir: self.command.working_dir.clone(),
                },
            )
            .await
    }

    /// Runs a multiplexer command against the session, retrying until it
    /// succeeds or the probe bound expires. A failure whose output
    /// matches any entry of `success_errors` counts as success.
    async fn send_command(&self, command: &str, success_errors: &[&str]) -> Result<()> {
        let work = async {
            loop {
                match self.try_command(command, success_errors).await {
                    Ok(true) => return Ok(()),
                    // Some commands fail without any error output and
                    // then succeed moments later; keep trying.
                    Ok(false) => {}
                    Err(err) => return Err(err),
                }
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        };
        tokio::select! {
            result = tokio::time::timeout(ATTACH_TIMEOUT, work) => {
                result.map_err(|_| Error::SessionProbeTimeout)?
            }
            _ = self.scope.cancelled() => Err(Error::Session("session closed".to_string())),
        }
    }

    async fn try_command(&self, command: &str, success_errors: &[&str]) -> Result<bool> {
        let target = self.screen_id()?;
        let probe = Command {
            id: String::new(),
            command: MULTIPLEXER.to_string(),
            args: vec![
                "-S".to_string(),
                target,
                "-X".to_string(),
                command.to_string(),
            ],
            uid: self.command.uid,
            gid: self.command.gid,
            env: self.merged_env(&self.command.env),
            ..Command::default()
        };
        let (output, result) =
            combined_output(self.execer.as_ref(), self.scope.child_token(), probe).await;
        match result {
            Ok(()) => Ok(true),
            Err(Error::Spawn(message)) => Err(Error::Session(message)),
            Err(_) => {
                // The multiplexer reports its errors on stdout.
                let text = String::from_utf8_lossy(&output);
                Ok(success_errors.iter().any(|success| text.contains(success)))
            }
        }
    }

    /// Writes the configuration file and creates the sockets directory.
    /// Both are idempotent and shared by every session on the host.
    fn ensure_settings(&self) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let settings = [
            // Let xterm-family terminals handle wheel motion themselves
            // instead of the multiplexer cycling its command history.
            "termcapinfo xterm* ti@:te@",
            // Full-screen applications render in a separate buffer so
            // the scrollback survives them.
            "altscreen on",
            // C-a collides with too many applications; C-s is free.
            "escape ^Ss",
        ];
        std::fs::create_dir_all(&self.sockets_dir)?;
        std::fs::set_permissions(&self.sockets_dir, std::fs::Permissions::from_mode(0o700))?;
        std::fs::write(&self.config_file, settings.join("\n"))
    }

    fn merged_env(&self, base: &[String]) -> Vec<String> {
        let mut env = base.to_vec();
        env.push(format!("SCREENDIR={}", self.sockets_dir.display()));
        env
    }

    fn screen_id(&self) -> Result<String> {
        self.screen_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Session("session daemon not started".to_string()))
    }

    fn stored_error(&self, fallback: &str) -> Error {
        match self.error.lock().unwrap().clone() {
            Some(message) => Error::Session(message),
            None => Error::Session(fallback.to_string()),
        }
    }

    /// Advances the state if it is greater than the current one and
    /// keeps the first error.
    fn set_state(&self, state: SessionState, error: Option<String>) {
        if let Some(message) = error {
            let mut held = self.error.lock().unwrap();
            if held.is_none() {
                *held = Some(message);
            }
        }
        self.state_tx.send_if_modified(|current| {
            if state > *current {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

/// Finds `program` inside a PATH-formatted string.
pub(crate) fn lookup_path(program: &str, path: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| {
            std::fs::metadata(candidate)
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Whether the terminal multiplexer is on PATH. Its absence silently
/// disables reconnectable sessions; commands still run one-shot.
pub(crate) fn multiplexer_available() -> bool {
    std::env::var("PATH")
        .map(|path| lookup_path(MULTIPLEXER, &path).is_some())
        .unwrap_or(false)
}
