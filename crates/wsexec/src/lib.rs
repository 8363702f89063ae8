//! # wsexec
//!
//! Remote command execution over a single full-duplex WebSocket
//! transport. One endpoint (the server) owns a process launcher; the
//! other (the client) drives a command, supplies stdin, resizes the
//! terminal, and consumes stdout, stderr, the process id, and the exit
//! code. Functionally this is SSH without encryption; authentication and
//! confidentiality are an outer layer's responsibility.
//!
//! ## Overview
//!
//! - [`exec`]: the `Execer`/`Process` capability set plus the local
//!   implementation that spawns OS processes, optionally under a
//!   pseudo-terminal and specific credentials.
//! - [`client`]: `RemoteExecer`, an `Execer` that drives the transport
//!   and exposes the remote command as a `Process`.
//! - [`server`]: the per-transport dispatcher that reads framed messages
//!   and streams output back, plus the per-server session table.
//! - [`session`]: named, detached TTY sessions that survive client
//!   disconnects for an inactivity window and replay recent output on
//!   re-attach via a terminal multiplexer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   frames over one WebSocket    ┌──────────────────┐
//! │ RemoteExecer│ ─────────────────────────────▶ │ Server::serve    │
//! │  (client)   │ ◀───────────────────────────── │  ├─ LocalExecer  │
//! └─────────────┘   pid / stdout / stderr /      │  └─ Session table│
//!                   exit_code                    └──────────────────┘
//! ```
//!
//! A server can chain execers: serving a `RemoteExecer` forwards every
//! command to another wsexec server.

pub mod client;
pub mod exec;
pub mod server;
pub mod session;

pub use client::RemoteExecer;
pub use exec::local::LocalExecer;
pub use exec::{combined_output, Command, Error, ExitError, Execer, Process, Result};
pub use server::{Options, Server};
pub use session::{Session, SessionState};
