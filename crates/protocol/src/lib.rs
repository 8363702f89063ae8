//! # wsexec Protocol Library
//!
//! Wire format shared by the wsexec client and server.
//!
//! Every transport message carries exactly one protocol frame. A frame is
//! a compact JSON header, optionally followed by a single line feed and an
//! opaque binary body:
//!
//! ```text
//! ┌──────────────────┬────┬──────────────────────────┐
//! │   JSON header    │ \n │   binary body (optional) │
//! └──────────────────┴────┴──────────────────────────┘
//! ```
//!
//! The header's mandatory `type` field selects the message variant. Only
//! the first line feed splits the frame; the body may contain any bytes,
//! including further line feeds.
//!
//! ## Modules
//!
//! - [`framing`]: frame encoding, splitting, and the message size budget
//! - [`messages`]: client and server header definitions
//! - [`error`]: error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    encode_message, max_body_len, split_message, HeaderWriter, DELIMITER, MAX_MESSAGE_SIZE,
};
pub use messages::{ClientHeader, Command, ServerHeader};
