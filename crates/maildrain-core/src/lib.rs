//! Maildrain Core - IMAP session state machine and Maildir delivery
//!
//! This crate implements the drain itself: the TCP/TLS transport, the
//! incremental response parser, the command writer, the protocol state
//! machine, and crash-safe Maildir delivery of fetched messages.

pub mod imap;
pub mod maildir;
pub mod tls;
pub mod transport;
pub mod uidset;

pub use imap::session::{Session, State};
