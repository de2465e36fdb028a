//! IMAP4rev1 client module
//!
//! Implements the client side of the one-shot drain conversation.
//!
//! Commands issued:
//! - CAPABILITY, LOGIN
//! - SELECT
//! - FETCH 1:* (UID FLAGS BODY.PEEK[HEADER.FIELDS (date from subject)] BODY.PEEK[])
//! - UID STORE +FLAGS.SILENT (\Deleted), UID EXPUNGE / EXPUNGE
//! - LOGOUT
//!
//! Extensions understood: UIDPLUS (UID EXPUNGE) and LOGINDISABLED
//! detection. Everything else a server advertises is carried in the
//! capability set but unused.

pub mod command;
pub mod parser;
pub mod response;
pub mod session;

pub use session::{Session, State};
