//! IMAP response vocabulary
//!
//! Typed forms of the server-side tokens the client reacts to: tagged
//! status conditions, capability tokens and message flags.

use std::fmt;

/// Tagged (or untagged) status condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    /// Parse a status atom, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("OK") {
            Some(Status::Ok)
        } else if s.eq_ignore_ascii_case("NO") {
            Some(Status::No)
        } else if s.eq_ignore_ascii_case("BAD") {
            Some(Status::Bad)
        } else {
            None
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        };
        write!(f, "{}", s)
    }
}

/// Server capability token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Imap4Rev1,
    LoginDisabled,
    UidPlus,
    Idle,
    Other(String),
}

impl Capability {
    /// Parse a capability atom, case-insensitively
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("IMAP4rev1") {
            Capability::Imap4Rev1
        } else if s.eq_ignore_ascii_case("LOGINDISABLED") {
            Capability::LoginDisabled
        } else if s.eq_ignore_ascii_case("UIDPLUS") {
            Capability::UidPlus
        } else if s.eq_ignore_ascii_case("IDLE") {
            Capability::Idle
        } else {
            Capability::Other(s.to_ascii_uppercase())
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Imap4Rev1 => write!(f, "IMAP4rev1"),
            Capability::LoginDisabled => write!(f, "LOGINDISABLED"),
            Capability::UidPlus => write!(f, "UIDPLUS"),
            Capability::Idle => write!(f, "IDLE"),
            Capability::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Message flag as it appears in a FETCH FLAGS list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flag {
    Answered,
    Seen,
    Flagged,
    Draft,
    Deleted,
    Recent,
    Other(String),
}

impl Flag {
    /// Parse a flag token (with or without the leading backslash)
    pub fn parse(s: &str) -> Self {
        let name = s.strip_prefix('\\').unwrap_or(s);
        if name.eq_ignore_ascii_case("Answered") {
            Flag::Answered
        } else if name.eq_ignore_ascii_case("Seen") {
            Flag::Seen
        } else if name.eq_ignore_ascii_case("Flagged") {
            Flag::Flagged
        } else if name.eq_ignore_ascii_case("Draft") {
            Flag::Draft
        } else if name.eq_ignore_ascii_case("Deleted") {
            Flag::Deleted
        } else if name.eq_ignore_ascii_case("Recent") {
            Flag::Recent
        } else {
            Flag::Other(s.to_string())
        }
    }

    /// Maildir info-suffix character for this flag.
    ///
    /// `\Recent` and `\Deleted` have no Maildir counterpart in a freshly
    /// delivered message and map to nothing, as do unknown keywords.
    pub fn maildir_char(&self) -> Option<char> {
        match self {
            Flag::Answered => Some('R'),
            Flag::Seen => Some('S'),
            Flag::Flagged => Some('F'),
            Flag::Draft => Some('D'),
            Flag::Deleted | Flag::Recent | Flag::Other(_) => None,
        }
    }
}
