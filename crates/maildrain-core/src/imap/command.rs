//! IMAP command serialization
//!
//! Allocates monotonic tags and renders the client's command repertoire
//! into wire-ready byte buffers. Exactly one command is outstanding at a
//! time, so the writer never needs to queue.

/// IMAP command tag (client-generated, unique per session)
pub type Tag = String;

const TAG_PREFIX: &str = "a";

/// Serializes IMAP commands, allocating one fresh tag per command.
#[derive(Debug, Default)]
pub struct CommandWriter {
    next_tag: u32,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_tag(&mut self) -> Tag {
        self.next_tag += 1;
        format!("{}{}", TAG_PREFIX, self.next_tag)
    }

    fn command(&mut self, body: &str) -> (Tag, Vec<u8>) {
        let tag = self.allocate_tag();
        let line = format!("{} {}\r\n", tag, body);
        (tag, line.into_bytes())
    }

    /// `CAPABILITY`
    pub fn capability(&mut self) -> (Tag, Vec<u8>) {
        self.command("CAPABILITY")
    }

    /// `LOGIN "user" "pass"`
    pub fn login(&mut self, username: &str, password: &str) -> (Tag, Vec<u8>) {
        self.command(&format!(
            "LOGIN {} {}",
            quote(username),
            quote(password)
        ))
    }

    /// `SELECT "mailbox"`
    pub fn select(&mut self, mailbox: &str) -> (Tag, Vec<u8>) {
        self.command(&format!("SELECT {}", quote(mailbox)))
    }

    /// The one fetch this client ever issues: every message, UID, flags,
    /// a few headers for logging, and the full body without touching \Seen.
    pub fn fetch_all(&mut self) -> (Tag, Vec<u8>) {
        self.command(
            "FETCH 1:* (UID FLAGS BODY.PEEK[HEADER.FIELDS (date from subject)] BODY.PEEK[])",
        )
    }

    /// `UID STORE <set> +FLAGS.SILENT (\Deleted)`
    pub fn uid_store_deleted(&mut self, set: &[(u32, u32)]) -> (Tag, Vec<u8>) {
        self.command(&format!(
            "UID STORE {} +FLAGS.SILENT (\\Deleted)",
            format_sequence_set(set)
        ))
    }

    /// `UID EXPUNGE <set>` (UIDPLUS servers only)
    pub fn uid_expunge(&mut self, set: &[(u32, u32)]) -> (Tag, Vec<u8>) {
        self.command(&format!("UID EXPUNGE {}", format_sequence_set(set)))
    }

    /// `EXPUNGE`
    pub fn expunge(&mut self) -> (Tag, Vec<u8>) {
        self.command("EXPUNGE")
    }

    /// `LOGOUT`
    pub fn logout(&mut self) -> (Tag, Vec<u8>) {
        self.command("LOGOUT")
    }
}

/// Render a quoted string, escaping backslash and double quote.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Render compressed ranges as an IMAP sequence set, e.g. `17,19:21`.
fn format_sequence_set(set: &[(u32, u32)]) -> String {
    let mut out = String::new();
    for (i, (lo, hi)) in set.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if lo == hi {
            out.push_str(&lo.to_string());
        } else {
            out.push_str(&format!("{}:{}", lo, hi));
        }
    }
    out
}
