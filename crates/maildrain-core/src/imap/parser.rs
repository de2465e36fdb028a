//! Incremental IMAP response parser
//!
//! Consumes server bytes as they arrive and drives a [`ResponseHandler`]
//! with typed events in on-wire order. Lines are CRLF-framed, except that
//! a segment ending in `{N}` announces an N-byte literal whose bytes are
//! streamed to the handler chunk by chunk — a message body is never
//! buffered in the parser, no matter its size.

use crate::imap::response::{Capability, Flag, Status};
use maildrain_common::{Error, Result};
use tracing::{debug, trace};

/// Upper bound for a single response line (literal bytes excluded).
const MAX_LINE: usize = 64 * 1024;

/// Callback surface the parser drives.
///
/// Streaming callbacks are fallible so a delivery failure on disk aborts
/// the feed; pure notifications are not.
pub trait ResponseHandler {
    /// An `OK [CAPABILITY ...]` response code is opening; the previously
    /// advertised capability set is stale.
    fn capability_code_begin(&mut self) {}
    /// One capability token, from a response code or a CAPABILITY response.
    fn capability(&mut self, _cap: Capability) {}
    /// `* <n> EXISTS`
    fn exists(&mut self, _n: u32) {}
    /// `* <n> RECENT`
    fn recent(&mut self, _n: u32) {}
    /// `* <seq> EXPUNGE`
    fn expunged(&mut self, _seq: u32) {}
    /// `UIDVALIDITY` response code
    fn uidvalidity(&mut self, _n: u32) {}
    /// `* <seq> FETCH (` — a fetch response opens
    fn fetch_begin(&mut self, _seq: u32) {}
    /// The fetch response's closing parenthesis
    fn fetch_end(&mut self) {}
    /// One flag from a FLAGS item
    fn flag(&mut self, _flag: Flag) {}
    /// UID item
    fn uid(&mut self, _uid: u32) {}
    /// The section spec of a BODY[...] item was empty, i.e. this item
    /// carries the full message body.
    fn section_empty(&mut self) {}
    /// A BODY[...] value is about to stream.
    fn body_section_begin(&mut self) -> Result<()> {
        Ok(())
    }
    /// A chunk of the current BODY[...] value.
    fn body_bytes(&mut self, _chunk: &[u8]) -> Result<()> {
        Ok(())
    }
    /// The current BODY[...] value is complete.
    fn body_section_end(&mut self) -> Result<()> {
        Ok(())
    }
    /// Tagged completion. `text` is everything after the status atom.
    fn tagged_status(&mut self, tag: &str, status: Status, text: &str) -> Result<()>;
    /// `* BYE`
    fn bye(&mut self, _text: &str) {}
    /// `+ ...` command continuation request
    fn continuation(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiteralKind {
    /// Value of a BODY[...] item; streams through the body callbacks.
    BodySection,
    /// Value of an item the client does not care about; dropped.
    Discard,
}

#[derive(Debug)]
enum Mode {
    Line,
    Literal { remaining: usize, kind: LiteralKind },
}

/// Incremental response parser; one per connection.
#[derive(Debug)]
pub struct ResponseParser {
    line: Vec<u8>,
    mode: Mode,
    in_fetch: bool,
    responses: u64,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            mode: Mode::Line,
            in_fetch: false,
            responses: 0,
        }
    }

    /// Number of complete responses consumed so far. The session uses this
    /// to end the greeting wait as soon as the server has said anything.
    pub fn completed_responses(&self) -> u64 {
        self.responses
    }

    /// Consume a chunk of bytes from the wire.
    pub fn feed<H: ResponseHandler>(&mut self, mut data: &[u8], h: &mut H) -> Result<()> {
        while !data.is_empty() {
            match self.mode {
                Mode::Literal {
                    ref mut remaining,
                    kind,
                } => {
                    let take = (*remaining).min(data.len());
                    if kind == LiteralKind::BodySection {
                        h.body_bytes(&data[..take])?;
                    }
                    *remaining -= take;
                    data = &data[take..];
                    if *remaining == 0 {
                        if kind == LiteralKind::BodySection {
                            h.body_section_end()?;
                        }
                        self.mode = Mode::Line;
                    }
                }
                Mode::Line => match data.iter().position(|&b| b == b'\n') {
                    None => {
                        self.line.extend_from_slice(data);
                        data = &[];
                        if self.line.len() > MAX_LINE {
                            return Err(Error::Protocol("Response line too long".to_string()));
                        }
                    }
                    Some(pos) => {
                        self.line.extend_from_slice(&data[..=pos]);
                        data = &data[pos + 1..];
                        let raw = std::mem::take(&mut self.line);
                        self.process_line(&raw, h)?;
                    }
                },
            }
        }
        Ok(())
    }

    fn process_line<H: ResponseHandler>(&mut self, raw: &[u8], h: &mut H) -> Result<()> {
        let mut text = String::from_utf8_lossy(raw).into_owned();
        while text.ends_with('\n') || text.ends_with('\r') {
            text.pop();
        }

        let (seg, literal) = split_literal(&text);
        trace!(segment = seg, literal = ?literal, "Parsing segment");

        if self.in_fetch {
            self.fetch_items(seg, literal, h)?;
        } else {
            self.response(seg, literal, h)?;
        }

        // a true line end outside any fetch response completes a response
        if literal.is_none() && !self.in_fetch && !seg.trim().is_empty() {
            self.responses += 1;
        }
        Ok(())
    }

    fn response<H: ResponseHandler>(
        &mut self,
        seg: &str,
        literal: Option<usize>,
        h: &mut H,
    ) -> Result<()> {
        let s = seg.trim_end();
        if s.is_empty() {
            return Ok(());
        }

        if let Some(rest) = s.strip_prefix("* ") {
            return self.untagged(rest, literal, h);
        }
        if s.starts_with('+') {
            h.continuation();
        } else {
            let (tag, tail) = split_word(s);
            let (st, rest) = split_word(tail);
            let status = Status::parse(st)
                .ok_or_else(|| Error::Protocol(format!("Unparsable response line: {}", s)))?;
            self.response_code(rest, h)?;
            h.tagged_status(tag, status, rest.trim())?;
        }

        if let Some(n) = literal {
            self.enter_literal(n, LiteralKind::Discard, h)?;
        }
        Ok(())
    }

    fn untagged<H: ResponseHandler>(
        &mut self,
        rest: &str,
        literal: Option<usize>,
        h: &mut H,
    ) -> Result<()> {
        let (word, tail) = split_word(rest);

        if let Ok(n) = word.parse::<u32>() {
            let (kw, tail) = split_word(tail);
            match kw.to_ascii_uppercase().as_str() {
                "EXISTS" => h.exists(n),
                "RECENT" => h.recent(n),
                "EXPUNGE" => {
                    debug!(seq = n, "Message expunged");
                    h.expunged(n);
                }
                "FETCH" => {
                    h.fetch_begin(n);
                    self.in_fetch = true;
                    return self.fetch_items(tail, literal, h);
                }
                other => debug!("Ignoring untagged response: {} {}", n, other),
            }
        } else {
            match word.to_ascii_uppercase().as_str() {
                "CAPABILITY" => {
                    for tok in tail.split_whitespace() {
                        h.capability(Capability::parse(tok));
                    }
                }
                "OK" | "NO" | "BAD" | "PREAUTH" => self.response_code(tail, h)?,
                "BYE" => h.bye(tail.trim()),
                other => debug!("Ignoring untagged response: {}", other),
            }
        }

        if let Some(n) = literal {
            self.enter_literal(n, LiteralKind::Discard, h)?;
        }
        Ok(())
    }

    /// Parse an optional bracketed response code after a status atom.
    fn response_code<H: ResponseHandler>(&mut self, tail: &str, h: &mut H) -> Result<()> {
        let t = tail.trim_start();
        let Some(inner) = t.strip_prefix('[') else {
            return Ok(());
        };
        let Some(end) = inner.find(']') else {
            return Err(Error::Protocol(format!(
                "Unterminated response code: {}",
                tail
            )));
        };

        let code = &inner[..end];
        let (kw, args) = split_word(code);
        match kw.to_ascii_uppercase().as_str() {
            "CAPABILITY" => {
                h.capability_code_begin();
                for tok in args.split_whitespace() {
                    h.capability(Capability::parse(tok));
                }
            }
            "UIDVALIDITY" => h.uidvalidity(parse_u32(args.trim())?),
            // UIDNEXT, UNSEEN, PERMANENTFLAGS, READ-WRITE and friends carry
            // nothing this client acts on
            other => trace!("Ignoring response code: {}", other),
        }
        Ok(())
    }

    /// Parse fetch items from one segment. Called again for each segment of
    /// the same response after an interleaved literal.
    fn fetch_items<H: ResponseHandler>(
        &mut self,
        seg: &str,
        literal: Option<usize>,
        h: &mut H,
    ) -> Result<()> {
        let mut cur = seg;
        let mut literal_kind = LiteralKind::Discard;

        loop {
            cur = cur.trim_start();
            if cur.is_empty() {
                break;
            }
            if let Some(rest) = cur.strip_prefix('(') {
                cur = rest;
                continue;
            }
            if let Some(rest) = cur.strip_prefix(')') {
                self.in_fetch = false;
                h.fetch_end();
                cur = rest;
                continue;
            }

            let (atom, rest) = split_atom(cur);
            if atom.is_empty() {
                return Err(Error::Protocol(format!("Unparsable fetch item: {}", cur)));
            }

            if atom.eq_ignore_ascii_case("UID") {
                let (num, rest) = split_atom(rest.trim_start());
                h.uid(parse_u32(num)?);
                cur = rest;
            } else if atom.eq_ignore_ascii_case("FLAGS") {
                let value = rest.trim_start();
                let Some(inner) = value.strip_prefix('(') else {
                    return Err(Error::Protocol(format!("Unparsable flag list: {}", value)));
                };
                let Some(end) = inner.find(')') else {
                    return Err(Error::Protocol(format!("Unterminated flag list: {}", value)));
                };
                for tok in inner[..end].split_whitespace() {
                    h.flag(Flag::parse(tok));
                }
                cur = &inner[end + 1..];
            } else if atom.eq_ignore_ascii_case("BODY") && rest.starts_with('[') {
                let Some(close) = rest.find(']') else {
                    return Err(Error::Protocol(format!(
                        "Unterminated body section: {}",
                        rest
                    )));
                };
                if rest[1..close].trim().is_empty() {
                    h.section_empty();
                }
                let mut after = &rest[close + 1..];
                if let Some(origin) = after.strip_prefix('<') {
                    let Some(gt) = origin.find('>') else {
                        return Err(Error::Protocol(format!(
                            "Unterminated partial origin: {}",
                            after
                        )));
                    };
                    after = &origin[gt + 1..];
                }

                let value = after.trim_start();
                if value.is_empty() {
                    // the announced literal is this section's value
                    if literal.is_some() {
                        literal_kind = LiteralKind::BodySection;
                    }
                    cur = value;
                } else if value.starts_with('"') {
                    let (content, rest) = parse_quoted(value)?;
                    h.body_section_begin()?;
                    h.body_bytes(content.as_bytes())?;
                    h.body_section_end()?;
                    cur = rest;
                } else if has_nil_prefix(value) {
                    debug!("Body section is NIL");
                    cur = &value[3..];
                } else {
                    return Err(Error::Protocol(format!(
                        "Unexpected body section value: {}",
                        value
                    )));
                }
            } else {
                // an item the client never asked for; skip its value
                let value = rest.trim_start();
                if value.is_empty() {
                    cur = value;
                } else if value.starts_with('(') {
                    cur = skip_parenthesized(value);
                } else if value.starts_with('"') {
                    let (_, rest) = parse_quoted(value)?;
                    cur = rest;
                } else {
                    let (_, rest) = split_atom(value);
                    cur = rest;
                }
            }
        }

        if let Some(n) = literal {
            self.enter_literal(n, literal_kind, h)?;
        }
        Ok(())
    }

    fn enter_literal<H: ResponseHandler>(
        &mut self,
        n: usize,
        kind: LiteralKind,
        h: &mut H,
    ) -> Result<()> {
        if kind == LiteralKind::BodySection {
            h.body_section_begin()?;
        }
        if n == 0 {
            if kind == LiteralKind::BodySection {
                h.body_section_end()?;
            }
            return Ok(());
        }
        self.mode = Mode::Literal { remaining: n, kind };
        Ok(())
    }
}

/// Split a trailing `{N}` (or `{N+}`) literal announcement off a line.
fn split_literal(s: &str) -> (&str, Option<usize>) {
    if let Some(body) = s.strip_suffix('}') {
        if let Some(brace) = body.rfind('{') {
            let digits = body[brace + 1..].trim_end_matches('+');
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = digits.parse::<usize>() {
                    return (&s[..brace], Some(n));
                }
            }
        }
    }
    (s, None)
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(' ') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

/// Read one atom, stopping at whitespace or a list/section delimiter.
fn split_atom(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| c == ' ' || c == '[' || c == '(' || c == ')')
        .unwrap_or(s.len());
    (&s[..end], &s[end..])
}

fn parse_u32(s: &str) -> Result<u32> {
    s.parse()
        .map_err(|_| Error::Protocol(format!("Expected number, got: {}", s)))
}

fn has_nil_prefix(s: &str) -> bool {
    s.len() >= 3 && s[..3].eq_ignore_ascii_case("NIL")
}

/// Parse a quoted string starting at `s[0] == '"'`, handling escapes.
fn parse_quoted(s: &str) -> Result<(String, &str)> {
    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Ok((out, &s[i + 1..]));
        } else {
            out.push(c);
        }
    }
    Err(Error::Protocol(format!("Unterminated quoted string: {}", s)))
}

/// Skip a balanced parenthesized value, honoring quoted strings inside.
fn skip_parenthesized(s: &str) -> &str {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
        } else {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return &s[i + 1..];
                    }
                }
                '"' => in_quote = true,
                _ => {}
            }
        }
    }
    ""
}
