//! IMAP session state machine
//!
//! Drives one mailbox drain from greeting to shutdown. The session owns
//! the transport, the response parser and the protocol state; progress is
//! made exclusively from transport completions, timer fires and signal
//! deliveries multiplexed on one task. Commands go out strictly one at a
//! time: the next command is issued only once the tagged OK closing the
//! previous one has been consumed.

use crate::imap::command::CommandWriter;
use crate::imap::parser::{ResponseHandler, ResponseParser};
use crate::imap::response::{Capability, Flag, Status};
use crate::maildir::{Maildir, TmpFile};
use crate::transport::Transport;
use crate::uidset::UidSet;
use maildrain_common::config::Config;
use maildrain_common::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Instant;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, trace};

/// Session protocol state.
///
/// Progression over a successful run is strictly monotone; FETCHING and
/// LOGGING_OUT are in-flight states replaced by the next stable state when
/// the pending command's tagged OK arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Disconnected,
    Established,
    GotInitialCapabilities,
    LoggedIn,
    GotCapabilities,
    SelectedMailbox,
    Fetching,
    Fetched,
    Stored,
    Expunged,
    LoggingOut,
    LoggedOut,
    End,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Disconnected => "DISCONNECTED",
            State::Established => "ESTABLISHED",
            State::GotInitialCapabilities => "GOT_INITIAL_CAPABILITIES",
            State::LoggedIn => "LOGGED_IN",
            State::GotCapabilities => "GOT_CAPABILITIES",
            State::SelectedMailbox => "SELECTED_MAILBOX",
            State::Fetching => "FETCHING",
            State::Fetched => "FETCHED",
            State::Stored => "STORED",
            State::Expunged => "EXPUNGED",
            State::LoggingOut => "LOGGING_OUT",
            State::LoggedOut => "LOGGED_OUT",
            State::End => "END",
        };
        write!(f, "{}", s)
    }
}

/// Cap for the in-memory sink that absorbs non-body literals (header
/// subsets); full bodies stream to disk and never touch it.
const MAX_MEMORY_SINK: usize = 256 * 1024;

/// Protocol state machine and parser callback target.
///
/// Pure with respect to the network: commands are queued into `out` and
/// the run loop flushes them, so the machine can be driven directly in
/// tests.
struct Machine {
    config: Config,
    state: State,
    writer: CommandWriter,
    tag_to_state: HashMap<String, State>,
    capabilities: HashSet<Capability>,
    exists: u32,
    recent: u32,
    uidvalidity: u32,
    uids: UidSet,
    maildir: Maildir,
    delivery: Option<TmpFile>,
    memory_sink: Vec<u8>,
    flags: Vec<char>,
    full_body: bool,
    fetched_messages: u64,
    out: VecDeque<Vec<u8>>,
    quit: bool,
    prelogin_done: bool,
    fetch_started: Option<Instant>,
    fetch_bytes_start: u64,
    bytes_read: u64,
}

impl Machine {
    fn new(config: Config, maildir: Maildir) -> Self {
        Self {
            config,
            state: State::Established,
            writer: CommandWriter::new(),
            tag_to_state: HashMap::new(),
            capabilities: HashSet::new(),
            exists: 0,
            recent: 0,
            uidvalidity: 0,
            uids: UidSet::new(),
            maildir,
            delivery: None,
            memory_sink: Vec::new(),
            flags: Vec::new(),
            full_body: false,
            fetched_messages: 0,
            out: VecDeque::new(),
            quit: false,
            prelogin_done: false,
            fetch_started: None,
            fetch_bytes_start: 0,
            bytes_read: 0,
        }
    }

    fn state(&self) -> State {
        self.state
    }

    fn wants_quit(&self) -> bool {
        self.quit
    }

    fn is_fetching(&self) -> bool {
        self.state == State::Fetching
    }

    fn prelogin_done(&self) -> bool {
        self.prelogin_done
    }

    fn request_quit(&mut self) {
        self.quit = true;
    }

    fn take_output(&mut self) -> Option<Vec<u8>> {
        self.out.pop_front()
    }

    fn push(&mut self, buf: Vec<u8>) {
        self.out.push_back(buf);
    }

    fn note_bytes_read(&mut self, total: u64) {
        self.bytes_read = total;
    }

    /// The greeting wait is over, either because the timer elapsed or
    /// because the server has already said something. Capability discovery
    /// proceeds unconditionally from here.
    fn greeting_ready(&mut self) -> Result<()> {
        if self.prelogin_done || self.state != State::Established {
            return Ok(());
        }
        self.prelogin_done = true;
        debug!("Greeting wait over");
        self.do_capabilities()
    }

    /// Issue the next command for the state just entered.
    fn command(&mut self) -> Result<()> {
        match self.state {
            State::Disconnected | State::Established | State::End => Ok(()),
            State::GotInitialCapabilities => self.do_login(),
            State::LoggedIn => self.do_capabilities(),
            State::GotCapabilities => self.do_select(),
            State::SelectedMailbox => self.do_fetch_or_logout(),
            // in-flight states never re-enter the dispatcher
            State::Fetching | State::LoggingOut => Ok(()),
            State::Fetched => {
                self.stop_fetch_stats();
                self.do_store_or_logout()
            }
            State::Stored => self.do_uid_or_simple_expunge(),
            State::Expunged => self.do_logout(),
            State::LoggedOut => {
                self.quit = true;
                Ok(())
            }
        }
    }

    /// The state capability discovery lands in, from the state it starts in.
    fn post_capability_state(&self) -> State {
        match self.state {
            State::Established => State::GotInitialCapabilities,
            State::LoggedIn => State::GotCapabilities,
            s => s,
        }
    }

    fn do_capabilities(&mut self) -> Result<()> {
        if !self.capabilities.is_empty() {
            // the server already volunteered them in a response code
            let next = self.post_capability_state();
            debug!("Switch from state {} to {}", self.state, next);
            self.state = next;
            return self.command();
        }
        let (tag, buf) = self.writer.capability();
        self.tag_to_state.insert(tag.clone(), self.post_capability_state());
        info!("Getting CAPABILITIES ... [{}]", tag);
        self.push(buf);
        Ok(())
    }

    fn do_login(&mut self) -> Result<()> {
        if self.capabilities.contains(&Capability::LoginDisabled) {
            return Err(Error::Protocol(
                "Cannot login because server has LOGINDISABLED".to_string(),
            ));
        }
        debug!("Clearing capabilities");
        self.capabilities.clear();
        self.exists = 0;
        self.recent = 0;
        self.uidvalidity = 0;
        self.uids.clear();

        let (tag, buf) = self
            .writer
            .login(&self.config.account.username, &self.config.account.password);
        self.tag_to_state.insert(tag.clone(), State::LoggedIn);
        info!("Logging in as |{}| [{}]", self.config.account.username, tag);
        self.push(buf);
        Ok(())
    }

    fn do_select(&mut self) -> Result<()> {
        let (tag, buf) = self.writer.select(&self.config.account.mailbox);
        self.tag_to_state.insert(tag.clone(), State::SelectedMailbox);
        info!(
            "Selecting mailbox: |{}| [{}]",
            self.config.account.mailbox, tag
        );
        self.push(buf);
        Ok(())
    }

    fn do_fetch_or_logout(&mut self) -> Result<()> {
        debug!(
            "Selected mailbox: exists={} recent={} uidvalidity={}",
            self.exists, self.recent, self.uidvalidity
        );
        if self.exists > 0 {
            self.do_fetch()
        } else {
            info!("Mailbox {} is empty.", self.config.account.mailbox);
            self.do_logout()
        }
    }

    fn do_fetch(&mut self) -> Result<()> {
        let (tag, buf) = self.writer.fetch_all();
        self.tag_to_state.insert(tag.clone(), State::Fetched);
        info!(
            "Fetching into {} ... [{}]",
            self.config.maildir.path.display(),
            tag
        );
        self.state = State::Fetching;
        self.start_fetch_stats();
        self.push(buf);
        Ok(())
    }

    fn do_store_or_logout(&mut self) -> Result<()> {
        if self.config.session.delete {
            self.do_store()
        } else {
            self.do_logout()
        }
    }

    fn do_store(&mut self) -> Result<()> {
        let set = self.uids.ranges();
        let (tag, buf) = self.writer.uid_store_deleted(&set);
        self.tag_to_state.insert(tag.clone(), State::Stored);
        info!("Storing DELETED flags ... [{}]", tag);
        self.push(buf);
        Ok(())
    }

    fn has_uidplus(&self) -> bool {
        let has = self.capabilities.contains(&Capability::UidPlus);
        debug!("Has UIDPLUS capability: {}", has);
        has
    }

    fn do_uid_or_simple_expunge(&mut self) -> Result<()> {
        if self.has_uidplus() {
            self.do_uid_expunge()
        } else {
            self.do_expunge()
        }
    }

    fn do_uid_expunge(&mut self) -> Result<()> {
        let set = self.uids.ranges();
        let (tag, buf) = self.writer.uid_expunge(&set);
        self.tag_to_state.insert(tag.clone(), State::Expunged);
        info!("Expunging messages ... [{}]", tag);
        self.push(buf);
        Ok(())
    }

    fn do_expunge(&mut self) -> Result<()> {
        let (tag, buf) = self.writer.expunge();
        self.tag_to_state.insert(tag.clone(), State::Expunged);
        info!("Expunging messages (without UIDPLUS) ... [{}]", tag);
        self.push(buf);
        Ok(())
    }

    fn do_logout(&mut self) -> Result<()> {
        let (tag, buf) = self.writer.logout();
        self.tag_to_state.insert(tag.clone(), State::LoggedOut);
        info!("Logging out ... [{}]", tag);
        self.state = State::LoggingOut;
        self.push(buf);
        Ok(())
    }

    fn start_fetch_stats(&mut self) {
        self.fetch_started = Some(Instant::now());
        self.fetch_bytes_start = self.bytes_read;
    }

    fn log_fetch_stats(&self) {
        let Some(started) = self.fetch_started else {
            return;
        };
        let millis = started.elapsed().as_millis().max(1) as f64;
        let bytes = self.bytes_read.saturating_sub(self.fetch_bytes_start);
        let rate = (bytes as f64 / 1024.0) / (millis / 1000.0);
        info!(
            "Fetched {} messages ({} bytes) in {} s (@ {:.1} KiB/s)",
            self.fetched_messages,
            bytes,
            millis / 1000.0,
            rate
        );
    }

    fn stop_fetch_stats(&mut self) {
        self.log_fetch_stats();
        self.fetch_started = None;
    }
}

impl ResponseHandler for Machine {
    fn capability_code_begin(&mut self) {
        debug!("Clearing capabilities");
        self.capabilities.clear();
    }

    fn capability(&mut self, cap: Capability) {
        info!("Got capability: {}", cap);
        self.capabilities.insert(cap);
    }

    fn exists(&mut self, n: u32) {
        info!(
            "Mailbox {} contains {} messages",
            self.config.account.mailbox, n
        );
        self.exists = n;
    }

    fn recent(&mut self, n: u32) {
        info!(
            "Mailbox {} has {} RECENT messages",
            self.config.account.mailbox, n
        );
        self.recent = n;
    }

    fn uidvalidity(&mut self, n: u32) {
        info!("UIDVALIDITY: {}", n);
        self.uidvalidity = n;
    }

    fn fetch_begin(&mut self, seq: u32) {
        self.flags.clear();
        if self.state == State::Fetching {
            debug!("Fetching message: {}", seq);
        }
    }

    fn flag(&mut self, flag: Flag) {
        if let Some(c) = flag.maildir_char() {
            self.flags.push(c);
        }
    }

    fn uid(&mut self, uid: u32) {
        if self.state == State::Fetching {
            trace!("UID: {}", uid);
            self.uids.push(uid);
        }
    }

    fn section_empty(&mut self) {
        self.full_body = true;
    }

    fn body_section_begin(&mut self) -> Result<()> {
        if self.state == State::Fetching && self.full_body {
            self.delivery = Some(self.maildir.create_tmp()?);
        } else {
            self.memory_sink.clear();
        }
        Ok(())
    }

    fn body_bytes(&mut self, chunk: &[u8]) -> Result<()> {
        match self.delivery.as_mut() {
            Some(file) => file.write(chunk),
            None => {
                let room = MAX_MEMORY_SINK.saturating_sub(self.memory_sink.len());
                self.memory_sink
                    .extend_from_slice(&chunk[..chunk.len().min(room)]);
                Ok(())
            }
        }
    }

    fn body_section_end(&mut self) -> Result<()> {
        if self.state == State::Fetching && self.full_body {
            let file = self
                .delivery
                .take()
                .ok_or_else(|| Error::Storage("Body section ended without a file".to_string()))?;
            if self.flags.is_empty() {
                file.deliver_to_new()?;
            } else {
                debug!(
                    "Using maildir flags: {}",
                    self.flags.iter().collect::<String>()
                );
                file.deliver_to_cur(&self.flags)?;
            }
            self.full_body = false;
            self.fetched_messages += 1;
        }
        Ok(())
    }

    fn tagged_status(&mut self, tag: &str, status: Status, text: &str) -> Result<()> {
        info!("Got status {} for tag {}", status, tag);
        if status != Status::Ok {
            return Err(Error::Command(format!("{} - {}", status, text)));
        }
        let Some(next) = self.tag_to_state.remove(tag) else {
            return Err(Error::Protocol(format!("Got unknown tag: {}", tag)));
        };
        info!("Switch from state {} to {} [{}]", self.state, next, tag);
        self.state = next;
        debug_assert!(self.tag_to_state.is_empty());
        self.command()
    }

    fn bye(&mut self, text: &str) {
        debug!("Server closing connection: {}", text);
    }
}

/// One IMAP drain session, from connect to shutdown
pub struct Session {
    transport: Transport,
    parser: ResponseParser,
    machine: Machine,
    greeting_wait: Duration,
}

impl Session {
    /// Resolve, connect and shake hands; the protocol itself is driven by
    /// [`Session::run`].
    pub async fn connect(config: &Config) -> Result<Self> {
        let transport = Transport::establish(&config.account, &config.tls).await?;
        let maildir = Maildir::create(&config.maildir.path, &config.maildir.hostname)?;
        let greeting_wait = Duration::from_millis(config.session.greeting_wait_ms);
        Ok(Self {
            transport,
            parser: ResponseParser::new(),
            machine: Machine::new(config.clone(), maildir),
            greeting_wait,
        })
    }

    /// Drive the session to completion. Returns once the connection is
    /// shut down (Ok) or on the first fatal condition.
    pub async fn run(mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| Error::Other(anyhow::anyhow!("Failed to install SIGINT handler: {}", e)))?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            Error::Other(anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))
        })?;

        let greeting = sleep(self.greeting_wait);
        tokio::pin!(greeting);

        let mut stats = interval(Duration::from_secs(1));
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut was_fetching = false;

        let mut signaled = false;
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            while let Some(cmd) = self.machine.take_output() {
                self.transport.write_all(&cmd).await.map_err(Error::Io)?;
            }

            if self.machine.wants_quit() {
                break;
            }

            if self.machine.is_fetching() && !was_fetching {
                stats.reset();
            }
            was_fetching = self.machine.is_fetching();

            let greeting_pending = !self.machine.prelogin_done();

            tokio::select! {
                r = self.transport.read(&mut buf) => match r {
                    Ok(0) => {
                        if self.machine.state() == State::LoggedOut {
                            debug!("Connection closed by server after logout");
                            self.machine.request_quit();
                        } else {
                            return Err(Error::Connect(
                                "Connection closed by server".to_string(),
                            ));
                        }
                    }
                    Ok(n) => {
                        self.machine.note_bytes_read(self.transport.bytes_read());
                        self.parser.feed(&buf[..n], &mut self.machine)?;
                        if greeting_pending && self.parser.completed_responses() > 0 {
                            self.machine.greeting_ready()?;
                        }
                    }
                    Err(e) => {
                        if self.machine.state() == State::LoggedOut && benign_read_error(&e) {
                            debug!("Ignoring read error after logout: {}", e);
                            self.machine.request_quit();
                        } else {
                            return Err(Error::Io(e));
                        }
                    }
                },
                _ = &mut greeting, if greeting_pending => {
                    self.machine.greeting_ready()?;
                }
                _ = stats.tick(), if self.machine.is_fetching() => {
                    self.machine.note_bytes_read(self.transport.bytes_read());
                    self.machine.log_fetch_stats();
                }
                _ = sigint.recv() => {
                    note_signal(&mut signaled, "SIGINT")?;
                    self.machine.request_quit();
                }
                _ = sigterm.recv() => {
                    note_signal(&mut signaled, "SIGTERM")?;
                    self.machine.request_quit();
                }
            }
        }

        self.shutdown(&mut sigint, &mut sigterm, signaled).await
    }

    /// Orderly teardown: close_notify, swallow the shutdown races a
    /// half-closed TLS session produces, keep honoring the second-signal
    /// rule while it happens.
    async fn shutdown(
        mut self,
        sigint: &mut Signal,
        sigterm: &mut Signal,
        mut signaled: bool,
    ) -> Result<()> {
        debug!("Shutting down connection");
        let shutdown = self.transport.shutdown();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                r = &mut shutdown => {
                    match r {
                        Ok(()) => {}
                        Err(e) if benign_shutdown_error(&e) => {
                            debug!("Ignoring shutdown error: {}", e);
                        }
                        Err(e) => return Err(Error::Io(e)),
                    }
                    break;
                }
                _ = sigint.recv() => note_signal(&mut signaled, "SIGINT")?,
                _ = sigterm.recv() => note_signal(&mut signaled, "SIGTERM")?,
            }
        }
        debug!("Connection closed");
        Ok(())
    }
}

fn note_signal(signaled: &mut bool, name: &str) -> Result<()> {
    error!("Got signal: {}", name);
    if *signaled {
        return Err(Error::Signal(format!(
            "Got a signal ({}) the second time - immediate exit",
            name
        )));
    }
    *signaled = true;
    Ok(())
}

/// Read-side errors that a half-closed TLS session legitimately produces
/// once we are logged out.
fn benign_read_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
    )
}

/// Close_notify races: the peer may slam the connection after its BYE.
fn benign_shutdown_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use maildrain_common::config::{
        AccountConfig, LoggingConfig, MaildirConfig, SessionConfig, TlsConfig,
    };
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(delete: bool, maildir: &Path) -> Config {
        Config {
            account: AccountConfig {
                host: "imap.test".to_string(),
                port: 993,
                username: "joe".to_string(),
                password: "sesame".to_string(),
                mailbox: "INBOX".to_string(),
            },
            maildir: MaildirConfig {
                path: maildir.to_path_buf(),
                hostname: "testhost".to_string(),
            },
            tls: TlsConfig::default(),
            session: SessionConfig {
                greeting_wait_ms: 10,
                delete,
            },
            logging: LoggingConfig::default(),
        }
    }

    fn machine(delete: bool, root: &Path) -> Machine {
        let maildir = Maildir::create(root, "testhost").unwrap();
        Machine::new(test_config(delete, root), maildir)
    }

    /// Drain queued commands as strings.
    fn sent(m: &mut Machine) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(buf) = m.take_output() {
            out.push(String::from_utf8(buf).unwrap());
        }
        out
    }

    fn ok(m: &mut Machine, tag: &str) {
        m.tagged_status(tag, Status::Ok, "Completed").unwrap();
    }

    /// Walk a machine through greeting, login and capability re-query.
    /// Returns the commands sent so far.
    fn login_and_select(m: &mut Machine, caps: &[Capability], exists: u32) -> Vec<String> {
        let mut all = Vec::new();

        m.greeting_ready().unwrap();
        all.extend(sent(m)); // CAPABILITY
        m.capability(Capability::Imap4Rev1);
        ok(m, "a1");
        all.extend(sent(m)); // LOGIN
        ok(m, "a2");
        all.extend(sent(m)); // CAPABILITY (re-query after login)
        m.capability(Capability::Imap4Rev1);
        for cap in caps {
            m.capability(cap.clone());
        }
        ok(m, "a3");
        all.extend(sent(m)); // SELECT
        m.exists(exists);
        m.recent(0);
        m.uidvalidity(1);
        ok(m, "a4");
        all.extend(sent(m));
        all
    }

    fn deliver_message(m: &mut Machine, seq: u32, uid: u32, flags: &[Flag], body: &[u8]) {
        m.fetch_begin(seq);
        m.uid(uid);
        for f in flags {
            m.flag(f.clone());
        }
        // header subset section goes to the memory sink
        m.body_section_begin().unwrap();
        m.body_bytes(b"Subject: test\r\n").unwrap();
        m.body_section_end().unwrap();
        // full body streams to disk
        m.section_empty();
        m.body_section_begin().unwrap();
        m.body_bytes(body).unwrap();
        m.body_section_end().unwrap();
        m.fetch_end();
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_empty_mailbox_logs_out_without_fetch() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        let all = login_and_select(&mut m, &[], 0);
        ok(&mut m, "a5"); // LOGOUT completion

        let words: Vec<String> = all
            .iter()
            .map(|c| c.split_whitespace().nth(1).unwrap().to_string())
            .collect();
        assert_eq!(
            words,
            vec!["CAPABILITY", "LOGIN", "CAPABILITY", "SELECT", "LOGOUT"]
        );
        assert!(m.wants_quit());
        assert_eq!(m.fetched_messages, 0);
        assert!(entries(&tmp.path().join("new")).is_empty());
        assert!(entries(&tmp.path().join("cur")).is_empty());
    }

    #[test]
    fn test_two_message_fetch_keep() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        let mut all = login_and_select(&mut m, &[Capability::UidPlus], 2);
        assert_eq!(m.state(), State::Fetching);

        deliver_message(&mut m, 1, 17, &[], b"first body\r\n");
        deliver_message(&mut m, 2, 19, &[], b"second body\r\n");
        ok(&mut m, "a5"); // FETCH completion; delete=false goes to LOGOUT
        all.extend(sent(&mut m));
        ok(&mut m, "a6");

        let words: Vec<String> = all
            .iter()
            .map(|c| c.split_whitespace().nth(1).unwrap().to_string())
            .collect();
        assert_eq!(
            words,
            vec!["CAPABILITY", "LOGIN", "CAPABILITY", "SELECT", "FETCH", "LOGOUT"]
        );
        assert!(m.wants_quit());
        assert_eq!(m.fetched_messages, 2);
        assert_eq!(entries(&tmp.path().join("new")).len(), 2);
        assert!(entries(&tmp.path().join("cur")).is_empty());
        assert!(entries(&tmp.path().join("tmp")).is_empty());
        assert_eq!(m.uids.ranges(), vec![(17, 17), (19, 19)]);
    }

    #[test]
    fn test_delete_with_uidplus_full_command_sequence() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(true, tmp.path());

        let mut all = login_and_select(&mut m, &[Capability::UidPlus], 1);
        deliver_message(&mut m, 1, 42, &[Flag::Seen, Flag::Answered], b"hello\r\n");
        ok(&mut m, "a5"); // FETCH → STORE
        all.extend(sent(&mut m));
        ok(&mut m, "a6"); // STORE → UID EXPUNGE
        all.extend(sent(&mut m));
        ok(&mut m, "a7"); // EXPUNGE → LOGOUT
        all.extend(sent(&mut m));
        ok(&mut m, "a8");

        assert_eq!(
            all,
            vec![
                "a1 CAPABILITY\r\n",
                "a2 LOGIN \"joe\" \"sesame\"\r\n",
                "a3 CAPABILITY\r\n",
                "a4 SELECT \"INBOX\"\r\n",
                "a5 FETCH 1:* (UID FLAGS BODY.PEEK[HEADER.FIELDS (date from subject)] BODY.PEEK[])\r\n",
                "a6 UID STORE 42 +FLAGS.SILENT (\\Deleted)\r\n",
                "a7 UID EXPUNGE 42\r\n",
                "a8 LOGOUT\r\n",
            ]
        );
        assert!(m.wants_quit());

        // \Seen \Answered delivers into cur/ with sorted flags
        let cur = entries(&tmp.path().join("cur"));
        assert_eq!(cur.len(), 1);
        assert!(cur[0].ends_with(":2,RS"), "unexpected name {}", cur[0]);
        assert!(entries(&tmp.path().join("new")).is_empty());
    }

    #[test]
    fn test_delete_without_uidplus_uses_plain_expunge() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(true, tmp.path());

        let mut all = login_and_select(&mut m, &[], 1);
        deliver_message(&mut m, 1, 42, &[], b"hello\r\n");
        ok(&mut m, "a5");
        all.extend(sent(&mut m));
        ok(&mut m, "a6");
        all.extend(sent(&mut m));
        ok(&mut m, "a7");
        all.extend(sent(&mut m));
        ok(&mut m, "a8");

        let words: Vec<String> = all
            .iter()
            .map(|c| c.split_whitespace().nth(1).unwrap().to_string())
            .collect();
        assert_eq!(
            words,
            vec![
                "CAPABILITY",
                "LOGIN",
                "CAPABILITY",
                "SELECT",
                "FETCH",
                "UID",
                "EXPUNGE",
                "LOGOUT"
            ]
        );
        assert!(all[6].starts_with("a7 EXPUNGE"));
    }

    #[test]
    fn test_login_rejection_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        m.greeting_ready().unwrap();
        sent(&mut m);
        ok(&mut m, "a1"); // → LOGIN sent
        sent(&mut m);

        let err = m
            .tagged_status("a2", Status::No, "[AUTHENTICATIONFAILED] Invalid credentials")
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Command failed: NO - [AUTHENTICATIONFAILED] Invalid credentials"));
        assert!(sent(&mut m).is_empty());
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        m.greeting_ready().unwrap();
        sent(&mut m);
        let err = m.tagged_status("zz9", Status::Ok, "Completed").unwrap_err();
        assert!(err.to_string().contains("Got unknown tag: zz9"));
    }

    #[test]
    fn test_login_disabled_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        // greeting volunteered capabilities, including LOGINDISABLED; the
        // capability fast path goes straight to login and must refuse
        m.capability_code_begin();
        m.capability(Capability::Imap4Rev1);
        m.capability(Capability::LoginDisabled);
        let err = m.greeting_ready().unwrap_err();
        assert!(err.to_string().contains("LOGINDISABLED"));
        assert!(sent(&mut m).is_empty());
    }

    #[test]
    fn test_capability_fast_path_skips_command() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        m.capability_code_begin();
        m.capability(Capability::Imap4Rev1);
        m.greeting_ready().unwrap();

        // no CAPABILITY went out; the first command is LOGIN
        let cmds = sent(&mut m);
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].contains("LOGIN"));
        assert_eq!(m.state(), State::GotInitialCapabilities);
    }

    #[test]
    fn test_login_resets_mailbox_facts() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        m.exists(7);
        m.recent(3);
        m.uidvalidity(99);
        m.state = State::Fetching;
        m.uid(5);
        m.state = State::Established;

        m.capability(Capability::Imap4Rev1);
        m.greeting_ready().unwrap();
        sent(&mut m);

        assert_eq!(m.exists, 0);
        assert_eq!(m.recent, 0);
        assert_eq!(m.uidvalidity, 0);
        assert!(m.uids.is_empty());
        assert!(m.capabilities.is_empty());
    }

    #[test]
    fn test_tag_map_invariant() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        m.greeting_ready().unwrap();
        assert_eq!(m.tag_to_state.len(), 1);
        ok(&mut m, "a1");
        // the consumed tag is gone; the follow-up command registered its own
        assert_eq!(m.tag_to_state.len(), 1);
        assert!(m.tag_to_state.contains_key("a2"));
    }

    #[test]
    fn test_state_progression_is_monotone() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(true, tmp.path());
        let mut states = vec![m.state()];

        let observe = |m: &Machine, states: &mut Vec<State>| {
            if states.last() != Some(&m.state()) {
                states.push(m.state());
            }
        };

        m.greeting_ready().unwrap();
        sent(&mut m);
        ok(&mut m, "a1");
        observe(&m, &mut states);
        sent(&mut m);
        ok(&mut m, "a2");
        observe(&m, &mut states);
        sent(&mut m);
        m.capability(Capability::UidPlus);
        ok(&mut m, "a3");
        observe(&m, &mut states);
        sent(&mut m);
        m.exists(1);
        ok(&mut m, "a4");
        observe(&m, &mut states);
        sent(&mut m);
        deliver_message(&mut m, 1, 8, &[], b"x");
        ok(&mut m, "a5");
        observe(&m, &mut states);
        sent(&mut m);
        ok(&mut m, "a6");
        observe(&m, &mut states);
        sent(&mut m);
        ok(&mut m, "a7");
        observe(&m, &mut states);
        sent(&mut m);
        ok(&mut m, "a8");
        observe(&m, &mut states);

        for pair in states.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert_eq!(*states.last().unwrap(), State::LoggedOut);
    }

    #[test]
    fn test_fetch_stats_counters() {
        let tmp = TempDir::new().unwrap();
        let mut m = machine(false, tmp.path());

        m.note_bytes_read(100);
        login_and_select(&mut m, &[], 1);
        assert_eq!(m.fetch_bytes_start, 100);

        m.note_bytes_read(4196);
        deliver_message(&mut m, 1, 3, &[], b"body");
        ok(&mut m, "a5"); // leaves FETCHING, logs the final stats line
        assert!(m.fetch_started.is_none());
        assert_eq!(m.fetched_messages, 1);
    }

    #[test]
    fn test_second_signal_errors() {
        let mut signaled = false;
        note_signal(&mut signaled, "SIGINT").unwrap();
        let err = note_signal(&mut signaled, "SIGINT").unwrap_err();
        assert!(err.to_string().contains("second time - immediate exit"));
    }

    #[test]
    fn test_state_display_names() {
        assert_eq!(State::GotInitialCapabilities.to_string(), "GOT_INITIAL_CAPABILITIES");
        assert_eq!(State::LoggingOut.to_string(), "LOGGING_OUT");
        assert_eq!(State::SelectedMailbox.to_string(), "SELECTED_MAILBOX");
    }

    /// One scripted conversation over a real socket, exercising the whole
    /// reactor: greeting race, capability discovery, login, select, a
    /// fetch with interleaved literals, logout and shutdown.
    #[tokio::test]
    async fn test_full_drain_against_scripted_server() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let header = b"Subject: t\r\n".to_vec();
        let body = b"Subject: t\r\n\r\nhello\r\n".to_vec();
        let body_for_server = body.clone();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let (r, mut w) = sock.split();
            let mut lines = BufReader::new(r).lines();

            w.write_all(b"* OK maildrain test server ready\r\n")
                .await
                .unwrap();

            while let Some(line) = lines.next_line().await.unwrap() {
                let mut parts = line.split_whitespace();
                let tag = parts.next().unwrap().to_string();
                let cmd = parts.next().unwrap_or("").to_uppercase();
                match cmd.as_str() {
                    "CAPABILITY" => {
                        w.write_all(b"* CAPABILITY IMAP4rev1 UIDPLUS\r\n")
                            .await
                            .unwrap();
                        w.write_all(format!("{} OK Capability completed.\r\n", tag).as_bytes())
                            .await
                            .unwrap();
                    }
                    "LOGIN" => {
                        w.write_all(format!("{} OK Logged in.\r\n", tag).as_bytes())
                            .await
                            .unwrap();
                    }
                    "SELECT" => {
                        w.write_all(
                            b"* 1 EXISTS\r\n* 0 RECENT\r\n* OK [UIDVALIDITY 42] UIDs valid\r\n",
                        )
                        .await
                        .unwrap();
                        w.write_all(format!("{} OK [READ-WRITE] Selected.\r\n", tag).as_bytes())
                            .await
                            .unwrap();
                    }
                    "FETCH" => {
                        let mut resp = Vec::new();
                        resp.extend_from_slice(
                            format!(
                                "* 1 FETCH (UID 7 FLAGS () \
                                 BODY[HEADER.FIELDS (DATE FROM SUBJECT)] {{{}}}\r\n",
                                header.len()
                            )
                            .as_bytes(),
                        );
                        resp.extend_from_slice(&header);
                        resp.extend_from_slice(
                            format!(" BODY[] {{{}}}\r\n", body_for_server.len()).as_bytes(),
                        );
                        resp.extend_from_slice(&body_for_server);
                        resp.extend_from_slice(b")\r\n");
                        resp.extend_from_slice(
                            format!("{} OK Fetch completed.\r\n", tag).as_bytes(),
                        );
                        w.write_all(&resp).await.unwrap();
                    }
                    "LOGOUT" => {
                        w.write_all(b"* BYE Logging out\r\n").await.unwrap();
                        w.write_all(format!("{} OK Bye.\r\n", tag).as_bytes())
                            .await
                            .unwrap();
                        w.flush().await.unwrap();
                        return;
                    }
                    other => panic!("Unexpected command: {}", other),
                }
            }
        });

        let tmp = TempDir::new().unwrap();
        let mut config = test_config(false, tmp.path());
        config.account.host = "127.0.0.1".to_string();
        config.account.port = addr.port();
        config.tls.enabled = false;

        let session = Session::connect(&config).await.unwrap();
        session.run().await.unwrap();
        server.await.unwrap();

        let new = entries(&tmp.path().join("new"));
        assert_eq!(new.len(), 1);
        assert!(entries(&tmp.path().join("cur")).is_empty());
        assert!(entries(&tmp.path().join("tmp")).is_empty());
        assert_eq!(
            std::fs::read(tmp.path().join("new").join(&new[0])).unwrap(),
            body
        );
    }
}
