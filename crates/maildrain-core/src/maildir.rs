//! Maildir delivery
//!
//! Two-step Maildir delivery: message bytes stream into an exclusively
//! created file under `tmp/`, and only a closed, fully written file is
//! renamed into `new/` or (with an info suffix) `cur/`. A crash can leave
//! orphans in `tmp/` but never a partial message in `new/` or `cur/`.

use maildrain_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// A Maildir root with its `tmp/`, `new/` and `cur/` subdirectories
#[derive(Debug)]
pub struct Maildir {
    root: PathBuf,
    hostname: String,
    seq: u64,
}

impl Maildir {
    /// Open a Maildir root, creating the three subdirectories as needed.
    pub fn create(root: &Path, hostname: &str) -> Result<Self> {
        for sub in ["tmp", "new", "cur"] {
            std::fs::create_dir_all(root.join(sub)).map_err(|e| {
                Error::Storage(format!(
                    "Failed to create maildir directory {}/{}: {}",
                    root.display(),
                    sub,
                    e
                ))
            })?;
        }

        debug!(root = %root.display(), "Opened maildir");

        Ok(Self {
            root: root.to_path_buf(),
            hostname: hostname.to_string(),
            seq: 0,
        })
    }

    /// Generate a unique delivery name: `<secs>.P<pid>.<host>[.<seq>]`.
    ///
    /// Uniqueness is enforced by exclusive create; on a collision the
    /// monotonic sequence suffix is bumped and the name retried.
    fn next_name(&mut self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let pid = std::process::id();

        let name = if self.seq == 0 {
            format!("{}.P{}.{}", secs, pid, self.hostname)
        } else {
            format!("{}.P{}.{}.{}", secs, pid, self.hostname, self.seq)
        };
        self.seq += 1;
        name
    }

    /// Create a fresh, exclusively opened file in `tmp/` to stream one
    /// message into.
    pub fn create_tmp(&mut self) -> Result<TmpFile> {
        loop {
            let name = self.next_name();
            let path = self.root.join("tmp").join(&name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!(name = %name, "Created maildir tmp file");
                    return Ok(TmpFile {
                        file: Some(file),
                        root: self.root.clone(),
                        name,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(Error::Storage(format!(
                        "Failed to create {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
    }
}

/// An open message file under `tmp/`, to be delivered exactly once
#[derive(Debug)]
pub struct TmpFile {
    file: Option<File>,
    root: PathBuf,
    name: String,
}

impl TmpFile {
    /// Append a chunk of message bytes.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Storage("Write after maildir delivery".to_string()))?;
        file.write_all(chunk)
            .map_err(|e| Error::Storage(format!("Failed to write message body: {}", e)))?;
        Ok(())
    }

    /// Deliver an unflagged message: close, then rename into `new/`.
    pub fn deliver_to_new(mut self) -> Result<PathBuf> {
        self.close()?;
        let dest = self.root.join("new").join(&self.name);
        self.rename(&dest)?;
        Ok(dest)
    }

    /// Deliver a flagged message: close, then rename into `cur/` with the
    /// `:2,<flags>` info suffix, flags deduplicated and sorted ascending.
    pub fn deliver_to_cur(mut self, flags: &[char]) -> Result<PathBuf> {
        self.close()?;
        let mut sorted: Vec<char> = flags.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let suffix: String = sorted.into_iter().collect();
        let dest = self
            .root
            .join("cur")
            .join(format!("{}:2,{}", self.name, suffix));
        self.rename(&dest)?;
        Ok(dest)
    }

    fn close(&mut self) -> Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::Storage("Maildir file delivered twice".to_string()))?;
        file.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to flush message body: {}", e)))?;
        drop(file);
        Ok(())
    }

    fn rename(&self, dest: &Path) -> Result<()> {
        let src = self.root.join("tmp").join(&self.name);
        std::fs::rename(&src, dest).map_err(|e| {
            Error::Storage(format!(
                "Failed to deliver {} to {}: {}",
                src.display(),
                dest.display(),
                e
            ))
        })?;
        debug!(dest = %dest.display(), "Delivered message");
        Ok(())
    }
}
