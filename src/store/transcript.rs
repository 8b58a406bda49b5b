//! Append-only chat transcript log.
//!
//! One line per observed message. The file is an audit log, independent of
//! the in-memory context: when it grows past the byte ceiling it is trimmed
//! to the second half of its lines, but the in-memory history is untouched.

use crate::context::Turn;
use crate::error::Result;
use crate::{ChannelId, GuildId};
use anyhow::Context as _;
use chrono::Utc;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct TranscriptLog {
    path: PathBuf,
    max_bytes: u64,
    // Serializes append-then-trim sequences.
    write_lock: Mutex<()>,
}

impl TranscriptLog {
    pub fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self { path, max_bytes, write_lock: Mutex::new(()) }
    }

    /// Append one message line and trim the file if it grew past the ceiling.
    pub fn append(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        author: &str,
        content: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().expect("transcript lock poisoned");

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{timestamp}] {guild_id}:{channel_id}:{author}: {content}\n");

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))
            .map_err(crate::Error::Other)?;
        file.write_all(line.as_bytes())
            .context("failed to append transcript line")
            .map_err(crate::Error::Other)?;

        let size = file
            .metadata()
            .context("failed to stat transcript")
            .map_err(crate::Error::Other)?
            .len();
        if size > self.max_bytes {
            drop(file);
            self.trim()?;
        }
        Ok(())
    }

    /// Keep only the lines from the midpoint onward (by line count).
    fn trim(&self) -> Result<()> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))
            .map_err(crate::Error::Other)?;
        let lines: Vec<&str> = raw.lines().collect();
        let kept = &lines[lines.len() / 2..];

        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        std::fs::write(&self.path, out)
            .with_context(|| format!("failed to rewrite {}", self.path.display()))
            .map_err(crate::Error::Other)?;
        tracing::info!(
            kept = kept.len(),
            dropped = lines.len() - kept.len(),
            "trimmed chat transcript"
        );
        Ok(())
    }

    /// Parse the transcript into per-channel user turns to seed the context
    /// store. Unparseable lines are skipped with a log entry.
    pub fn load_histories(&self) -> HashMap<ChannelId, Vec<Turn>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::info!(path = %self.path.display(), "no transcript file, starting empty");
                return HashMap::new();
            }
        };

        let mut histories: HashMap<ChannelId, Vec<Turn>> = HashMap::new();
        for line in raw.lines() {
            match parse_line(line) {
                Some((_, channel_id, _, content)) => {
                    histories
                        .entry(channel_id)
                        .or_default()
                        .push(Turn::user(content));
                }
                None => tracing::warn!(line, "skipping unparseable transcript line"),
            }
        }
        histories
    }
}

/// Split a `[ts] guild:channel:author: content` line into its fields.
fn parse_line(line: &str) -> Option<(GuildId, ChannelId, &str, &str)> {
    let (_, rest) = line.split_once("] ")?;
    let mut parts = rest.splitn(4, ':');
    let guild_id = parts.next()?.parse().ok()?;
    let channel_id = parts.next()?.parse().ok()?;
    let author = parts.next()?;
    let content = parts.next()?.trim_start();
    Some((guild_id, channel_id, author, content))
}
