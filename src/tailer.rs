//! Incremental tailing of rollout logs.
//!
//! The tailer polls the log root on a fixed interval rather than subscribing
//! to filesystem events: every decision below depends on explicit byte-offset
//! bookkeeping, which polling keeps simple and portable.
//!
//! A file seen for the first time is not replayed from the beginning. Only a
//! bounded window at its end is read ("hydration"), enough to recover the
//! session's current state, after which the cursor sits at end-of-file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::codec::{self, ActivityEvent};
use crate::config::{self, Config};
use crate::registry::{Activity, SessionRegistry};

/// Tuning for a [`LogTailer`].
#[derive(Debug, Clone)]
pub struct TailSettings {
    /// Idle timeout attached to every working-marking event.
    pub idle_timeout: Duration,
    /// Files last modified longer ago than this are ignored on discovery.
    pub liveness_window: Duration,
    /// Byte cap of the hydration window.
    pub hydrate_max_bytes: u64,
    /// Line cap of the hydration window; the most recent lines are kept.
    pub hydrate_max_lines: usize,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(config::DEFAULT_IDLE_TIMEOUT_MS),
            liveness_window: Duration::from_millis(config::DEFAULT_SESSION_TIMEOUT_MS),
            hydrate_max_bytes: config::DEFAULT_HYDRATE_MAX_BYTES,
            hydrate_max_lines: config::DEFAULT_HYDRATE_MAX_LINES,
        }
    }
}

impl From<&Config> for TailSettings {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            liveness_window: config.session_timeout(),
            hydrate_max_bytes: config.hydrate_max_bytes,
            hydrate_max_lines: config.hydrate_max_lines,
        }
    }
}

/// Read position within one log file.
#[derive(Debug, Clone)]
pub struct FileCursor {
    pub path: PathBuf,
    /// Next unread byte.
    pub offset: u64,
    /// Bytes after the last newline, waiting for the rest of their line.
    pub pending: Vec<u8>,
    /// Derived from the file name until the content declares otherwise.
    pub session_id: String,
}

impl FileCursor {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            offset: 0,
            pending: Vec::new(),
            session_id: codec::session_id_from_path(path),
        }
    }

    /// Append `chunk` to the pending bytes and take every complete,
    /// non-blank line. A trailing partial line stays pending.
    fn take_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        split_lines(&complete)
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Polls a directory tree of rollout logs and feeds new lines to the
/// registry.
pub struct LogTailer {
    root: PathBuf,
    registry: SessionRegistry,
    settings: TailSettings,
    cursors: HashMap<PathBuf, FileCursor>,
    root_missing: bool,
}

impl LogTailer {
    pub fn new(root: impl Into<PathBuf>, registry: SessionRegistry, settings: TailSettings) -> Self {
        Self {
            root: root.into(),
            registry,
            settings,
            cursors: HashMap::new(),
            root_missing: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cursor(&self, path: &Path) -> Option<&FileCursor> {
        self.cursors.get(path)
    }

    pub fn tracked_files(&self) -> usize {
        self.cursors.len()
    }

    /// One polling pass over the log root.
    pub fn scan(&mut self) {
        if !self.root.is_dir() {
            if !self.root_missing {
                tracing::info!(path = %self.root.display(), "waiting for codex sessions directory");
                self.root_missing = true;
            }
            return;
        }
        if self.root_missing {
            tracing::info!(path = %self.root.display(), "codex sessions directory available");
            self.root_missing = false;
        }

        let now = SystemTime::now();
        for path in list_rollout_files(&self.root) {
            let result = if self.cursors.contains_key(&path) {
                self.read_appended(&path)
            } else {
                self.discover(&path, now)
            };
            if let Err(e) = result {
                tracing::debug!(path = %path.display(), error = %e, "skipping log file this cycle");
            }
        }
    }

    /// First sighting of `path`: hydrate from its tail if it is recent.
    fn discover(&mut self, path: &Path, now: SystemTime) -> anyhow::Result<()> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?;
        let modified = metadata
            .modified()
            .with_context(|| format!("mtime {}", path.display()))?;
        if !is_recent(modified, now, self.settings.liveness_window) {
            return Ok(());
        }

        let mut cursor = FileCursor::new(path);
        let (lines, offset) = read_tail(
            path,
            self.settings.hydrate_max_bytes,
            self.settings.hydrate_max_lines,
            &mut cursor.pending,
        )?;
        cursor.offset = offset;
        tracing::debug!(
            path = %path.display(),
            session_id = %cursor.session_id,
            lines = lines.len(),
            "hydrating newly discovered log file"
        );
        for line in &lines {
            self.apply_line(&mut cursor, line);
        }
        self.cursors.insert(path.to_path_buf(), cursor);
        Ok(())
    }

    /// Known file: read whatever was appended since the last pass.
    fn read_appended(&mut self, path: &Path) -> anyhow::Result<()> {
        let Some(mut cursor) = self.cursors.remove(path) else {
            return Ok(());
        };
        let result = read_chunk(&mut cursor);
        let lines = match result {
            Ok(chunk) => cursor.take_lines(&chunk),
            Err(e) => {
                self.cursors.insert(path.to_path_buf(), cursor);
                return Err(e);
            }
        };
        for line in &lines {
            self.apply_line(&mut cursor, line);
        }
        self.cursors.insert(path.to_path_buf(), cursor);
        Ok(())
    }

    fn apply_line(&self, cursor: &mut FileCursor, line: &str) {
        let event = codec::parse_line(line, &cursor.session_id);
        self.apply_event(cursor, event);
    }

    fn apply_event(&self, cursor: &mut FileCursor, event: ActivityEvent) {
        let ActivityEvent {
            session_id,
            previous_session_id,
            cwd,
            mark_working,
            mark_idle,
        } = event;

        if let Some(previous) = previous_session_id {
            tracing::debug!(from = %previous, to = %session_id, "session renamed");
            cursor.session_id = session_id.clone();
            self.registry.remove_session(&previous);
        }

        self.registry.mark_seen(&session_id, cwd.as_deref());
        if mark_working {
            self.registry.handle_activity(Activity {
                session_id: session_id.clone(),
                cwd: cwd.clone(),
                idle_timeout: Some(self.settings.idle_timeout),
            });
        }
        if mark_idle {
            self.registry.set_idle(&session_id, cwd.as_deref());
        }
    }

    /// Scan every `interval` until `cancel` fires. The first scan runs
    /// immediately. Scans do blocking file I/O, so each one runs on the
    /// blocking pool.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tailer = self;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let scanned = tokio::task::spawn_blocking(move || {
                            tailer.scan();
                            tailer
                        });
                        tailer = match scanned.await {
                            Ok(tailer) => tailer,
                            Err(e) => {
                                tracing::error!(error = %e, "log tailer scan panicked");
                                break;
                            }
                        };
                    }
                }
            }
            tracing::debug!("log tailer stopped");
        })
    }
}

/// Every rollout log under `root`. Unreadable entries are skipped.
pub fn list_rollout_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && codec::is_rollout_file(entry.path()))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Whether a file modified at `modified` may still belong to a live session.
pub fn is_recent(modified: SystemTime, now: SystemTime, window: Duration) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age <= window,
        // Modified "in the future" (clock skew): treat as fresh.
        Err(_) => true,
    }
}

/// Read everything from `cursor.offset` to end-of-file, restarting from zero
/// when the file has shrunk below the offset.
fn read_chunk(cursor: &mut FileCursor) -> anyhow::Result<Vec<u8>> {
    let mut file = File::open(&cursor.path)
        .with_context(|| format!("open {}", cursor.path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("stat {}", cursor.path.display()))?
        .len();

    if size < cursor.offset {
        tracing::debug!(path = %cursor.path.display(), "log file truncated, rereading from start");
        cursor.offset = 0;
        cursor.pending.clear();
    }
    if size == cursor.offset {
        return Ok(Vec::new());
    }

    file.seek(SeekFrom::Start(cursor.offset))?;
    let mut buf = Vec::new();
    file.take(size - cursor.offset).read_to_end(&mut buf)?;
    cursor.offset += buf.len() as u64;
    Ok(buf)
}

/// Read the last `max_bytes` of `path` and return its most recent
/// `max_lines` complete lines plus the offset just past what was read.
///
/// A leading fragment cut by the window start is dropped; a trailing
/// fragment without a newline is left in `pending` for the next pass.
fn read_tail(
    path: &Path,
    max_bytes: u64,
    max_lines: usize,
    pending: &mut Vec<u8>,
) -> anyhow::Result<(Vec<String>, u64)> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let start = size.saturating_sub(max_bytes);
    // One byte of lookbehind tells whether `start` falls on a line boundary.
    let read_from = start.saturating_sub(1);

    file.seek(SeekFrom::Start(read_from))?;
    let mut window = Vec::new();
    file.take(size - read_from).read_to_end(&mut window)?;
    let end = read_from + window.len() as u64;

    let mut body: &[u8] = &window;
    if start > 0 {
        body = match body.iter().position(|b| *b == b'\n') {
            Some(first_newline) => &body[first_newline + 1..],
            None => &[],
        };
    }

    let (complete, fragment) = match body.iter().rposition(|b| *b == b'\n') {
        Some(last_newline) => body.split_at(last_newline + 1),
        None => (&[][..], body),
    };
    pending.clear();
    pending.extend_from_slice(fragment);

    let mut lines = split_lines(complete);
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    Ok((lines, end))
}
