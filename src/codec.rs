//! Rollout log line decoding.
//!
//! Each line of a rollout log is an independent JSON record shaped like
//! `{"type": "<entry type>", "payload": {"type": "<inner type>", ...}}`.
//! Decoding is total: any line, including garbage, yields an
//! [`ActivityEvent`]. A line that cannot be understood simply carries no
//! signal.

use std::collections::VecDeque;
use std::path::Path;

use serde_json::Value;

/// Outer record type declaring the session identity.
const SESSION_META: &str = "session_meta";
/// Outer record type for conversation events.
const EVENT_MSG: &str = "event_msg";
/// Inner payload type for a message written by the user.
const USER_MESSAGE: &str = "user_message";
/// Inner payload type for a message written by the agent.
const AGENT_MESSAGE: &str = "agent_message";
/// Key holding the working directory, wherever it appears in the record.
const CWD_KEY: &str = "cwd";

/// Maximum nesting depth searched for the working directory.
pub const CWD_SEARCH_DEPTH: usize = 6;

/// Canonical file name of a rollout log that does not embed its session id.
const CANONICAL_NAME: &str = "rollout.jsonl";
const NAME_PREFIX: &str = "rollout-";
const NAME_SUFFIX: &str = ".jsonl";

/// What one log line says about its session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityEvent {
    /// Session the line belongs to (possibly a newly declared identity).
    pub session_id: String,
    /// Set when the line renamed the session; the old id is the same session.
    pub previous_session_id: Option<String>,
    pub cwd: Option<String>,
    pub mark_working: bool,
    pub mark_idle: bool,
}

impl ActivityEvent {
    fn passive(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }
}

/// Decode one log line for a file whose current session id is `session_id`.
pub fn parse_line(line: &str, session_id: &str) -> ActivityEvent {
    let record: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return ActivityEvent::passive(session_id),
    };
    let Some(fields) = record.as_object() else {
        return ActivityEvent::passive(session_id);
    };

    let entry_type = fields.get("type").and_then(Value::as_str);
    let payload = fields.get("payload").filter(|p| p.is_object());
    let inner_type = payload
        .and_then(|p| p.get("type"))
        .and_then(Value::as_str);

    let mut event = ActivityEvent::passive(session_id);

    if entry_type == Some(SESSION_META) {
        let declared = payload.and_then(|p| p.get("id")).and_then(Value::as_str);
        if let Some(id) = declared.filter(|id| !id.is_empty() && *id != session_id) {
            event.previous_session_id = Some(session_id.to_string());
            event.session_id = id.to_string();
        }
    }

    // Any payload shape is searched first, arrays included.
    event.cwd = fields
        .get("payload")
        .and_then(|p| find_first_string(p, &[CWD_KEY], CWD_SEARCH_DEPTH))
        .or_else(|| find_first_string(&record, &[CWD_KEY], CWD_SEARCH_DEPTH));

    if entry_type == Some(EVENT_MSG) {
        event.mark_working = inner_type == Some(USER_MESSAGE);
        event.mark_idle = inner_type == Some(AGENT_MESSAGE);
    }

    event
}

/// Breadth-first search for the first non-empty string stored under any of
/// `keys`, descending at most `max_depth` levels below `root`.
///
/// Keys are checked on an object before any of its children are queued, so
/// a shallow match always wins over a deeper one.
pub fn find_first_string(root: &Value, keys: &[&str], max_depth: usize) -> Option<String> {
    let mut queue = VecDeque::from([(root, 0usize)]);
    while let Some((value, depth)) = queue.pop_front() {
        let children: Box<dyn Iterator<Item = &Value>> = match value {
            Value::Object(fields) => {
                for key in keys {
                    if let Some(Value::String(found)) = fields.get(*key) {
                        if !found.is_empty() {
                            return Some(found.clone());
                        }
                    }
                }
                Box::new(fields.values())
            }
            Value::Array(items) => Box::new(items.iter()),
            _ => continue,
        };
        if depth >= max_depth {
            continue;
        }
        for child in children {
            if child.is_object() || child.is_array() {
                queue.push_back((child, depth + 1));
            }
        }
    }
    None
}

/// Whether `path` names a rollout log.
pub fn is_rollout_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name == CANONICAL_NAME || embedded_session_id(name).is_some()
}

/// Initial session id for a rollout log, derived from its location.
///
/// `rollout-<id>.jsonl` yields `<id>`; a bare `rollout.jsonl` is named after
/// its parent directory unless that directory is the `sessions` root. Any
/// other path is its own id.
pub fn session_id_from_path(path: &Path) -> String {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if let Some(id) = embedded_session_id(name) {
        return id.to_string();
    }
    if name == CANONICAL_NAME {
        let parent = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str());
        if let Some(parent) = parent.filter(|p| *p != "sessions") {
            return parent.to_string();
        }
    }
    path.to_string_lossy().into_owned()
}

fn embedded_session_id(name: &str) -> Option<&str> {
    name.strip_prefix(NAME_PREFIX)?
        .strip_suffix(NAME_SUFFIX)
        .filter(|id| !id.is_empty())
}
