use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, Subscription};

/// Activity state of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Working,
    /// The agent is blocked on the user. No log record currently produces
    /// this; it is only reachable through
    /// [`SessionRegistry::set_waiting_for_input`].
    WaitingForInput,
}

/// One tracked agent run.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    /// Last status-affecting event.
    pub last_activity: Instant,
    /// Last observation of any kind.
    pub last_seen: Instant,
    pub cwd: Option<String>,
    /// When set, a working session falls back to idle after this long
    /// without activity.
    pub idle_timeout: Option<Duration>,
}

impl Session {
    fn new(id: &str, cwd: Option<String>, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            status: SessionStatus::Idle,
            last_activity: now,
            last_seen: now,
            cwd,
            idle_timeout: None,
        }
    }
}

/// Aggregate counts published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Advisory only: true when nothing is working. Clients apply the full
    /// policy in [`crate::decision`].
    pub blocked: bool,
    pub sessions: usize,
    pub working: usize,
    pub waiting_for_input: usize,
}

/// A working-marking observation.
#[derive(Debug, Clone)]
pub struct Activity {
    pub session_id: String,
    pub cwd: Option<String>,
    pub idle_timeout: Option<Duration>,
}

impl Activity {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: None,
            idle_timeout: None,
        }
    }
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    broadcaster: Broadcaster<Snapshot>,
}

impl RegistryInner {
    fn snapshot(&self) -> Snapshot {
        let mut working = 0;
        let mut waiting_for_input = 0;
        for session in self.sessions.values() {
            match session.status {
                SessionStatus::Working => working += 1,
                SessionStatus::WaitingForInput => waiting_for_input += 1,
                SessionStatus::Idle => {}
            }
        }
        Snapshot {
            blocked: working == 0,
            sessions: self.sessions.len(),
            working,
            waiting_for_input,
        }
    }

    fn broadcast(&self) {
        self.broadcaster.publish(&self.snapshot());
    }

    /// Returns the session and whether it was just created.
    fn ensure(&mut self, id: &str, cwd: Option<&str>, now: Instant) -> (&mut Session, bool) {
        let mut created = false;
        let session = self.sessions.entry(id.to_string()).or_insert_with(|| {
            created = true;
            tracing::info!(session_id = %id, "codex session connected");
            Session::new(id, None, now)
        });
        if let Some(cwd) = cwd {
            session.cwd = Some(cwd.to_string());
        }
        (session, created)
    }
}

/// The set of live sessions.
///
/// Every mutation and every broadcast happens under one lock, so subscribers
/// see snapshots in exactly the order the changes were applied. Subscriber
/// callbacks therefore run with that lock held and must not call back into
/// the registry; forwarding into a channel is the intended pattern.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    session_timeout: Duration,
}

impl SessionRegistry {
    /// Sessions not seen for this long are evicted.
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

    pub fn new() -> Self {
        Self::with_session_timeout(Self::DEFAULT_SESSION_TIMEOUT)
    }

    pub fn with_session_timeout(session_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                broadcaster: Broadcaster::new(),
            })),
            session_timeout,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Register `callback` for snapshots. It is called once with the current
    /// snapshot before this returns, then once per state change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<Snapshot>
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let inner = self.inner.lock();
        let current = inner.snapshot();
        inner.broadcaster.subscribe(&current, callback)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().snapshot()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().broadcaster.subscriber_count()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The session is working. Always broadcasts, since `last_activity`
    /// moves even when the status does not.
    pub fn handle_activity(&self, activity: Activity) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let (session, _) = inner.ensure(&activity.session_id, activity.cwd.as_deref(), now);
        session.status = SessionStatus::Working;
        session.last_activity = now;
        session.last_seen = now;
        session.idle_timeout = activity.idle_timeout;
        inner.broadcast();
    }

    /// The session is idle. Broadcasts only on an actual transition.
    pub fn set_idle(&self, session_id: &str, cwd: Option<&str>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let (session, _) = inner.ensure(session_id, cwd, now);
        if session.status != SessionStatus::Idle {
            session.status = SessionStatus::Idle;
            session.last_activity = now;
            inner.broadcast();
        }
    }

    /// The session is waiting on the user. Only existing sessions can wait;
    /// returns whether the session exists.
    pub fn set_waiting_for_input(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return false;
        };
        if session.status != SessionStatus::WaitingForInput {
            session.status = SessionStatus::WaitingForInput;
            session.last_activity = now;
            inner.broadcast();
        }
        true
    }

    /// Passive sighting: refreshes `last_seen`. A previously unknown id is
    /// created idle and announced.
    pub fn mark_seen(&self, session_id: &str, cwd: Option<&str>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let (session, created) = inner.ensure(session_id, cwd, now);
        session.last_seen = now;
        if created {
            inner.broadcast();
        }
    }

    /// Forget a session, e.g. because it now lives under a new id.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.sessions.remove(session_id).is_some();
        if removed {
            inner.broadcast();
        }
        removed
    }

    /// Evict stale sessions and time out quiet working sessions.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// [`sweep`](Self::sweep) as of `now`. Broadcasts at most once, and only
    /// if something changed.
    pub fn sweep_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let before = inner.sessions.len();
        let session_timeout = self.session_timeout;
        inner
            .sessions
            .retain(|_, s| now.saturating_duration_since(s.last_seen) <= session_timeout);
        let removed = before - inner.sessions.len();

        let mut timed_out = 0;
        for session in inner.sessions.values_mut() {
            let quiet = now.saturating_duration_since(session.last_activity);
            let expired = session
                .idle_timeout
                .is_some_and(|limit| !limit.is_zero() && quiet > limit);
            if session.status == SessionStatus::Working && expired {
                session.status = SessionStatus::Idle;
                timed_out += 1;
            }
        }

        if removed > 0 || timed_out > 0 {
            tracing::debug!(removed, timed_out, "session sweep changed state");
            inner.broadcast();
        }
    }

    /// Drop all sessions and subscribers.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.sessions.clear();
        inner.broadcaster.clear();
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run [`SessionRegistry::sweep`] every `interval` until `cancel` fires.
pub fn spawn_sweeper(
    registry: SessionRegistry,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be stale yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => registry.sweep(),
            }
        }
        tracing::debug!("session sweeper stopped");
    })
}
