//! Blocking policy applied by clients to published snapshots.
//!
//! Everything here is pure: callers pass in the clock and calendar date.

use std::time::Duration;

use crate::registry::Snapshot;

/// How long a bypass lasts once granted.
pub const BYPASS_DURATION: Duration = Duration::from_secs(5 * 60);

/// Inputs to [`compute_should_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInputs {
    pub bypass_active: bool,
    pub server_connected: bool,
    pub sessions: usize,
    pub working: usize,
    pub waiting_for_input: usize,
}

/// Block when the server is unreachable, or when there is at least one
/// session and none of them is working or waiting for input. An active
/// bypass always wins.
pub fn compute_should_block(inputs: BlockInputs) -> bool {
    let has_session = inputs.sessions > 0;
    let all_quiet = inputs.working == 0 && inputs.waiting_for_input == 0;
    !inputs.bypass_active && (!inputs.server_connected || (has_session && all_quiet))
}

/// Apply the user's manual overrides. Setting both cancels them out.
pub fn apply_overrides(base_blocked: bool, force_open: bool, force_block: bool) -> bool {
    match (force_open, force_block) {
        (true, true) | (false, false) => base_blocked,
        (true, false) => false,
        (false, true) => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BypassError {
    #[error("bypass already used today")]
    AlreadyUsedToday,
}

/// One temporary bypass per calendar day.
///
/// Times are milliseconds since the Unix epoch; `today` is any stable key
/// for the user's local calendar date (e.g. `"2025-01-15"`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BypassState {
    pub last_bypass_date: Option<String>,
    pub bypass_until: Option<u64>,
}

impl BypassState {
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.bypass_until.is_some_and(|until| until > now_ms)
    }

    pub fn used_today(&self, today: &str) -> bool {
        self.last_bypass_date.as_deref() == Some(today)
    }

    /// Grant a bypass until `now_ms + BYPASS_DURATION`. Returns the expiry.
    pub fn activate(&mut self, today: &str, now_ms: u64) -> Result<u64, BypassError> {
        if self.used_today(today) {
            return Err(BypassError::AlreadyUsedToday);
        }
        let until = now_ms.saturating_add(BYPASS_DURATION.as_millis() as u64);
        self.bypass_until = Some(until);
        self.last_bypass_date = Some(today.to_string());
        Ok(until)
    }

    /// Clear an elapsed bypass. Returns true if one was cleared.
    pub fn expire(&mut self, now_ms: u64) -> bool {
        match self.bypass_until {
            Some(until) if until <= now_ms => {
                self.bypass_until = None;
                true
            }
            _ => false,
        }
    }
}

/// Everything a client knows when deciding whether to block.
#[derive(Debug, Clone, Default)]
pub struct ClientView {
    pub server_connected: bool,
    /// Last snapshot received; counts are zero before the first one.
    pub snapshot: Option<Snapshot>,
    pub bypass: BypassState,
    pub force_open: bool,
    pub force_block: bool,
}

impl ClientView {
    pub fn should_block(&self, now_ms: u64) -> bool {
        let snapshot = self.snapshot.unwrap_or(Snapshot {
            blocked: true,
            sessions: 0,
            working: 0,
            waiting_for_input: 0,
        });
        let base = compute_should_block(BlockInputs {
            bypass_active: self.bypass.is_active(now_ms),
            server_connected: self.server_connected,
            sessions: snapshot.sessions,
            working: snapshot.working,
            waiting_for_input: snapshot.waiting_for_input,
        });
        apply_overrides(base, self.force_open, self.force_block)
    }

    /// Connection dropped. The stale snapshot is kept but no longer trusted.
    pub fn disconnected(&mut self) {
        self.server_connected = false;
    }

    pub fn received(&mut self, snapshot: Snapshot) {
        self.server_connected = true;
        self.snapshot = Some(snapshot);
    }
}
