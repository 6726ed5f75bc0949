//! Per-client-IP abuse controls: a fixed-window request budget and a cap on
//! concurrent push-channel connections.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;

use super::error::ApiError;

/// Windows are pruned once the table grows past this many IPs.
const PRUNE_THRESHOLD: usize = 1024;

/// The peer address of the current request, inserted as a request extension
/// by [`rate_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Fixed request budget per IP per window.
///
/// The first request from an IP opens a window; up to `limit` requests are
/// admitted until it resets, after which a fresh window opens on the next
/// request.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|_, w| w.reset_at > now);
        }
        match windows.get_mut(&ip) {
            Some(w) if w.reset_at > now => {
                if w.count >= self.limit {
                    return false;
                }
                w.count += 1;
                true
            }
            _ => {
                windows.insert(
                    ip,
                    Window {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                self.limit > 0
            }
        }
    }

    /// Number of IPs with a tracked window.
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }
}

/// Rate-limit middleware. Outermost gateway layer: runs before the origin and
/// auth checks so rejected clients never touch the token store.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = peer_ip(&req);
    if !limiter.check(ip) {
        tracing::debug!(%ip, "rate limited");
        return Err(ApiError::RateLimited);
    }
    req.extensions_mut().insert(ClientIp(ip));
    Ok(next.run(req).await)
}

fn peer_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Concurrent push-channel connections per IP.
pub struct ConnectionTracker {
    max_per_ip: usize,
    counts: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

/// Holds one connection slot; releases it when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    ip: IpAddr,
    counts: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        if let Some(n) = counts.get_mut(&self.ip) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counts.remove(&self.ip);
            }
        }
    }
}

impl ConnectionTracker {
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            max_per_ip,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim a slot for `ip`, returning `None` once the IP is at the cap.
    pub fn acquire(&self, ip: IpAddr) -> Option<ConnectionGuard> {
        let mut counts = self.counts.lock();
        let current = counts.entry(ip).or_insert(0);
        if *current >= self.max_per_ip {
            return None;
        }
        *current += 1;
        Some(ConnectionGuard {
            ip,
            counts: Arc::clone(&self.counts),
        })
    }

    pub fn count(&self, ip: IpAddr) -> usize {
        self.counts.lock().get(&ip).copied().unwrap_or(0)
    }

    pub fn max_per_ip(&self) -> usize {
        self.max_per_ip
    }
}
