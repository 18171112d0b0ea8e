//! Address bans with optional expiry.
//!
//! Exact-address bans live in a hash map for O(1) lookups on the accept path;
//! CIDR and range bans are scanned linearly. Expired entries are evicted
//! lazily whenever the registry is read.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::address::AddressPattern;
use crate::error::{ProtocolError, Result};

/// How long a ban lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanDuration {
    For(Duration),
    Permanent,
}

impl From<Duration> for BanDuration {
    fn from(duration: Duration) -> Self {
        BanDuration::For(duration)
    }
}

impl BanDuration {
    /// `None` means the ban never expires, including durations too large
    /// to represent as an `Instant`.
    fn expiry(self, now: Instant) -> Option<Instant> {
        match self {
            BanDuration::For(d) => now.checked_add(d),
            BanDuration::Permanent => None,
        }
    }
}

#[derive(Debug, Clone)]
struct BanEntry {
    pattern: AddressPattern,
    expires_at: Option<Instant>,
}

impl BanEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct BanTable {
    exact: HashMap<IpAddr, BanEntry>,
    patterns: Vec<BanEntry>,
}

impl BanTable {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.exact.len() + self.patterns.len();
        self.exact.retain(|_, entry| !entry.is_expired(now));
        self.patterns.retain(|entry| !entry.is_expired(now));
        before - (self.exact.len() + self.patterns.len())
    }
}

/// A currently active ban, as reported by [`BanRegistry::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanInfo {
    pub pattern: AddressPattern,
    /// Remaining time, `None` for permanent bans
    pub remaining: Option<Duration>,
}

/// Thread-safe ban list consulted before any bytes of a connection are read
#[derive(Debug, Default)]
pub struct BanRegistry {
    table: Mutex<BanTable>,
}

impl BanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BanTable> {
        // A panic mid-update leaves at worst a stale entry; keep serving.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ban an address or address pattern. Re-banning replaces the expiry.
    pub fn ban(&self, pattern: impl Into<AddressPattern>, duration: impl Into<BanDuration>) {
        let pattern = pattern.into();
        let duration = duration.into();
        let entry = BanEntry {
            pattern: pattern.clone(),
            expires_at: duration.expiry(Instant::now()),
        };

        let mut table = self.lock();
        match &pattern {
            AddressPattern::Exact(ip) => {
                table.exact.insert(*ip, entry);
            }
            _ => {
                table.patterns.retain(|e| e.pattern != pattern);
                table.patterns.push(entry);
            }
        }
        info!(%pattern, ?duration, "Address banned");
    }

    /// Lift a ban. Returns whether a matching entry existed.
    pub fn unban(&self, pattern: impl Into<AddressPattern>) -> bool {
        let pattern = pattern.into();
        let mut table = self.lock();
        let removed = match &pattern {
            AddressPattern::Exact(ip) => table.exact.remove(ip).is_some(),
            _ => {
                let before = table.patterns.len();
                table.patterns.retain(|e| e.pattern != pattern);
                before != table.patterns.len()
            }
        };
        if removed {
            info!(%pattern, "Ban lifted");
        }
        removed
    }

    /// Whether `ip` is covered by an unexpired ban. Evicts expired entries.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        let now = Instant::now();
        let mut table = self.lock();

        let removed = table.purge(now);
        if removed > 0 {
            debug!(removed, "Evicted expired bans");
        }

        table.exact.contains_key(&ip) || table.patterns.iter().any(|e| e.pattern.matches(ip))
    }

    /// Like [`is_banned`](Self::is_banned), as an error for callers that
    /// propagate rejections.
    pub fn check(&self, ip: IpAddr) -> Result<()> {
        if self.is_banned(ip) {
            return Err(ProtocolError::Banned(ip.to_canonical()));
        }
        Ok(())
    }

    /// Active bans, expired entries excluded
    pub fn list(&self) -> Vec<BanInfo> {
        let now = Instant::now();
        let mut table = self.lock();
        table.purge(now);
        table
            .exact
            .values()
            .chain(table.patterns.iter())
            .map(|entry| BanInfo {
                pattern: entry.pattern.clone(),
                remaining: entry.expires_at.map(|at| at.saturating_duration_since(now)),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        let mut table = self.lock();
        table.purge(Instant::now());
        table.exact.len() + table.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut table = self.lock();
        table.exact.clear();
        table.patterns.clear();
    }
}
