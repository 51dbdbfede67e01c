//! Shared per-identity request budget.
//!
//! Fixed, wall-clock aligned windows keyed by
//! `(identity, floor(now / window_size))`.  Counting happens atomically in
//! the shared store so that the budget holds across every relay instance.
//! Over-budget attempts are still recorded; they are denied, not dropped.

pub mod keydb;

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// One fixed rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub index: i64,
    pub size_secs: u64,
}

impl Window {
    pub fn containing(now: DateTime<Utc>, size: Duration) -> Self {
        let size_secs = size.as_secs().max(1);
        Self {
            index: now.timestamp().div_euclid(size_secs as i64),
            size_secs,
        }
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.index * self.size_secs as i64, 0).unwrap_or_default()
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp((self.index + 1) * self.size_secs as i64, 0).unwrap_or_default()
    }

    /// Whole seconds until rollover, rounded up, never zero.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.resets_at() - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerRequest<'a> {
    pub identity: &'a str,
    pub cost: u64,
    pub budget: u64,
    pub window: Window,
    /// What is being charged for, e.g. `POST /appointments`.  Replays are
    /// scoped to it so one token cannot cover a different route.
    pub scope: &'a str,
    /// Caller-supplied token identifying one logical request across retries.
    pub idempotency_key: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerDecision {
    pub allowed: bool,
    /// Units recorded in the window after this call.
    pub count: u64,
    pub remaining: u64,
    /// The decision was replayed from an earlier call with the same
    /// idempotency key; nothing was charged.  Each key is replayed at most
    /// once, later reuse is charged like a fresh request.
    pub replayed: bool,
}

impl LedgerDecision {
    pub fn new(allowed: bool, count: u64, budget: u64, replayed: bool) -> Self {
        Self {
            allowed,
            count,
            remaining: budget.saturating_sub(count),
            replayed,
        }
    }
}

#[async_trait::async_trait]
pub trait RateLedger: Send + Sync {
    async fn check_and_increment(&self, request: &LedgerRequest<'_>) -> Result<LedgerDecision>;
}
