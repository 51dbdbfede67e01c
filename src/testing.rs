//! In-memory doubles for the relay's collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::auth::cache::VerdictStore;
use crate::auth::context::ContextSigner;
use crate::auth::error::AuthnReason;
use crate::auth::verdict::{CachedVerdict, Identity};
use crate::authority::{
    AuthorityError, ComponentHealth, CredentialAuthority, IssuedCredential, Registration,
    Validation,
};
use crate::clock::Clock;
use crate::config::Config;
use crate::ledger::keydb::{idempotency_key, marker_ttl_secs};
use crate::ledger::{LedgerDecision, LedgerRequest, RateLedger, Window};
use crate::AppState;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ---------------------------------------------------------------------------
// Verdict store
// ---------------------------------------------------------------------------

pub struct MemoryVerdictStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, (CachedVerdict, DateTime<Utc>)>>,
    pub down: AtomicBool,
}

impl MemoryVerdictStore {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
        })
    }

    pub fn peek(&self, fingerprint: &str) -> Option<CachedVerdict> {
        self.entries.lock().get(fingerprint).map(|(v, _)| v.clone())
    }

    pub fn insert_raw(&self, fingerprint: &str, verdict: CachedVerdict, expires: DateTime<Utc>) {
        self.entries
            .lock()
            .insert(fingerprint.to_string(), (verdict, expires));
    }

    fn check(&self) -> Result<()> {
        anyhow::ensure!(!self.down.load(Ordering::SeqCst), "verdict store down");
        Ok(())
    }
}

#[async_trait::async_trait]
impl VerdictStore for MemoryVerdictStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<CachedVerdict>> {
        self.check()?;
        let now = self.clock.now();
        let entries = self.entries.lock();
        Ok(entries
            .get(fingerprint)
            .filter(|(_, exp)| *exp > now)
            .map(|(v, _)| v.clone()))
    }

    async fn put(&self, fingerprint: &str, verdict: &CachedVerdict, ttl: Duration) -> Result<()> {
        self.check()?;
        let expires = self.clock.now() + chrono::Duration::from_std(ttl)?;
        self.insert_raw(fingerprint, verdict.clone(), expires);
        Ok(())
    }

    async fn remove(&self, fingerprint: &str) -> Result<bool> {
        self.check()?;
        Ok(self.entries.lock().remove(fingerprint).is_some())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

// ---------------------------------------------------------------------------
// Rate ledger
// ---------------------------------------------------------------------------

/// Idempotency marker state, as stored by the KeyDB script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    /// First decision, not yet replayed.
    Fresh { allowed: bool },
    Spent,
}

/// Step for step the KeyDB script: a fresh marker replays once and is
/// spent, a spent marker charges again without being rewritten, over-budget
/// increments are recorded, and markers expire two windows after they were
/// written.
pub struct MemoryRateLedger {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<(String, i64), u64>>,
    markers: Mutex<HashMap<String, (Marker, DateTime<Utc>)>>,
    pub down: AtomicBool,
    pub calls: AtomicUsize,
}

impl MemoryRateLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            counters: Mutex::new(HashMap::new()),
            markers: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn count(&self, identity: &str, window_index: i64) -> u64 {
        self.counters
            .lock()
            .get(&(identity.to_string(), window_index))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl RateLedger for MemoryRateLedger {
    async fn check_and_increment(&self, request: &LedgerRequest<'_>) -> Result<LedgerDecision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(!self.down.load(Ordering::SeqCst), "ledger down");

        let now = self.clock.now();
        let key = (request.identity.to_string(), request.window.index);
        let mut counters = self.counters.lock();
        let mut markers = self.markers.lock();

        let marker_key = idempotency_key(request);
        if let Some(marker_key) = &marker_key {
            markers.retain(|_, (_, expires)| *expires > now);
            if let Some((marker, _)) = markers.get_mut(marker_key) {
                if let Marker::Fresh { allowed } = *marker {
                    *marker = Marker::Spent;
                    let count = counters.get(&key).copied().unwrap_or(0);
                    return Ok(LedgerDecision::new(allowed, count, request.budget, true));
                }
            }
        }

        let count = counters.entry(key).or_insert(0);
        *count += request.cost;
        let allowed = *count <= request.budget;
        if let Some(marker_key) = marker_key {
            let ttl = chrono::Duration::seconds(marker_ttl_secs(&request.window) as i64);
            markers
                .entry(marker_key)
                .or_insert((Marker::Fresh { allowed }, now + ttl));
        }
        Ok(LedgerDecision::new(allowed, *count, request.budget, false))
    }
}

// ---------------------------------------------------------------------------
// Credential authority
// ---------------------------------------------------------------------------

struct Account {
    password: String,
    identity: Identity,
}

/// Scriptable authority.  Credentials are either issued through `login` or
/// installed directly with [`FakeAuthority::grant`].
pub struct FakeAuthority {
    clock: Arc<dyn Clock>,
    accounts: Mutex<HashMap<String, Account>>,
    credentials: Mutex<HashMap<String, Validation>>,
    next_id: AtomicUsize,
    pub down: AtomicBool,
    /// Validate sleeps this long before answering.
    pub delay: Mutex<Option<Duration>>,
    pub validate_calls: AtomicUsize,
    pub credential_lifetime: Duration,
}

impl FakeAuthority {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            accounts: Mutex::new(HashMap::new()),
            credentials: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            down: AtomicBool::new(false),
            delay: Mutex::new(None),
            validate_calls: AtomicUsize::new(0),
            credential_lifetime: Duration::from_secs(30 * 60),
        })
    }

    /// Install `credential` as valid for `identity` until `expires_at`.
    pub fn grant(&self, credential: &str, identity: Identity, expires_at: DateTime<Utc>) {
        self.grant_issued(credential, identity, self.clock.now(), expires_at);
    }

    /// Like [`FakeAuthority::grant`] with an explicit issuance time.
    pub fn grant_issued(
        &self,
        credential: &str,
        identity: Identity,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) {
        self.credentials.lock().insert(
            credential.to_string(),
            Validation::Accepted {
                identity,
                issued_at,
                expires_at,
            },
        );
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), AuthorityError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AuthorityError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialAuthority for FakeAuthority {
    async fn register(&self, registration: &Registration) -> Result<Identity, AuthorityError> {
        self.check()?;
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(&registration.email) {
            return Err(AuthorityError::Invalid("Email already registered".to_string()));
        }
        let identity = Identity {
            id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
            email: Some(registration.email.clone()),
            active: true,
            privileged: false,
        };
        accounts.insert(
            registration.email.clone(),
            Account {
                password: registration.password.clone(),
                identity: identity.clone(),
            },
        );
        Ok(identity)
    }

    async fn login(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<IssuedCredential, AuthorityError> {
        self.check()?;
        let identity = {
            let accounts = self.accounts.lock();
            match accounts.get(identifier) {
                Some(account) if account.password == secret => account.identity.clone(),
                _ => {
                    return Err(AuthorityError::Unauthenticated(
                        "Incorrect email or password".to_string(),
                    ))
                }
            }
        };
        let issued_at = self.clock.now();
        let expires_at = issued_at + chrono::Duration::from_std(self.credential_lifetime).unwrap();
        let token = format!("tok-{}-{}", identity.id, issued_at.timestamp_micros());
        self.grant(&token, identity, expires_at);
        Ok(IssuedCredential {
            access_token: token,
            token_type: "bearer".to_string(),
            issued_at,
            expires_at,
        })
    }

    async fn validate(&self, credential: &str) -> Result<Validation, AuthorityError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        let now = self.clock.now();
        let answer = self.credentials.lock().get(credential).cloned();
        Ok(match answer {
            Some(Validation::Accepted { expires_at, .. }) if now >= expires_at => {
                Validation::Rejected {
                    reason: AuthnReason::ExpiredCredential,
                }
            }
            Some(v) => v,
            None => Validation::Rejected {
                reason: AuthnReason::InvalidCredential,
            },
        })
    }

    async fn health_check(&self) -> Result<ComponentHealth, AuthorityError> {
        self.check()?;
        Ok(ComponentHealth {
            status: "healthy".to_string(),
            service: "auth-service".to_string(),
        })
    }
}

pub fn identity(id: &str) -> Identity {
    Identity {
        id: id.to_string(),
        email: Some(format!("{id}@example.com")),
        active: true,
        privileged: false,
    }
}

pub fn t0() -> DateTime<Utc> {
    // Aligned to a 60 second window boundary.
    DateTime::from_timestamp(1_800_000_000 - 1_800_000_000 % 60, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Whole application
// ---------------------------------------------------------------------------

/// An [`AppState`] wired to the in-memory doubles.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    pub authority: Arc<FakeAuthority>,
    pub verdicts: Arc<MemoryVerdictStore>,
    pub ledger: Arc<MemoryRateLedger>,
}

impl TestApp {
    pub fn new(config: Config) -> Self {
        let clock = ManualClock::at(t0());
        let authority = FakeAuthority::new(clock.clone());
        let verdicts = MemoryVerdictStore::new(clock.clone());
        let ledger = MemoryRateLedger::new(clock.clone());
        let state = build_state(config, &clock, &authority, &verdicts, &ledger);
        Self {
            state,
            clock,
            authority,
            verdicts,
            ledger,
        }
    }

    /// Same doubles, new configuration.
    pub fn with_config(self, config: Config) -> Self {
        let state = build_state(config, &self.clock, &self.authority, &self.verdicts, &self.ledger);
        Self { state, ..self }
    }

    /// Make `credential` valid for `identity` for the next half hour.
    pub fn grant(&self, credential: &str, identity: Identity) {
        let expires = self.clock.now() + chrono::Duration::minutes(30);
        self.authority.grant(credential, identity, expires);
    }

    pub fn window_index(&self) -> i64 {
        let size = Duration::from_secs(self.state.config.rate_limit.window_secs);
        Window::containing(self.clock.now(), size).index
    }
}

fn build_state(
    config: Config,
    clock: &Arc<ManualClock>,
    authority: &Arc<FakeAuthority>,
    verdicts: &Arc<MemoryVerdictStore>,
    ledger: &Arc<MemoryRateLedger>,
) -> Arc<AppState> {
    let signer = ContextSigner::new(b"test-context-key-0123456789".to_vec()).unwrap();
    let state = AppState::new(
        Arc::new(config),
        authority.clone(),
        verdicts.clone(),
        ledger.clone(),
        clock.clone(),
        signer,
        reqwest::Client::new(),
    )
    .unwrap();
    Arc::new(state)
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charge<'a>(clock: &ManualClock, scope: &'a str, token: &'a str) -> LedgerRequest<'a> {
        LedgerRequest {
            identity: "7",
            cost: 1,
            budget: 10,
            window: Window::containing(clock.now(), Duration::from_secs(60)),
            scope,
            idempotency_key: Some(token),
        }
    }

    #[tokio::test]
    async fn ledger_double_replays_once_then_charges() {
        let clock = ManualClock::at(t0());
        let ledger = MemoryRateLedger::new(clock.clone());

        let first = ledger.check_and_increment(&charge(&clock, "POST /a", "k")).await.unwrap();
        let replay = ledger.check_and_increment(&charge(&clock, "POST /a", "k")).await.unwrap();
        let reuse = ledger.check_and_increment(&charge(&clock, "POST /a", "k")).await.unwrap();
        assert_eq!((first.replayed, first.count), (false, 1));
        assert_eq!((replay.replayed, replay.count), (true, 1));
        assert_eq!((reuse.replayed, reuse.count), (false, 2));

        // Still spent: the fresh charge does not re-arm the marker.
        let again = ledger.check_and_increment(&charge(&clock, "POST /a", "k")).await.unwrap();
        assert_eq!((again.replayed, again.count), (false, 3));
    }

    #[tokio::test]
    async fn ledger_double_markers_expire_after_two_windows() {
        let clock = ManualClock::at(t0());
        let ledger = MemoryRateLedger::new(clock.clone());

        ledger.check_and_increment(&charge(&clock, "POST /a", "k")).await.unwrap();
        clock.advance(Duration::from_secs(119));
        let replay = ledger.check_and_increment(&charge(&clock, "POST /a", "k")).await.unwrap();
        assert!(replay.replayed);

        let clock = ManualClock::at(t0());
        let ledger = MemoryRateLedger::new(clock.clone());
        ledger.check_and_increment(&charge(&clock, "POST /a", "k")).await.unwrap();
        clock.advance(Duration::from_secs(120));
        let fresh = ledger.check_and_increment(&charge(&clock, "POST /a", "k")).await.unwrap();
        assert!(!fresh.replayed);
        assert_eq!(fresh.count, 1);
    }
}
