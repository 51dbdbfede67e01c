use anyhow::{Context, Result};
use fred::interfaces::LuaInterface;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{LedgerDecision, LedgerRequest, RateLedger, Window};

/// Atomic check-and-increment.
///
/// KEYS[1] = window counter, KEYS[2] = idempotency marker.
/// ARGV = cost, budget, counter ttl, idempotency ttl, has-idempotency flag.
/// Returns `{allowed, count, replayed}`.
///
/// A marker holds the first decision (`0` or `1`) until it is replayed
/// once, then `spent`.  A spent marker no longer replays; the request is
/// charged again and the marker stays spent until it expires.
const CHECK_AND_INCREMENT: &str = r#"
    local marker = false
    if ARGV[5] == '1' then
        marker = redis.call('GET', KEYS[2])
        if marker == '0' or marker == '1' then
            redis.call('SET', KEYS[2], 'spent', 'KEEPTTL')
            local count = tonumber(redis.call('GET', KEYS[1]) or '0')
            return {tonumber(marker), count, 1}
        end
    end
    local cost = tonumber(ARGV[1])
    local count = redis.call('INCRBY', KEYS[1], cost)
    if count == cost then
        redis.call('EXPIRE', KEYS[1], ARGV[3])
    end
    local allowed = 0
    if count <= tonumber(ARGV[2]) then
        allowed = 1
    end
    if ARGV[5] == '1' and not marker then
        redis.call('SET', KEYS[2], allowed, 'EX', ARGV[4])
    end
    return {allowed, count, 0}
"#;

/// Value of a marker that has already been replayed once.
pub const SPENT_MARKER: &str = "spent";

pub fn counter_key(identity: &str, window_index: i64) -> String {
    format!("authrelay:rate:{identity}:{window_index}")
}

/// Marker key for a request carrying an idempotency token.
///
/// The token is hashed together with the charged scope and cost so that
/// caller-chosen tokens cannot blow up key length, collide with other
/// namespaces, or replay a decision made for a different route.
pub fn idempotency_key(request: &LedgerRequest<'_>) -> Option<String> {
    let token = request.idempotency_key?;
    let mut hasher = Sha256::new();
    hasher.update(request.scope.as_bytes());
    hasher.update(b"\n");
    hasher.update(request.cost.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(token.as_bytes());
    Some(format!(
        "authrelay:idem:{}:{}",
        request.identity,
        hex::encode(hasher.finalize())
    ))
}

/// Counter ttl: the window plus a little so late readers still see the
/// final count.
pub fn counter_ttl_secs(window: &Window) -> u64 {
    window.size_secs + 5
}

/// Marker ttl: long enough to cover a retry that straddles rollover.
pub fn marker_ttl_secs(window: &Window) -> u64 {
    window.size_secs * 2
}

/// `(KEYS, ARGV)` for [`CHECK_AND_INCREMENT`].
fn script_inputs(request: &LedgerRequest<'_>) -> (Vec<String>, Vec<String>) {
    let counter = counter_key(request.identity, request.window.index);
    let (marker, has_marker) = match idempotency_key(request) {
        Some(marker) => (marker, "1"),
        None => (String::new(), "0"),
    };
    (
        vec![counter, marker],
        vec![
            request.cost.to_string(),
            request.budget.to_string(),
            counter_ttl_secs(&request.window).to_string(),
            marker_ttl_secs(&request.window).to_string(),
            has_marker.to_string(),
        ],
    )
}

pub struct KeyDbRateLedger {
    pool: fred::clients::Pool,
}

impl KeyDbRateLedger {
    pub fn new(pool: fred::clients::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RateLedger for KeyDbRateLedger {
    async fn check_and_increment(&self, request: &LedgerRequest<'_>) -> Result<LedgerDecision> {
        let (keys, args) = script_inputs(request);
        let reply: Vec<i64> = self
            .pool
            .eval(CHECK_AND_INCREMENT, keys, args)
            .await
            .context("rate ledger script failed")?;

        anyhow::ensure!(reply.len() == 3, "unexpected ledger reply: {reply:?}");
        let decision = LedgerDecision::new(
            reply[0] == 1,
            reply[1].max(0) as u64,
            request.budget,
            reply[2] == 1,
        );
        debug!(
            identity = request.identity,
            scope = request.scope,
            window = request.window.index,
            cost = request.cost,
            count = decision.count,
            allowed = decision.allowed,
            replayed = decision.replayed,
            "ledger check"
        );
        Ok(decision)
    }
}
