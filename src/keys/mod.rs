//! Credential pool for the LLM provider.
//!
//! Rotates over N API keys round-robin, skipping keys that are cooling down
//! after an overload-class failure, and enforces a global minimum spacing
//! between requests. The wait is always performed with the pool lock
//! released so concurrent queries serialise on acquisition order, not on
//! sleep time.

use crate::errors::{ToolforgeError, ToolforgeResult};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Provider error fragments treated as retryable with key rotation.
const TRANSIENT_MARKERS: &[&str] = &[
    "overload",
    "quota",
    "rate limit",
    "429",
    "503",
    "resource_exhausted",
];

/// Whether a provider error message is overload-class (retry with rotation).
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Backoff delay before retry attempt `attempt` (1-based): 5, 10, 20, 40,
/// capped at 60 seconds.
pub fn retry_backoff(attempt: usize) -> Duration {
    let base: u64 = 5;
    let secs = base
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(6))
        .min(60);
    Duration::from_secs(secs)
}

struct KeySlot {
    credential: String,
    cooldown_until: Option<Instant>,
}

struct PoolState {
    slots: Vec<KeySlot>,
    current: usize,
    /// Time before which no acquisition may complete (min-interval pacing).
    next_allowed: Option<Instant>,
}

/// A credential handed out by [`KeyPool::acquire`].
#[derive(Debug, Clone)]
pub struct KeyLease {
    pub credential: String,
    /// 1-based position in the pool, for logs.
    pub ordinal: usize,
}

pub struct KeyPool {
    state: Mutex<PoolState>,
    size: usize,
    min_interval: Duration,
    cooldown: Duration,
}

impl KeyPool {
    pub fn new(
        credentials: Vec<String>,
        min_interval: Duration,
        cooldown: Duration,
    ) -> ToolforgeResult<Self> {
        if credentials.is_empty() {
            return Err(ToolforgeError::Config(
                "no API keys configured (set GEMINI_API_KEY_1..N)".to_string(),
            ));
        }
        info!(
            "key pool initialised with {} credential(s)",
            credentials.len()
        );
        let size = credentials.len();
        Ok(Self {
            state: Mutex::new(PoolState {
                slots: credentials
                    .into_iter()
                    .map(|credential| KeySlot {
                        credential,
                        cooldown_until: None,
                    })
                    .collect(),
                current: 0,
                next_allowed: None,
            }),
            size,
            min_interval,
            cooldown,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Maximum retry attempts for a wrapped call: two passes over the pool.
    pub fn max_attempts(&self) -> usize {
        self.size * 2
    }

    /// Select the next usable credential, sleeping as needed to honour the
    /// minimum inter-request interval and any active cooldowns.
    pub async fn acquire(&self) -> KeyLease {
        loop {
            let outcome = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                match state.next_allowed {
                    Some(next_allowed) if next_allowed > now => Err(next_allowed - now),
                    _ => self.try_take(&mut state, now),
                }
            };

            match outcome {
                Ok(lease) => return lease,
                Err(delay) => {
                    debug!("key pool pacing: waiting {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Take the next non-cooling slot, advancing the cursor and stamping the
    /// pacing window. Returns the duration to wait when nothing is usable.
    fn try_take(&self, state: &mut PoolState, now: Instant) -> Result<KeyLease, Duration> {
        let n = state.slots.len();
        for offset in 0..n {
            let idx = (state.current + offset) % n;
            let cooling = state.slots[idx]
                .cooldown_until
                .map(|until| until > now)
                .unwrap_or(false);
            if !cooling {
                state.current = (idx + 1) % n;
                state.next_allowed = Some(now + self.min_interval);
                return Ok(KeyLease {
                    credential: state.slots[idx].credential.clone(),
                    ordinal: idx + 1,
                });
            }
        }
        // All credentials cooling: wait for the earliest expiry.
        let earliest = state
            .slots
            .iter()
            .filter_map(|s| s.cooldown_until)
            .min()
            .unwrap_or(now);
        Err(earliest
            .saturating_duration_since(now)
            .max(Duration::from_millis(50)))
    }

    /// Clear the cooldown of a credential after a successful use.
    pub async fn note_success(&self, ordinal: usize) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.get_mut(ordinal.saturating_sub(1)) {
            slot.cooldown_until = None;
        }
    }

    /// Put a credential on cooldown after an overload-class failure.
    pub async fn note_overloaded(&self, ordinal: usize) {
        let mut state = self.state.lock().await;
        let total = state.slots.len();
        if let Some(slot) = state.slots.get_mut(ordinal.saturating_sub(1)) {
            slot.cooldown_until = Some(Instant::now() + self.cooldown);
            warn!(
                "credential {}/{} placed on cooldown for {:?}",
                ordinal, total, self.cooldown
            );
        }
    }

    /// Number of credentials currently cooling down.
    pub async fn cooling_count(&self) -> usize {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .slots
            .iter()
            .filter(|s| s.cooldown_until.map(|u| u > now).unwrap_or(false))
            .count()
    }
}
