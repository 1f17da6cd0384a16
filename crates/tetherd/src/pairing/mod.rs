//! Pairing guard.
//!
//! Gates sensitive routes behind a one-time pairing handshake: while no
//! device has ever paired, the guard holds a single 6-digit code (shown in
//! the daemon's console). Exchanging that code mints a long-lived bearer
//! token, stored on disk as a hash only. Wrong guesses are throttled per
//! client identity.

mod store;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{info, warn};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

pub use store::{TokenStore, hash_token};

/// Wrong guesses allowed before a client identity is locked out.
const MAX_FAILURES: u32 = 5;

/// How long a locked-out client stays locked.
const LOCKOUT_WINDOW: Duration = Duration::from_secs(300);

/// Upper bound on tracked client identities. Oldest entries are evicted
/// first so a flood of distinct identities cannot grow the map without
/// bound.
const ATTEMPTS_CAP: usize = 256;

/// Result of [`PairingGuard::status`].
#[derive(Debug, Clone, Serialize)]
pub struct PairingStatus {
    pub pairing_required: bool,
    pub paired: bool,
    /// Present only while pairing is required and no token exists.
    pub pairing_code: Option<String>,
}

/// Why a pairing attempt was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairFailure {
    #[error("pairing is disabled on this daemon")]
    PairingDisabled,
    #[error("too many failed attempts, retry in {retry_after_secs}s")]
    Locked { retry_after_secs: u64 },
    #[error("a device is already paired")]
    AlreadyPaired,
    #[error("invalid pairing code")]
    InvalidCode,
    #[error("failed to persist token: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct GuardState {
    loaded: bool,
    token_hashes: std::collections::HashSet<String>,
    pairing_code: Option<String>,
}

#[derive(Debug)]
struct AttemptRecord {
    count: u32,
    locked_at: Option<Instant>,
    last_seen: Instant,
}

/// Pairing and token verification for the bridge.
pub struct PairingGuard {
    required: bool,
    store: TokenStore,
    lockout_window: Duration,
    state: Mutex<GuardState>,
    attempts: Mutex<HashMap<String, AttemptRecord>>,
}

impl PairingGuard {
    pub fn new(required: bool, store: TokenStore) -> Self {
        Self {
            required,
            store,
            lockout_window: LOCKOUT_WINDOW,
            state: Mutex::new(GuardState::default()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_lockout_window(mut self, window: Duration) -> Self {
        self.lockout_window = window;
        self
    }

    pub fn required(&self) -> bool {
        self.required
    }

    /// Current pairing state. Generates (or keeps) the pairing code while
    /// the daemon is still unpaired.
    pub async fn status(&self) -> PairingStatus {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;

        if self.required && state.token_hashes.is_empty() && state.pairing_code.is_none() {
            let code = generate_pairing_code();
            info!("pairing code: {code}");
            state.pairing_code = Some(code);
        }

        let paired = !state.token_hashes.is_empty();
        PairingStatus {
            pairing_required: self.required,
            paired,
            pairing_code: if paired {
                None
            } else {
                state.pairing_code.clone()
            },
        }
    }

    /// Check a bearer token. Always true when pairing is disabled;
    /// empty and whitespace tokens never authenticate.
    pub async fn is_authenticated(&self, token: &str) -> bool {
        if !self.required {
            return true;
        }
        let token = token.trim();
        if token.is_empty() {
            return false;
        }

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        state.token_hashes.contains(&hash_token(token))
    }

    /// Exchange the pairing code for a bearer token.
    ///
    /// On success the plaintext token is returned exactly once; only its
    /// hash is kept. The pairing code is cleared permanently.
    pub async fn try_pair(&self, code: &str, client: &str) -> Result<String, PairFailure> {
        if !self.required {
            return Err(PairFailure::PairingDisabled);
        }

        let remaining = self.lockout_remaining(client).await;
        if remaining > 0 {
            warn!("pairing attempt from locked-out client '{client}'");
            return Err(PairFailure::Locked {
                retry_after_secs: remaining,
            });
        }

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;

        let Some(expected) = state.pairing_code.clone() else {
            return Err(PairFailure::AlreadyPaired);
        };

        if code.trim() != expected {
            drop(state);
            warn!("invalid pairing code from client '{client}'");
            return match self.record_failure(client).await {
                Some(retry_after_secs) => Err(PairFailure::Locked { retry_after_secs }),
                None => Err(PairFailure::InvalidCode),
            };
        }

        self.attempts.lock().await.remove(client);

        let token = generate_token();
        state.token_hashes.insert(hash_token(&token));
        if let Err(err) = self.store.save(&state.token_hashes).await {
            // Roll back so a retry can still succeed against the same code.
            state.token_hashes.remove(&hash_token(&token));
            return Err(PairFailure::Storage(format!("{err:#}")));
        }

        // Single use: never exposed or regenerated again.
        state.pairing_code = None;
        info!("client '{client}' paired");
        Ok(token)
    }

    async fn ensure_loaded(&self, state: &mut GuardState) {
        if state.loaded {
            return;
        }
        state.token_hashes = self.store.load().await;
        state.loaded = true;
    }

    /// Seconds of lockout left for a client; expired lockouts reset the
    /// failure counter.
    async fn lockout_remaining(&self, client: &str) -> u64 {
        let mut attempts = self.attempts.lock().await;
        let Some(record) = attempts.get_mut(client) else {
            return 0;
        };
        let Some(locked_at) = record.locked_at else {
            return 0;
        };

        let elapsed = locked_at.elapsed();
        if elapsed < self.lockout_window {
            let left = self.lockout_window - elapsed;
            return left.as_secs().max(1);
        }

        record.locked_at = None;
        record.count = 0;
        0
    }

    /// Count one failed attempt. Returns the retry-after when this attempt
    /// crossed the lockout threshold.
    async fn record_failure(&self, client: &str) -> Option<u64> {
        let mut attempts = self.attempts.lock().await;

        if attempts.len() >= ATTEMPTS_CAP && !attempts.contains_key(client) {
            let oldest = attempts
                .iter()
                .min_by_key(|(_, record)| record.last_seen)
                .map(|(identity, _)| identity.clone());
            if let Some(identity) = oldest {
                attempts.remove(&identity);
            }
        }

        let now = Instant::now();
        let record = attempts.entry(client.to_string()).or_insert(AttemptRecord {
            count: 0,
            locked_at: None,
            last_seen: now,
        });
        record.count += 1;
        record.last_seen = now;

        if record.count >= MAX_FAILURES {
            record.locked_at = Some(now);
            Some(self.lockout_window.as_secs())
        } else {
            None
        }
    }
}

fn generate_pairing_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

fn generate_token() -> String {
    format!("tk_{}", nanoid::nanoid!(32, &nanoid::alphabet::SAFE))
}
