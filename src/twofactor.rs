//! Step-up (2FA) challenge gate for sensitive actions.
//!
//! Challenges are single-use with a short fixed TTL. Successful
//! verification consumes the challenge immediately; a second attempt with
//! the same id reads as expired even inside the time window, which keeps a
//! replayed confirmation from re-opening a checkout.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::types::{ChallengeId, UserId};

/// Outcome of a challenge verification. Business outcomes, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    InvalidCode,
    /// Expired, consumed, or unknown — indistinguishable on purpose
    Expired,
}

/// An issued step-up challenge
#[derive(Debug, Clone)]
pub struct StepUpChallenge {
    pub id: ChallengeId,
    pub user: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    code: String,
    consumed: bool,
}

impl StepUpChallenge {
    /// The code to deliver out-of-band. Exposed for the delivery channel
    /// and for tests; never logged.
    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Challenge issuer and verifier.
pub struct TwoFactorGate {
    ttl_secs: u64,
    challenges: Mutex<FxHashMap<ChallengeId, StepUpChallenge>>,
    /// Accounts with step-up enabled (fed by the external account service)
    enabled: Mutex<FxHashSet<UserId>>,
    next_id: AtomicU64,
}

impl TwoFactorGate {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            challenges: Mutex::new(FxHashMap::default()),
            enabled: Mutex::new(FxHashSet::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Mark an account as requiring step-up before checkout.
    pub fn set_enabled(&self, user: UserId, enabled: bool) {
        let mut set = self.enabled.lock();
        if enabled {
            set.insert(user);
        } else {
            set.remove(&user);
        }
    }

    pub fn is_enabled(&self, user: UserId) -> bool {
        self.enabled.lock().contains(&user)
    }

    /// Issue a fresh challenge for a user.
    pub fn issue_challenge(&self, user: UserId) -> StepUpChallenge {
        let now = Utc::now();
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let challenge = StepUpChallenge {
            id: ChallengeId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            user,
            issued_at: now,
            expires_at: now + Duration::seconds(self.ttl_secs as i64),
            code,
            consumed: false,
        };

        let mut challenges = self.challenges.lock();
        // Purge dead entries while we hold the lock
        challenges.retain(|_, c| !c.consumed && c.expires_at > now);
        challenges.insert(challenge.id, challenge.clone());
        info!("[2FA] issued {} for {}", challenge.id, user);
        challenge
    }

    /// Look up a live challenge (the out-of-band delivery channel reads
    /// the code through this).
    pub fn challenge(&self, id: ChallengeId) -> Option<StepUpChallenge> {
        self.challenges.lock().get(&id).cloned()
    }

    /// Verify a code against a challenge. Consumes the challenge on
    /// success; a consumed or unknown id reads as `Expired`.
    pub fn verify(&self, id: ChallengeId, code: &str) -> VerifyOutcome {
        let now = Utc::now();
        let mut challenges = self.challenges.lock();
        let Some(challenge) = challenges.get_mut(&id) else {
            return VerifyOutcome::Expired;
        };
        if challenge.consumed || challenge.expires_at <= now {
            return VerifyOutcome::Expired;
        }
        if challenge.code != code {
            return VerifyOutcome::InvalidCode;
        }
        challenge.consumed = true;
        info!("[2FA] verified {} for {}", id, challenge.user);
        VerifyOutcome::Ok
    }
}
