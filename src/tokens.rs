//! Per-subscription token reservation pool.
//!
//! Tokens are the scarce budget required to back a bid. Each subscription
//! holds a row of `available`/`reserved` counters plus the individual holds
//! backing active bids. `reserved <= available` holds after every
//! operation; the registry lock makes each operation atomic so the caller
//! can pair a reservation with its bid write under one lot lock.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::types::{ReservationId, SubscriptionId};

/// Reserve failed: the subscription's budget cannot cover the request.
/// An expected business outcome, distinguishable from infrastructure faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsufficientTokens {
    pub subscription: SubscriptionId,
    pub requested: u32,
    pub available: u32,
}

impl std::fmt::Display for InsufficientTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "insufficient-tokens: {} requested {} with {} free",
            self.subscription, self.requested, self.available
        )
    }
}

/// Current balance snapshot for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBalance {
    pub available: u32,
    pub reserved: u32,
}

#[derive(Debug, Default)]
struct TokenRow {
    available: u32,
    reserved: u32,
}

#[derive(Debug, Clone, Copy)]
struct Hold {
    subscription: SubscriptionId,
    amount: u32,
}

/// Token budget tracker, one row per subscription.
///
/// No balance is cached outside the registry; every read goes through the
/// same lock as the mutations so two flows (bid placement/release and lot
/// settlement) can never observe a half-applied balance.
pub struct TokenPool {
    inner: Mutex<PoolInner>,
    next_reservation: AtomicU64,
}

#[derive(Default)]
struct PoolInner {
    rows: FxHashMap<SubscriptionId, TokenRow>,
    holds: FxHashMap<ReservationId, Hold>,
}

impl TokenPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            next_reservation: AtomicU64::new(1),
        }
    }

    /// Add tokens to a subscription's budget (subscription purchase/upgrade).
    pub fn grant(&self, subscription: SubscriptionId, tokens: u32) {
        let mut inner = self.inner.lock();
        let row = inner.rows.entry(subscription).or_default();
        row.available += tokens;
        debug!("[TOKENS] granted {} tokens to {} (available={})", tokens, subscription, row.available);
    }

    /// Reserve tokens against a subscription's free budget.
    pub fn reserve(
        &self,
        subscription: SubscriptionId,
        amount: u32,
    ) -> Result<ReservationId, InsufficientTokens> {
        let mut inner = self.inner.lock();
        let row = inner.rows.entry(subscription).or_default();
        let free = row.available - row.reserved;
        if amount > free {
            return Err(InsufficientTokens {
                subscription,
                requested: amount,
                available: free,
            });
        }
        row.reserved += amount;
        let id = ReservationId(self.next_reservation.fetch_add(1, Ordering::Relaxed));
        inner.holds.insert(id, Hold { subscription, amount });
        Ok(id)
    }

    /// Release a hold back to the free budget.
    ///
    /// Idempotent: releasing an unknown or already-settled reservation is a
    /// no-op returning `false`, so the "exactly once at lot close" rule
    /// cannot double-credit a budget.
    pub fn release(&self, reservation: ReservationId) -> bool {
        let mut inner = self.inner.lock();
        let Some(hold) = inner.holds.remove(&reservation) else {
            return false;
        };
        let row = inner
            .rows
            .get_mut(&hold.subscription)
            .expect("hold without row");
        row.reserved -= hold.amount;
        debug!("[TOKENS] released {} ({} tokens for {})", reservation, hold.amount, hold.subscription);
        true
    }

    /// Permanently consume a hold on a paid win.
    ///
    /// Removes the tokens from both `reserved` and `available`; also a
    /// no-op on an unknown reservation.
    pub fn commit(&self, reservation: ReservationId) -> bool {
        let mut inner = self.inner.lock();
        let Some(hold) = inner.holds.remove(&reservation) else {
            return false;
        };
        let row = inner
            .rows
            .get_mut(&hold.subscription)
            .expect("hold without row");
        row.reserved -= hold.amount;
        row.available -= hold.amount;
        debug!("[TOKENS] committed {} ({} tokens for {})", reservation, hold.amount, hold.subscription);
        true
    }

    /// Balance snapshot for a subscription.
    pub fn balance(&self, subscription: SubscriptionId) -> TokenBalance {
        let inner = self.inner.lock();
        match inner.rows.get(&subscription) {
            Some(row) => TokenBalance {
                available: row.available,
                reserved: row.reserved,
            },
            None => TokenBalance {
                available: 0,
                reserved: 0,
            },
        }
    }
}

impl Default for TokenPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUB: SubscriptionId = SubscriptionId(1);

    #[test]
    fn test_reserve_within_budget() {
        let pool = TokenPool::new();
        pool.grant(SUB, 3);
        let r = pool.reserve(SUB, 2).unwrap();
        let bal = pool.balance(SUB);
        assert_eq!(bal.available, 3);
        assert_eq!(bal.reserved, 2);
        assert!(pool.release(r));
        assert_eq!(pool.balance(SUB).reserved, 0);
    }

    #[test]
    fn test_reserve_over_budget_is_business_outcome() {
        let pool = TokenPool::new();
        pool.grant(SUB, 1);
        pool.reserve(SUB, 1).unwrap();
        let err = pool.reserve(SUB, 1).unwrap_err();
        assert_eq!(err.requested, 1);
        assert_eq!(err.available, 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = TokenPool::new();
        pool.grant(SUB, 2);
        let r = pool.reserve(SUB, 2).unwrap();
        assert!(pool.release(r));
        assert!(!pool.release(r));
        let bal = pool.balance(SUB);
        assert_eq!(bal.reserved, 0);
        assert_eq!(bal.available, 2);
    }

    #[test]
    fn test_commit_consumes_budget() {
        let pool = TokenPool::new();
        pool.grant(SUB, 2);
        let r = pool.reserve(SUB, 1).unwrap();
        assert!(pool.commit(r));
        let bal = pool.balance(SUB);
        assert_eq!(bal.available, 1);
        assert_eq!(bal.reserved, 0);
        // Committed hold cannot be released afterwards
        assert!(!pool.release(r));
    }

    #[test]
    fn test_reserved_never_exceeds_available_under_concurrency() {
        use std::sync::Arc;
        let pool = Arc::new(TokenPool::new());
        pool.grant(SUB, 50);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Ok(r) = pool.reserve(SUB, 1) {
                        let bal = pool.balance(SUB);
                        assert!(bal.reserved <= bal.available);
                        pool.release(r);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let bal = pool.balance(SUB);
        assert_eq!(bal.reserved, 0);
        assert_eq!(bal.available, 50);
    }
}
