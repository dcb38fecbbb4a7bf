//! Append-only bid ledger with per-lot ranking.
//!
//! Bids are ranked strictly by amount — ties are rejected outright, so the
//! leading bid is always unambiguous. Non-selected active bids keep their
//! token reservations until the lot closes; only at close are they
//! superseded and their reservations released, so an outbid bidder can
//! re-bid cheaply before the close.

use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::info;

use crate::tokens::TokenPool;
use crate::types::{Bid, BidId, BidRejection, BidState, Cents, Lot, LotId, SubscriptionId, UserId};

/// Tokens reserved per placed bid
pub const TOKENS_PER_BID: u32 = 1;

/// Result of fixing a lot's ranking at close time
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    /// The sole winner candidate, now `winning_pending`
    pub winner: Option<Bid>,
    /// Bids moved to `superseded` (reservations released)
    pub superseded: Vec<BidId>,
}

#[derive(Default)]
struct LedgerInner {
    bids: FxHashMap<BidId, Bid>,
    by_lot: FxHashMap<LotId, Vec<BidId>>,
    next_id: u64,
}

/// Append-only record of bids per lot. Depends on [`TokenPool`] so a
/// reservation is created atomically with its bid and released atomically
/// with the bid's terminal state (both under the caller's lot lock).
pub struct BidLedger {
    pool: Arc<TokenPool>,
    max_failed_attempts: u32,
    inner: Mutex<LedgerInner>,
}

impl BidLedger {
    pub fn new(pool: Arc<TokenPool>, max_failed_attempts: u32) -> Self {
        Self {
            pool,
            max_failed_attempts,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Place a bid on a lot. The caller must hold the lot lock so the
    /// ranking decision serializes with concurrent placements on the same
    /// lot.
    pub fn place_bid(
        &self,
        lot: &Lot,
        bidder: UserId,
        subscription: SubscriptionId,
        amount_cents: Cents,
    ) -> Result<Bid, BidRejection> {
        if lot.state != crate::types::LotState::Active {
            return Err(BidRejection::LotNotActive);
        }
        if lot.is_disqualified(bidder, self.max_failed_attempts) {
            return Err(BidRejection::BidderDisqualifiedOnLot);
        }

        let mut inner = self.inner.lock();
        let floor = Self::highest_active_locked(&inner, lot.id)
            .map(|b| b.amount_cents)
            .unwrap_or(0);
        // First bid must meet the base price; later bids must strictly
        // outrank the current leader. Equal amounts are rejected.
        if floor == 0 {
            if amount_cents < lot.base_price_cents {
                return Err(BidRejection::AmountNotGreaterThanCurrentHighest);
            }
        } else if amount_cents <= floor {
            return Err(BidRejection::AmountNotGreaterThanCurrentHighest);
        }

        let reservation = self
            .pool
            .reserve(subscription, TOKENS_PER_BID)
            .map_err(|_| BidRejection::InsufficientTokens)?;

        inner.next_id += 1;
        let bid = Bid {
            id: BidId(inner.next_id),
            lot: lot.id,
            bidder,
            subscription,
            amount_cents,
            state: BidState::Active,
            placed_at: Utc::now(),
            reservation: Some(reservation),
        };
        inner.bids.insert(bid.id, bid.clone());
        inner.by_lot.entry(lot.id).or_default().push(bid.id);
        info!(
            "[LEDGER] {} placed {} on {} at {}¢",
            bidder, bid.id, lot.id, amount_cents
        );
        Ok(bid)
    }

    fn highest_active_locked(inner: &LedgerInner, lot: LotId) -> Option<&Bid> {
        inner
            .by_lot
            .get(&lot)?
            .iter()
            .filter_map(|id| inner.bids.get(id))
            .filter(|b| b.state == BidState::Active)
            .max_by_key(|b| b.amount_cents)
    }

    /// Current leading active bid on a lot.
    pub fn highest_bid(&self, lot: LotId) -> Option<Bid> {
        let inner = self.inner.lock();
        Self::highest_active_locked(&inner, lot).cloned()
    }

    /// Fix the ranking at the closing instant: the highest active bid
    /// becomes the sole winner candidate, every other active bid is
    /// superseded and its reservation released exactly once.
    pub fn close_ranking(&self, lot: LotId) -> CloseOutcome {
        let mut inner = self.inner.lock();
        let winner_id = Self::highest_active_locked(&inner, lot).map(|b| b.id);

        let lot_bids: Vec<BidId> = inner.by_lot.get(&lot).cloned().unwrap_or_default();
        let mut superseded = Vec::new();
        for id in lot_bids {
            let Some(bid) = inner.bids.get_mut(&id) else {
                continue;
            };
            if bid.state != BidState::Active {
                continue;
            }
            if Some(id) == winner_id {
                bid.state = BidState::WinningPending;
            } else {
                bid.state = BidState::Superseded;
                if let Some(r) = bid.reservation.take() {
                    self.pool.release(r);
                }
                superseded.push(id);
            }
        }

        let winner = winner_id.and_then(|id| inner.bids.get(&id).cloned());
        CloseOutcome { winner, superseded }
    }

    /// Next-highest candidate for reassignment: the best superseded bid
    /// whose bidder is not disqualified on this lot.
    pub fn next_candidate(&self, lot: &Lot) -> Option<Bid> {
        let inner = self.inner.lock();
        inner
            .by_lot
            .get(&lot.id)?
            .iter()
            .filter_map(|id| inner.bids.get(id))
            .filter(|b| b.state == BidState::Superseded)
            .filter(|b| !lot.is_disqualified(b.bidder, self.max_failed_attempts))
            .max_by_key(|b| b.amount_cents)
            .cloned()
    }

    /// Promote a bid to `winning_pending` (reassignment / revert).
    /// The bid's released reservation is never resurrected.
    pub fn promote(&self, id: BidId) -> Option<Bid> {
        self.set_state(id, BidState::WinningPending)
    }

    /// Mark the winner paid and permanently consume its reservation if it
    /// is still held.
    pub fn mark_paid(&self, id: BidId) -> Option<Bid> {
        let mut inner = self.inner.lock();
        let bid = inner.bids.get_mut(&id)?;
        bid.state = BidState::WinningPaid;
        if let Some(r) = bid.reservation.take() {
            self.pool.commit(r);
        }
        Some(bid.clone())
    }

    /// Cancel a bid (delinquency or admin), releasing any held reservation.
    pub fn cancel(&self, id: BidId) -> Option<Bid> {
        let mut inner = self.inner.lock();
        let bid = inner.bids.get_mut(&id)?;
        bid.state = BidState::Cancelled;
        if let Some(r) = bid.reservation.take() {
            self.pool.release(r);
        }
        Some(bid.clone())
    }

    fn set_state(&self, id: BidId, state: BidState) -> Option<Bid> {
        let mut inner = self.inner.lock();
        let bid = inner.bids.get_mut(&id)?;
        bid.state = state;
        Some(bid.clone())
    }

    pub fn get(&self, id: BidId) -> Option<Bid> {
        self.inner.lock().bids.get(&id).cloned()
    }

    /// All bids on a lot, placement order.
    pub fn bids_for_lot(&self, lot: LotId) -> Vec<Bid> {
        let inner = self.inner.lock();
        inner
            .by_lot
            .get(&lot)
            .map(|ids| ids.iter().filter_map(|id| inner.bids.get(id)).cloned().collect())
            .unwrap_or_default()
    }
}
