//! Lot lifecycle state machine.
//!
//! Owns the `scheduled → active → closing → closed` lifecycle, the
//! close-time winner pick, delinquency reassignment, and the admin
//! override paths. Every transition is guarded: an attempt from a state
//! that does not permit it is rejected with an invalid-transition result,
//! never silently coerced — this is what makes the periodic sweep safe to
//! race against manual admin actions on the same lot.
//!
//! Each lot row carries its own async mutex, so concurrent bid placements
//! on one lot serialize on that lot's ranking decision while other lots
//! proceed independently.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ledger::BidLedger;
use crate::types::{
    Bid, BidId, BidRejection, BidState, Cents, InvalidTransition, Lot, LotId, LotState, ProjectId,
    Rejection, SubscriptionId, UserId,
};

/// Business rejections surfaced by auction operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuctionError {
    NotFound(LotId),
    BidNotFound(BidId),
    Transition(InvalidTransition),
    Bid(BidRejection),
    /// Operation requires a `winning_pending` bid and the lot has none
    NoPendingWinner(LotId),
}

impl std::fmt::Display for AuctionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuctionError::NotFound(lot) => write!(f, "not-found: {}", lot),
            AuctionError::BidNotFound(bid) => write!(f, "not-found: {}", bid),
            AuctionError::Transition(t) => write!(f, "{}", t),
            AuctionError::Bid(r) => write!(f, "{}", r),
            AuctionError::NoPendingWinner(lot) => write!(f, "no-pending-winner: {}", lot),
        }
    }
}

impl From<AuctionError> for Rejection {
    fn from(e: AuctionError) -> Self {
        match e {
            AuctionError::NotFound(_) | AuctionError::BidNotFound(_) => Rejection::NotFound,
            AuctionError::Transition(_) => Rejection::InvalidTransition,
            AuctionError::Bid(r) => r.into(),
            AuctionError::NoPendingWinner(_) => Rejection::NoPendingWinner,
        }
    }
}

/// Why a reassignment was triggered (for logs and audit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignReason {
    DeadlineExpired,
    AdminCancel,
}

impl std::fmt::Display for ReassignReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReassignReason::DeadlineExpired => write!(f, "deadline_expired"),
            ReassignReason::AdminCancel => write!(f, "admin_cancel"),
        }
    }
}

/// Result of a reassignment step
#[derive(Debug, Clone)]
pub struct ReassignOutcome {
    pub lot: LotId,
    pub prior_winner: BidId,
    /// Next-highest eligible bid promoted to `winning_pending`, if any.
    /// `None` means the lot went back to `scheduled` for manual relisting.
    pub promoted: Option<Bid>,
}

/// Whether a checkout target is still open at the instant of checkout
/// creation (reconciler pre-condition check).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentWindow {
    Open,
    Closed,
}

type LotRow = Arc<tokio::sync::Mutex<Lot>>;

/// The auction state machine over all lots.
pub struct AuctionEngine {
    ledger: Arc<BidLedger>,
    max_failed_attempts: u32,
    payment_deadline_secs: u64,
    lots: Mutex<FxHashMap<LotId, LotRow>>,
    next_lot: AtomicU64,
}

impl AuctionEngine {
    pub fn new(ledger: Arc<BidLedger>, max_failed_attempts: u32, payment_deadline_secs: u64) -> Self {
        Self {
            ledger,
            max_failed_attempts,
            payment_deadline_secs,
            lots: Mutex::new(FxHashMap::default()),
            next_lot: AtomicU64::new(0),
        }
    }

    pub fn ledger(&self) -> &Arc<BidLedger> {
        &self.ledger
    }

    fn deadline_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.payment_deadline_secs as i64)
    }

    fn row(&self, id: LotId) -> Result<LotRow, AuctionError> {
        self.lots
            .lock()
            .get(&id)
            .cloned()
            .ok_or(AuctionError::NotFound(id))
    }

    /// Register a new lot (project setup). Starts `scheduled`.
    pub fn create_lot(&self, project: ProjectId, base_price_cents: Cents) -> Lot {
        let id = LotId(self.next_lot.fetch_add(1, Ordering::Relaxed) + 1);
        let lot = Lot::new(id, project, base_price_cents);
        self.lots
            .lock()
            .insert(id, Arc::new(tokio::sync::Mutex::new(lot.clone())));
        info!("[AUCTION] created {} (base {}¢)", id, base_price_cents);
        lot
    }

    /// Snapshot of a lot's current state.
    pub async fn get_lot(&self, id: LotId) -> Option<Lot> {
        let row = self.row(id).ok()?;
        let lot = row.lock().await;
        Some(lot.clone())
    }

    /// Explicit start: `scheduled → active` only.
    pub async fn start(&self, id: LotId) -> Result<Lot, AuctionError> {
        let row = self.row(id)?;
        let mut lot = row.lock().await;
        if lot.state != LotState::Scheduled {
            return Err(AuctionError::Transition(InvalidTransition {
                lot: id,
                from: lot.state,
                operation: "start",
            }));
        }
        lot.state = LotState::Active;
        info!("[AUCTION] {} scheduled -> active", id);
        Ok(lot.clone())
    }

    /// Explicit end of bidding: `active → closing`.
    pub async fn begin_close(&self, id: LotId) -> Result<Lot, AuctionError> {
        let row = self.row(id)?;
        let mut lot = row.lock().await;
        if lot.state != LotState::Active {
            return Err(AuctionError::Transition(InvalidTransition {
                lot: id,
                from: lot.state,
                operation: "begin_close",
            }));
        }
        lot.state = LotState::Closing;
        info!("[AUCTION] {} active -> closing", id);
        Ok(lot.clone())
    }

    /// Fix the winner at the closing instant: `closing → closed`, the
    /// highest active bid becomes `winning_pending` with a fresh payment
    /// deadline, all other active bids are superseded and released.
    /// With no bids at all the lot returns to `scheduled` for relisting.
    pub async fn finalize_close(&self, id: LotId) -> Result<Option<Bid>, AuctionError> {
        let row = self.row(id)?;
        let mut lot = row.lock().await;
        if lot.state != LotState::Closing {
            return Err(AuctionError::Transition(InvalidTransition {
                lot: id,
                from: lot.state,
                operation: "finalize_close",
            }));
        }

        let outcome = self.ledger.close_ranking(id);
        match outcome.winner {
            Some(ref winner) => {
                lot.state = LotState::Closed;
                lot.winner = Some(winner.id);
                lot.payment_deadline = Some(self.deadline_from(Utc::now()));
                info!(
                    "[AUCTION] {} closed: winner {} at {}¢ ({} superseded)",
                    id,
                    winner.id,
                    winner.amount_cents,
                    outcome.superseded.len()
                );
            }
            None => {
                lot.state = LotState::Scheduled;
                lot.winner = None;
                lot.payment_deadline = None;
                warn!("[AUCTION] {} closed with no bids, back to scheduled", id);
            }
        }
        Ok(outcome.winner)
    }

    /// Place a bid, serialized on the lot's own lock.
    pub async fn place_bid(
        &self,
        id: LotId,
        bidder: UserId,
        subscription: SubscriptionId,
        amount_cents: Cents,
    ) -> Result<Bid, AuctionError> {
        let row = self.row(id)?;
        let lot = row.lock().await;
        self.ledger
            .place_bid(&lot, bidder, subscription, amount_cents)
            .map_err(AuctionError::Bid)
    }

    /// Settlement callback from the reconciler: the linked transaction
    /// reached `paid`. Idempotent — a second invocation for an already
    /// settled winner is a no-op, so a reconciliation race cannot
    /// double-apply side effects.
    pub async fn mark_settled(&self, bid: BidId) -> Result<Bid, AuctionError> {
        let bid_rec = self
            .ledger
            .get(bid)
            .ok_or(AuctionError::BidNotFound(bid))?;
        let row = self.row(bid_rec.lot)?;
        let mut lot = row.lock().await;

        if lot.winner != Some(bid) {
            return Err(AuctionError::Transition(InvalidTransition {
                lot: lot.id,
                from: lot.state,
                operation: "mark_settled",
            }));
        }
        match self.ledger.get(bid).map(|b| b.state) {
            Some(BidState::WinningPaid) => {
                // Already settled: replay-safe no-op
                return Ok(self.ledger.get(bid).unwrap_or(bid_rec));
            }
            Some(BidState::WinningPending) => {}
            _ => {
                return Err(AuctionError::Transition(InvalidTransition {
                    lot: lot.id,
                    from: lot.state,
                    operation: "mark_settled",
                }));
            }
        }

        let paid = self
            .ledger
            .mark_paid(bid)
            .ok_or(AuctionError::BidNotFound(bid))?;
        lot.payment_deadline = None;
        info!("[AUCTION] {} settled: {} winning_pending -> winning_paid", lot.id, bid);
        Ok(paid)
    }

    /// Admin "cancel winning bid" or deadline expiry: push the lot through
    /// reassignment. The prior winner's fail counter on this lot is
    /// incremented (capped), their bid cancelled and reservation released,
    /// and the next-highest eligible bid promoted with a fresh deadline.
    pub async fn reassign(
        &self,
        id: LotId,
        reason: ReassignReason,
    ) -> Result<ReassignOutcome, AuctionError> {
        let row = self.row(id)?;
        let mut lot = row.lock().await;
        self.reassign_locked(&mut lot, reason)
    }

    fn reassign_locked(
        &self,
        lot: &mut Lot,
        reason: ReassignReason,
    ) -> Result<ReassignOutcome, AuctionError> {
        if lot.state != LotState::Closed {
            return Err(AuctionError::Transition(InvalidTransition {
                lot: lot.id,
                from: lot.state,
                operation: "reassign",
            }));
        }
        let Some(prior) = lot.winner else {
            return Err(AuctionError::NoPendingWinner(lot.id));
        };
        let prior_bid = self
            .ledger
            .get(prior)
            .ok_or(AuctionError::BidNotFound(prior))?;
        let cancellable = match reason {
            // The sweep only expires unpaid winners
            ReassignReason::DeadlineExpired => prior_bid.state == BidState::WinningPending,
            // Admin cancel may also pull a paid winner
            ReassignReason::AdminCancel => matches!(
                prior_bid.state,
                BidState::WinningPending | BidState::WinningPaid
            ),
        };
        if !cancellable {
            return Err(AuctionError::NoPendingWinner(lot.id));
        }

        self.ledger.cancel(prior);
        let count = lot.failed_attempts.entry(prior_bid.bidder).or_insert(0);
        *count = (*count + 1).min(self.max_failed_attempts);
        info!(
            "[AUCTION] {} reassigning ({}): {} cancelled, {} now has {} failure(s)",
            lot.id, reason, prior, prior_bid.bidder, count
        );

        let promoted = self.ledger.next_candidate(lot);
        match promoted {
            Some(ref candidate) => {
                self.ledger.promote(candidate.id);
                lot.winner = Some(candidate.id);
                lot.payment_deadline = Some(self.deadline_from(Utc::now()));
                info!(
                    "[AUCTION] {} promoted {} ({}¢) to winning_pending",
                    lot.id, candidate.id, candidate.amount_cents
                );
            }
            None => {
                lot.winner = None;
                lot.payment_deadline = None;
                lot.state = LotState::Scheduled;
                warn!("[AUCTION] {} has no eligible bidder, back to scheduled", lot.id);
            }
        }

        Ok(ReassignOutcome {
            lot: lot.id,
            prior_winner: prior,
            promoted: promoted.map(|c| self.ledger.get(c.id).unwrap_or(c)),
        })
    }

    /// Admin override: move a settled lot back to awaiting payment. Opens
    /// a fresh deadline; the winner's released token reservation is never
    /// resurrected (they re-reserve through a new payment only).
    pub async fn revert_winner_payment(&self, bid: BidId) -> Result<Bid, AuctionError> {
        let bid_rec = self
            .ledger
            .get(bid)
            .ok_or(AuctionError::BidNotFound(bid))?;
        let row = self.row(bid_rec.lot)?;
        let mut lot = row.lock().await;

        if lot.state != LotState::Closed || lot.winner != Some(bid) {
            return Err(AuctionError::Transition(InvalidTransition {
                lot: lot.id,
                from: lot.state,
                operation: "revert_winner_payment",
            }));
        }
        if bid_rec.state != BidState::WinningPaid {
            return Err(AuctionError::NoPendingWinner(lot.id));
        }

        let reverted = self
            .ledger
            .promote(bid)
            .ok_or(AuctionError::BidNotFound(bid))?;
        lot.payment_deadline = Some(self.deadline_from(Utc::now()));
        info!("[AUCTION] {} reverted: {} winning_paid -> winning_pending", lot.id, bid);
        Ok(reverted)
    }

    /// Pre-condition check for checkout creation: the lot must still be
    /// awaiting this bid's payment at the instant of the check.
    pub async fn payment_window(&self, bid: BidId) -> PaymentWindow {
        let Some(bid_rec) = self.ledger.get(bid) else {
            return PaymentWindow::Closed;
        };
        let Ok(row) = self.row(bid_rec.lot) else {
            return PaymentWindow::Closed;
        };
        let lot = row.lock().await;
        let open = lot.state == LotState::Closed
            && lot.winner == Some(bid)
            && bid_rec.state == BidState::WinningPending;
        if open {
            PaymentWindow::Open
        } else {
            PaymentWindow::Closed
        }
    }

    /// Lots whose pending winner's payment deadline has passed.
    /// Each lot is checked under its own lock; expiry itself happens
    /// per-lot in [`AuctionEngine::expire_deadline`].
    pub async fn lots_past_deadline(&self, now: DateTime<Utc>) -> Vec<LotId> {
        let rows: Vec<LotRow> = self.lots.lock().values().cloned().collect();
        let mut expired = Vec::new();
        for row in rows {
            let lot = row.lock().await;
            if lot.state == LotState::Closed {
                if let (Some(winner), Some(deadline)) = (lot.winner, lot.payment_deadline) {
                    let pending = self
                        .ledger
                        .get(winner)
                        .map(|b| b.state == BidState::WinningPending)
                        .unwrap_or(false);
                    if pending && deadline <= now {
                        expired.push(lot.id);
                    }
                }
            }
        }
        expired
    }

    /// Expire one lot's payment deadline if it is still expired once the
    /// lot lock is held. Re-checks under the lock so the sweep loses
    /// cleanly to a concurrent settlement or admin action.
    pub async fn expire_deadline(
        &self,
        id: LotId,
        now: DateTime<Utc>,
    ) -> Result<Option<ReassignOutcome>, AuctionError> {
        let row = self.row(id)?;
        let mut lot = row.lock().await;
        let still_expired = lot.state == LotState::Closed
            && lot
                .payment_deadline
                .map(|deadline| deadline <= now)
                .unwrap_or(false)
            && lot
                .winner
                .and_then(|w| self.ledger.get(w))
                .map(|b| b.state == BidState::WinningPending)
                .unwrap_or(false);
        if !still_expired {
            return Ok(None);
        }
        self.reassign_locked(&mut lot, ReassignReason::DeadlineExpired)
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::TokenPool;

    fn engine() -> AuctionEngine {
        let pool = Arc::new(TokenPool::new());
        pool.grant(SubscriptionId(1), 10);
        pool.grant(SubscriptionId(2), 10);
        let ledger = Arc::new(BidLedger::new(pool, 3));
        AuctionEngine::new(ledger, 3, 3600)
    }

    #[tokio::test]
    async fn test_start_only_from_scheduled() {
        let engine = engine();
        let lot = engine.create_lot(ProjectId(1), 100);
        engine.start(lot.id).await.unwrap();
        let err = engine.start(lot.id).await.unwrap_err();
        assert!(matches!(err, AuctionError::Transition(_)));
    }

    #[tokio::test]
    async fn test_close_with_no_bids_returns_to_scheduled() {
        let engine = engine();
        let lot = engine.create_lot(ProjectId(1), 100);
        engine.start(lot.id).await.unwrap();
        engine.begin_close(lot.id).await.unwrap();
        let winner = engine.finalize_close(lot.id).await.unwrap();
        assert!(winner.is_none());
        assert_eq!(engine.get_lot(lot.id).await.unwrap().state, LotState::Scheduled);
    }

    #[tokio::test]
    async fn test_close_fixes_single_winner() {
        let engine = engine();
        let lot = engine.create_lot(ProjectId(1), 100);
        engine.start(lot.id).await.unwrap();
        engine
            .place_bid(lot.id, UserId(1), SubscriptionId(1), 100)
            .await
            .unwrap();
        let top = engine
            .place_bid(lot.id, UserId(2), SubscriptionId(2), 150)
            .await
            .unwrap();
        engine.begin_close(lot.id).await.unwrap();
        let winner = engine.finalize_close(lot.id).await.unwrap().unwrap();
        assert_eq!(winner.id, top.id);
        let lot_now = engine.get_lot(lot.id).await.unwrap();
        assert_eq!(lot_now.state, LotState::Closed);
        assert!(lot_now.payment_deadline.is_some());
    }

    #[tokio::test]
    async fn test_reassign_requires_closed_lot() {
        let engine = engine();
        let lot = engine.create_lot(ProjectId(1), 100);
        let err = engine
            .reassign(lot.id, ReassignReason::AdminCancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AuctionError::Transition(_)));
    }

    #[tokio::test]
    async fn test_unknown_bid_reports_the_bid_id() {
        let engine = engine();
        let err = engine.mark_settled(BidId(42)).await.unwrap_err();
        assert_eq!(err, AuctionError::BidNotFound(BidId(42)));
        let err = engine.revert_winner_payment(BidId(42)).await.unwrap_err();
        assert_eq!(err, AuctionError::BidNotFound(BidId(42)));
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let engine = engine();
        let lot = engine.create_lot(ProjectId(1), 100);
        engine.start(lot.id).await.unwrap();
        let bid = engine
            .place_bid(lot.id, UserId(1), SubscriptionId(1), 100)
            .await
            .unwrap();
        engine.begin_close(lot.id).await.unwrap();
        engine.finalize_close(lot.id).await.unwrap();

        let first = engine.mark_settled(bid.id).await.unwrap();
        assert_eq!(first.state, BidState::WinningPaid);
        let second = engine.mark_settled(bid.id).await.unwrap();
        assert_eq!(second.state, BidState::WinningPaid);
    }

    #[tokio::test]
    async fn test_revert_reopens_deadline_without_reservation() {
        let engine = engine();
        let lot = engine.create_lot(ProjectId(1), 100);
        engine.start(lot.id).await.unwrap();
        let bid = engine
            .place_bid(lot.id, UserId(1), SubscriptionId(1), 100)
            .await
            .unwrap();
        engine.begin_close(lot.id).await.unwrap();
        engine.finalize_close(lot.id).await.unwrap();
        engine.mark_settled(bid.id).await.unwrap();

        let reverted = engine.revert_winner_payment(bid.id).await.unwrap();
        assert_eq!(reverted.state, BidState::WinningPending);
        assert!(reverted.reservation.is_none());
        assert!(engine.get_lot(lot.id).await.unwrap().payment_deadline.is_some());
    }
}
