//! Typed facade over the engine components.
//!
//! `AuctionService` wires the token pool, bid ledger, auction state
//! machine, two-factor gate, and transaction reconciler behind the
//! request/response operations the API layer exposes. Checkout initiation
//! is split in two so step-up can interpose: the first call returns either
//! a redirect or a transient step-up reference, and the verification call
//! exchanges that reference for the real redirect.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditLog, AuditRecord};
use crate::auction::{AuctionEngine, PaymentWindow, ReassignOutcome, ReassignReason};
use crate::config::EnginePolicy;
use crate::gateway::{GatewayReport, PaymentGateway};
use crate::ledger::BidLedger;
use crate::reconciler::{
    CheckoutCreated, CheckoutPrecheck, ReconcileError, SettlementSink, TransactionReconciler,
};
use crate::tokens::TokenPool;
use crate::twofactor::{TwoFactorGate, VerifyOutcome};
use crate::types::{
    Bid, BidId, Cents, ChallengeId, Lot, LotId, PaymentGatewayRecord, ProjectId, Rejection,
    SubscriptionId, Transaction, TxId, TxLink, TxState, TxType, UserId,
};

/// Service-level error: a business rejection with a stable reason code, or
/// an infrastructure failure. The two are never conflated.
#[derive(Debug)]
pub enum ServiceError {
    Rejected(Rejection),
    Infra(anyhow::Error),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Rejected(r) => write!(f, "{}", r),
            ServiceError::Infra(e) => write!(f, "infrastructure: {:#}", e),
        }
    }
}

impl From<Rejection> for ServiceError {
    fn from(r: Rejection) -> Self {
        ServiceError::Rejected(r)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        ServiceError::Infra(e)
    }
}

impl From<crate::auction::AuctionError> for ServiceError {
    fn from(e: crate::auction::AuctionError) -> Self {
        ServiceError::Rejected(e.into())
    }
}

impl From<ReconcileError> for ServiceError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Infra(inner) => ServiceError::Infra(inner),
            other => ServiceError::Rejected(
                other.rejection().unwrap_or(Rejection::NotFound),
            ),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Outcome of checkout initiation
#[derive(Debug, Clone)]
pub enum CheckoutStart {
    /// No step-up required: the payer goes straight to the gateway
    Redirect {
        tx: Transaction,
        redirect_url: String,
    },
    /// Step-up required: the transient reference to exchange after
    /// verification. No redirect is leaked before the code is confirmed.
    StepUpRequired { challenge: ChallengeId },
}

#[derive(Debug, Clone, Copy)]
struct PendingCheckout {
    bid: BidId,
    user: UserId,
}

/// Routes settlement notifications from the reconciler into the auction
/// state machine (bid-type) or out to the external subscription ledger.
/// Idempotent by construction: the auction settle path is replay-safe.
struct CoreSettlementSink {
    auction: Arc<AuctionEngine>,
}

#[async_trait]
impl SettlementSink for CoreSettlementSink {
    async fn apply_settlement(&self, link: &TxLink) -> Result<()> {
        match link {
            TxLink::Bid(bid) => {
                self.auction
                    .mark_settled(*bid)
                    .await
                    .map_err(|e| anyhow::anyhow!("settlement rejected by auction: {}", e))?;
                Ok(())
            }
            TxLink::Subscription(sub) | TxLink::Monthly(sub) => {
                // External collaborator; consumed through its contract only
                info!("[SERVICE] notifying subscription ledger for {}", sub);
                Ok(())
            }
            TxLink::Investment(inv) => {
                info!("[SERVICE] notifying investment ledger for {}", inv);
                Ok(())
            }
        }
    }
}

/// The engine facade.
pub struct AuctionService {
    pool: Arc<TokenPool>,
    auction: Arc<AuctionEngine>,
    gate: Arc<TwoFactorGate>,
    reconciler: Arc<TransactionReconciler>,
    audit: Arc<AuditLog>,
    pending_stepups: Mutex<FxHashMap<ChallengeId, PendingCheckout>>,
}

impl AuctionService {
    pub fn new(
        policy: &EnginePolicy,
        gateway: Arc<dyn PaymentGateway>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let pool = Arc::new(TokenPool::new());
        let ledger = Arc::new(BidLedger::new(
            Arc::clone(&pool),
            policy.max_failed_attempts,
        ));
        let auction = Arc::new(AuctionEngine::new(
            ledger,
            policy.max_failed_attempts,
            policy.payment_deadline_secs,
        ));
        let sink = Arc::new(CoreSettlementSink {
            auction: Arc::clone(&auction),
        });
        let reconciler = Arc::new(TransactionReconciler::new(
            gateway,
            sink,
            policy.checkout_session_ttl_secs,
        ));
        let gate = Arc::new(TwoFactorGate::new(policy.challenge_ttl_secs));

        Self {
            pool,
            auction,
            gate,
            reconciler,
            audit,
            pending_stepups: Mutex::new(FxHashMap::default()),
        }
    }

    // Component handles for setup flows and the delinquency monitor

    pub fn tokens(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    pub fn auction(&self) -> &Arc<AuctionEngine> {
        &self.auction
    }

    pub fn gate(&self) -> &Arc<TwoFactorGate> {
        &self.gate
    }

    pub fn reconciler(&self) -> &Arc<TransactionReconciler> {
        &self.reconciler
    }

    // === Lot lifecycle ===

    pub fn create_lot(&self, project: ProjectId, base_price_cents: Cents) -> Lot {
        self.auction.create_lot(project, base_price_cents)
    }

    pub async fn start_auction(&self, lot: LotId) -> ServiceResult<Lot> {
        Ok(self.auction.start(lot).await?)
    }

    pub async fn end_auction(&self, lot: LotId) -> ServiceResult<Lot> {
        Ok(self.auction.begin_close(lot).await?)
    }

    /// Close the lot and fix the winner (if any).
    pub async fn finalize_close(&self, lot: LotId) -> ServiceResult<Option<Bid>> {
        Ok(self.auction.finalize_close(lot).await?)
    }

    pub async fn get_lot(&self, lot: LotId) -> ServiceResult<Lot> {
        self.auction
            .get_lot(lot)
            .await
            .ok_or(ServiceError::Rejected(Rejection::NotFound))
    }

    // === Bidding ===

    pub async fn place_bid(
        &self,
        lot: LotId,
        bidder: UserId,
        subscription: SubscriptionId,
        amount_cents: Cents,
    ) -> ServiceResult<Bid> {
        Ok(self
            .auction
            .place_bid(lot, bidder, subscription, amount_cents)
            .await?)
    }

    // === Checkout + step-up ===

    /// Start checkout for a won bid. Returns a direct redirect, or a
    /// step-up reference when the account requires 2FA.
    pub async fn initiate_checkout(&self, user: UserId, bid: BidId) -> ServiceResult<CheckoutStart> {
        let bid_rec = self
            .auction
            .ledger()
            .get(bid)
            .ok_or(ServiceError::Rejected(Rejection::NotFound))?;
        if bid_rec.bidder != user {
            return Err(ServiceError::Rejected(Rejection::NotFound));
        }

        if self.gate.is_enabled(user) {
            let challenge = self.gate.issue_challenge(user);
            {
                let mut pending = self.pending_stepups.lock();
                // The gate just purged its dead challenges; drop the
                // checkouts abandoned with them
                pending.retain(|id, _| self.gate.challenge(*id).is_some());
                pending.insert(challenge.id, PendingCheckout { bid, user });
            }
            info!("[SERVICE] checkout for {} gated behind {}", bid, challenge.id);
            return Ok(CheckoutStart::StepUpRequired {
                challenge: challenge.id,
            });
        }

        self.open_bid_checkout(bid).await
    }

    /// Exchange a verified step-up reference for the actual redirect.
    pub async fn confirm_step_up(
        &self,
        challenge: ChallengeId,
        code: &str,
    ) -> ServiceResult<CheckoutStart> {
        let pending = self
            .pending_stepups
            .lock()
            .get(&challenge)
            .copied()
            .ok_or(ServiceError::Rejected(Rejection::ExpiredChallenge))?;

        match self.gate.verify(challenge, code) {
            VerifyOutcome::Ok => {
                self.pending_stepups.lock().remove(&challenge);
                info!(
                    "[SERVICE] step-up {} verified for {}, opening checkout",
                    challenge, pending.user
                );
                self.open_bid_checkout(pending.bid).await
            }
            // The challenge survives a wrong code; the caller may retry
            VerifyOutcome::InvalidCode => Err(ServiceError::Rejected(Rejection::InvalidCode)),
            VerifyOutcome::Expired => {
                self.pending_stepups.lock().remove(&challenge);
                Err(ServiceError::Rejected(Rejection::ExpiredChallenge))
            }
        }
    }

    async fn open_bid_checkout(&self, bid: BidId) -> ServiceResult<CheckoutStart> {
        let bid_rec = self
            .auction
            .ledger()
            .get(bid)
            .ok_or(ServiceError::Rejected(Rejection::NotFound))?;
        // Pre-condition check at the instant of checkout creation
        let precheck = match self.auction.payment_window(bid).await {
            PaymentWindow::Open => CheckoutPrecheck::Open,
            PaymentWindow::Closed => CheckoutPrecheck::Closed,
        };

        let CheckoutCreated { tx, redirect_url } = self
            .reconciler
            .open_checkout(TxType::Bid, TxLink::Bid(bid), bid_rec.amount_cents, precheck)
            .await?;
        Ok(CheckoutStart::Redirect { tx, redirect_url })
    }

    // === Reconciliation entry points ===

    /// Gateway webhook push.
    pub async fn handle_gateway_report(&self, report: &GatewayReport) -> ServiceResult<Transaction> {
        Ok(self.reconciler.apply_report(report).await?)
    }

    /// Transaction status, optionally re-polling the gateway first.
    pub async fn payment_status(
        &self,
        tx: TxId,
        refresh: bool,
    ) -> ServiceResult<(Transaction, Option<PaymentGatewayRecord>)> {
        if refresh {
            self.reconciler.refresh(tx).await?;
        }
        self.reconciler
            .get(tx)
            .await
            .ok_or(ServiceError::Rejected(Rejection::NotFound))
    }

    // === Admin overrides ===

    /// Admin force-confirm: re-query the gateway and apply its verdict.
    pub async fn force_confirm(&self, tx: TxId) -> ServiceResult<Transaction> {
        let result = self.reconciler.force_confirm(tx).await?;
        self.audit_admin(
            AuditRecord::admin("force_confirm", &format!("gateway state applied: {}", result.state))
                .tx(tx),
        );
        Ok(result)
    }

    /// Admin "simulate non-payment": force the payment deadline on a lot
    /// with a pending winner, triggering the reassignment path.
    pub async fn simulate_default(&self, lot: LotId) -> ServiceResult<ReassignOutcome> {
        let outcome = self
            .auction
            .reassign(lot, ReassignReason::DeadlineExpired)
            .await?;
        self.audit_admin(
            AuditRecord::admin("simulate_default", &reassign_detail(&outcome)).lot(lot),
        );
        Ok(outcome)
    }

    /// Admin cancel of the current winning bid (pending or paid).
    pub async fn cancel_winning_bid(&self, bid: BidId) -> ServiceResult<ReassignOutcome> {
        let bid_rec = self
            .auction
            .ledger()
            .get(bid)
            .ok_or(ServiceError::Rejected(Rejection::NotFound))?;
        let lot = self
            .auction
            .get_lot(bid_rec.lot)
            .await
            .ok_or(ServiceError::Rejected(Rejection::NotFound))?;
        if lot.winner != Some(bid) {
            return Err(ServiceError::Rejected(Rejection::NoPendingWinner));
        }

        let outcome = self
            .auction
            .reassign(bid_rec.lot, ReassignReason::AdminCancel)
            .await?;
        self.audit_admin(
            AuditRecord::admin("cancel_winning_bid", &reassign_detail(&outcome))
                .lot(bid_rec.lot)
                .bid(bid),
        );
        Ok(outcome)
    }

    /// Admin correction of an erroneous confirmation: the transaction moves
    /// `paid -> reverted`, the linked bid back to `winning_pending` with a
    /// fresh deadline. Released token reservations are not resurrected.
    ///
    /// Either both sides apply or neither does: the lot side goes first
    /// because it rejects without mutating, so a bid that is no longer the
    /// paid winner leaves the transaction `paid` and still refundable.
    pub async fn revert_transaction(&self, tx: TxId) -> ServiceResult<Transaction> {
        let (stored, _) = self
            .reconciler
            .get(tx)
            .await
            .ok_or(ServiceError::Rejected(Rejection::NotFound))?;
        let TxLink::Bid(bid) = stored.link else {
            return Err(ServiceError::Rejected(Rejection::TxNotRefundable));
        };
        if stored.state != TxState::Paid {
            return Err(ServiceError::Rejected(Rejection::TxNotRefundable));
        }

        self.auction.revert_winner_payment(bid).await?;
        let reverted_tx = match self.reconciler.unwind(tx, TxState::Reverted).await {
            Ok(t) => t,
            Err(e) => {
                // The transaction row changed under us; put the win back so
                // the two sides stay consistent.
                if let Err(restore) = self.auction.mark_settled(bid).await {
                    warn!(
                        "[SERVICE] could not restore {} after failed revert of {}: {}",
                        bid, tx, restore
                    );
                }
                return Err(e.into());
            }
        };
        self.audit_admin(
            AuditRecord::admin("revert_transaction", "winning_paid -> winning_pending")
                .bid(bid)
                .tx(tx),
        );
        Ok(reverted_tx)
    }

    /// Admin refund of a paid transaction (no lot-side effect).
    pub async fn refund_transaction(&self, tx: TxId) -> ServiceResult<Transaction> {
        let refunded = self.reconciler.unwind(tx, TxState::Refunded).await?;
        self.audit_admin(AuditRecord::admin("refund", "paid -> refunded").tx(tx));
        Ok(refunded)
    }

    fn audit_admin(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(record) {
            warn!("[SERVICE] audit write failed: {:#}", e);
        }
    }

    #[cfg(test)]
    fn pending_stepups_len(&self) -> usize {
        self.pending_stepups.lock().len()
    }
}

fn reassign_detail(outcome: &ReassignOutcome) -> String {
    match &outcome.promoted {
        Some(bid) => format!(
            "prior {} cancelled, promoted {} at {}¢",
            outcome.prior_winner, bid.id, bid.amount_cents
        ),
        None => format!("prior {} cancelled, no eligible bidder", outcome.prior_winner),
    }
}
