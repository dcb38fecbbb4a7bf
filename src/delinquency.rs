//! Periodic delinquency sweep.
//!
//! The only component that initiates state changes without a direct caller
//! request: it expires unpaid wins past their payment deadline (driving
//! reassignment through the auction state machine's guarded transitions)
//! and expires pending transactions whose checkout session outlived its
//! TTL. Each lot's reassignment is an independent atomic step — one lot
//! failing does not block the rest — and every applied transition is
//! written to the audit trail.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditLog, AuditRecord};
use crate::auction::AuctionEngine;
use crate::reconciler::TransactionReconciler;

/// Summary of one sweep pass
#[derive(Debug, Default, Clone)]
pub struct SweepSummary {
    pub lots_reassigned: usize,
    pub transactions_expired: usize,
}

/// The delinquency monitor.
pub struct DelinquencyMonitor {
    auction: Arc<AuctionEngine>,
    reconciler: Arc<TransactionReconciler>,
    audit: Arc<AuditLog>,
    interval_secs: u64,
}

impl DelinquencyMonitor {
    pub fn new(
        auction: Arc<AuctionEngine>,
        reconciler: Arc<TransactionReconciler>,
        audit: Arc<AuditLog>,
        interval_secs: u64,
    ) -> Self {
        Self {
            auction,
            reconciler,
            audit,
            interval_secs,
        }
    }

    /// Run the sweep until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("[SWEEP] delinquency sweep running (interval: {}s)", self.interval_secs);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.interval_secs));
        interval.tick().await; // Skip immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[SWEEP] shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let summary = self.sweep_once().await;
                    if summary.lots_reassigned > 0 || summary.transactions_expired > 0 {
                        info!(
                            "[SWEEP] pass complete: {} lot(s) reassigned, {} transaction(s) expired",
                            summary.lots_reassigned, summary.transactions_expired
                        );
                    }
                }
            }
        }
    }

    /// One sweep pass. Public so tests (and admin tooling) can drive it
    /// deterministically.
    pub async fn sweep_once(&self) -> SweepSummary {
        let now = Utc::now();
        let mut summary = SweepSummary::default();

        // (a) expired payment deadlines -> reassignment, one lot at a time
        for lot in self.auction.lots_past_deadline(now).await {
            match self.auction.expire_deadline(lot, now).await {
                Ok(Some(outcome)) => {
                    summary.lots_reassigned += 1;
                    let detail = match &outcome.promoted {
                        Some(bid) => format!(
                            "prior {} cancelled, promoted {} at {}¢",
                            outcome.prior_winner, bid.id, bid.amount_cents
                        ),
                        None => format!(
                            "prior {} cancelled, no eligible bidder, lot relisted",
                            outcome.prior_winner
                        ),
                    };
                    if let Err(e) = self.audit.record(AuditRecord::sweep("reassign", &detail).lot(lot)) {
                        warn!("[SWEEP] audit write failed: {:#}", e);
                    }
                }
                // Settlement or an admin beat us to the lot; nothing to do
                Ok(None) => {}
                Err(e) => warn!("[SWEEP] reassignment of {} rejected: {}", lot, e),
            }
        }

        // (b) stale checkout sessions -> expired transactions
        for tx in self.reconciler.expire_stale().await {
            summary.transactions_expired += 1;
            if let Err(e) = self
                .audit
                .record(AuditRecord::sweep("expire_transaction", "checkout session TTL").tx(tx))
            {
                warn!("[SWEEP] audit write failed: {:#}", e);
            }
        }

        summary
    }
}
