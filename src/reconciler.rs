//! Transaction reconciliation engine.
//!
//! Owns Transaction and PaymentGatewayRecord state and keeps it consistent
//! with the external gateway under webhook loss, replays, retries, and
//! manual admin intervention. Checkout creation is two-phase: the
//! `pending` transaction is written first, the gateway is called with no
//! domain locks held, and the result is reconciled in a second,
//! separately-locked step — a slow or failed external call cannot stall
//! bidding.
//!
//! The webhook path and the poll/force-confirm path share one transition
//! routine. Replays dedup on the gateway event id; settlement side effects
//! fire only on the single `pending -> paid` transition, and the sink is
//! itself idempotent in case reconciliation races.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::gateway::{GatewayReport, GatewayStatus, PaymentGateway};
use crate::types::{
    Cents, InvalidTxTransition, PaymentGatewayRecord, Rejection, Transaction, TxId, TxLink,
    TxState, TxType,
};

/// Receives the exactly-once settlement notification when a transaction
/// reaches `paid`. Implementations must be idempotent: a second
/// notification for the same link must be a no-op.
#[async_trait]
pub trait SettlementSink: Send + Sync {
    async fn apply_settlement(&self, link: &TxLink) -> Result<()>;
}

/// Result of the caller's pre-condition check at checkout creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutPrecheck {
    Open,
    /// Target lot/project closed between win and checkout attempt
    Closed,
    /// Capacity exhausted concurrently by other settlements
    CapacityExhausted,
}

/// A successfully opened checkout
#[derive(Debug, Clone)]
pub struct CheckoutCreated {
    pub tx: Transaction,
    pub redirect_url: String,
}

/// Errors out of reconciler operations. `Infra` is the only
/// non-business variant and is never conflated with a rejection.
#[derive(Debug)]
pub enum ReconcileError {
    NotFound(TxId),
    UnknownRef(String),
    /// Checkout target no longer open; the recorded transaction carries
    /// the terminal `rejected-*` state
    Rejected(Transaction),
    Invalid(InvalidTxTransition),
    Infra(anyhow::Error),
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::NotFound(tx) => write!(f, "not-found: {}", tx),
            ReconcileError::UnknownRef(r) => write!(f, "unknown gateway ref: {}", r),
            ReconcileError::Rejected(tx) => write!(f, "checkout rejected: {}", tx.state),
            ReconcileError::Invalid(t) => write!(f, "{}", t),
            ReconcileError::Infra(e) => write!(f, "infrastructure: {:#}", e),
        }
    }
}

impl From<anyhow::Error> for ReconcileError {
    fn from(e: anyhow::Error) -> Self {
        ReconcileError::Infra(e)
    }
}

impl ReconcileError {
    /// Business rejection code, if this is one (infra errors have none).
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            ReconcileError::NotFound(_) | ReconcileError::UnknownRef(_) => Some(Rejection::NotFound),
            ReconcileError::Rejected(tx) => Some(match tx.state {
                TxState::RejectedCapacity => Rejection::RejectedCapacity,
                _ => Rejection::RejectedClosed,
            }),
            ReconcileError::Invalid(_) => Some(Rejection::TxNotRefundable),
            ReconcileError::Infra(_) => None,
        }
    }
}

struct TxRecord {
    tx: Transaction,
    gateway: Option<PaymentGatewayRecord>,
    /// Redirect URL of the live checkout session, kept for idempotent
    /// client-retried initiation
    redirect_url: Option<String>,
}

type TxRow = Arc<tokio::sync::Mutex<TxRecord>>;

#[derive(Default)]
struct ReconcilerInner {
    rows: FxHashMap<TxId, TxRow>,
    by_external: FxHashMap<String, TxId>,
    /// Open (pending) transaction per link, for idempotent client retries
    open_by_link: FxHashMap<TxLink, TxId>,
    /// Most recent transaction per link, for admin revert lookup
    latest_by_link: FxHashMap<TxLink, TxId>,
    /// Applied gateway event dedup keys
    seen_events: FxHashSet<String>,
}

/// The reconciliation engine.
pub struct TransactionReconciler {
    gateway: Arc<dyn PaymentGateway>,
    sink: Arc<dyn SettlementSink>,
    checkout_session_ttl_secs: u64,
    inner: Mutex<ReconcilerInner>,
    next_tx: AtomicU64,
}

impl TransactionReconciler {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        sink: Arc<dyn SettlementSink>,
        checkout_session_ttl_secs: u64,
    ) -> Self {
        Self {
            gateway,
            sink,
            checkout_session_ttl_secs,
            inner: Mutex::new(ReconcilerInner::default()),
            next_tx: AtomicU64::new(0),
        }
    }

    fn mint_tx(&self, tx_type: TxType, link: TxLink, amount_cents: Cents, state: TxState) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: TxId(self.next_tx.fetch_add(1, Ordering::Relaxed) + 1),
            tx_type,
            amount_cents,
            state,
            link,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Open a checkout session.
    ///
    /// The caller performs the domain pre-condition check (lot still
    /// awaiting payment, capacity still free) and passes the verdict; a
    /// negative verdict is recorded as a terminal `rejected-*` transaction.
    ///
    /// Client retries are idempotent: an existing pending transaction for
    /// the same link is reused — with a live session its redirect is
    /// returned as-is, without one the gateway call is retried for the
    /// same transaction. On gateway unreachability the transaction stays
    /// `pending` and an infrastructure error tells the caller to retry; it
    /// is never marked `failed` by a transient network fault.
    pub async fn open_checkout(
        &self,
        tx_type: TxType,
        link: TxLink,
        amount_cents: Cents,
        precheck: CheckoutPrecheck,
    ) -> Result<CheckoutCreated, ReconcileError> {
        match precheck {
            CheckoutPrecheck::Open => {}
            CheckoutPrecheck::Closed | CheckoutPrecheck::CapacityExhausted => {
                let state = if precheck == CheckoutPrecheck::Closed {
                    TxState::RejectedClosed
                } else {
                    TxState::RejectedCapacity
                };
                let tx = self.mint_tx(tx_type, link, amount_cents, state);
                warn!("[RECON] {} rejected at checkout: {}", tx.id, tx.state);
                let mut inner = self.inner.lock();
                inner.latest_by_link.insert(link, tx.id);
                inner.rows.insert(
                    tx.id,
                    Arc::new(tokio::sync::Mutex::new(TxRecord {
                        tx: tx.clone(),
                        gateway: None,
                        redirect_url: None,
                    })),
                );
                return Err(ReconcileError::Rejected(tx));
            }
        }

        // Reuse an open transaction for this link if one exists
        let row = {
            let mut inner = self.inner.lock();
            let existing = inner
                .open_by_link
                .get(&link)
                .copied()
                .and_then(|id| inner.rows.get(&id).cloned());
            match existing {
                Some(row) => row,
                None => {
                    let tx = self.mint_tx(tx_type, link, amount_cents, TxState::Pending);
                    info!("[RECON] {} pending ({:?}, {}¢)", tx.id, tx_type, amount_cents);
                    let id = tx.id;
                    let row: TxRow = Arc::new(tokio::sync::Mutex::new(TxRecord {
                        tx,
                        gateway: None,
                        redirect_url: None,
                    }));
                    inner.rows.insert(id, Arc::clone(&row));
                    inner.open_by_link.insert(link, id);
                    inner.latest_by_link.insert(link, id);
                    row
                }
            }
        };

        // Snapshot under the row lock, then call out with no locks held
        let (tx_id, existing_session) = {
            let rec = row.lock().await;
            (
                rec.tx.id,
                rec.redirect_url
                    .as_ref()
                    .map(|url| (url.clone(), rec.tx.clone())),
            )
        };
        if let Some((redirect_url, tx)) = existing_session {
            // Retried initiation with a live session: hand back the same redirect
            return Ok(CheckoutCreated { redirect_url, tx });
        }

        let session = self
            .gateway
            .create_checkout(&tx_id.to_string(), amount_cents)
            .await
            .map_err(ReconcileError::Infra)?;

        let mut rec = row.lock().await;
        rec.gateway = Some(PaymentGatewayRecord {
            tx: tx_id,
            external_ref: session.external_ref.clone(),
            gateway_state: GatewayStatus::Pending,
            raw_amount_cents: amount_cents,
        });
        rec.redirect_url = Some(session.redirect_url.clone());
        rec.tx.version += 1;
        rec.tx.updated_at = Utc::now();
        self.inner
            .lock()
            .by_external
            .insert(session.external_ref.clone(), tx_id);
        info!("[RECON] {} session created ({})", tx_id, session.external_ref);
        Ok(CheckoutCreated {
            tx: rec.tx.clone(),
            redirect_url: session.redirect_url,
        })
    }

    /// Webhook/callback entry point: apply a gateway-pushed state change.
    /// Replays of the same external event are no-ops.
    pub async fn apply_report(&self, report: &GatewayReport) -> Result<Transaction, ReconcileError> {
        let dedup_key = report
            .event_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", report.external_ref, report.status));

        let (row, replay) = {
            let inner = self.inner.lock();
            let id = inner
                .by_external
                .get(&report.external_ref)
                .copied()
                .ok_or_else(|| ReconcileError::UnknownRef(report.external_ref.clone()))?;
            let row = inner
                .rows
                .get(&id)
                .cloned()
                .ok_or(ReconcileError::NotFound(id))?;
            (row, inner.seen_events.contains(&dedup_key))
        };

        if replay {
            let rec = row.lock().await;
            info!("[RECON] {} replayed event ignored ({})", rec.tx.id, dedup_key);
            return Ok(rec.tx.clone());
        }

        self.apply_status(&row, report.status, Some(dedup_key)).await
    }

    /// Shared transition routine for webhook and poll paths.
    async fn apply_status(
        &self,
        row: &TxRow,
        status: GatewayStatus,
        dedup_key: Option<String>,
    ) -> Result<Transaction, ReconcileError> {
        let mut rec = row.lock().await;

        // A non-terminal gateway report carries no transition; a
        // force-confirm on a still-pending session leaves the tx pending.
        if !status.is_terminal() {
            return Ok(rec.tx.clone());
        }

        if let Some(key) = dedup_key {
            self.inner.lock().seen_events.insert(key);
        }

        if rec.tx.state.is_terminal() {
            // Already reconciled (poll raced a webhook, or vice versa)
            return Ok(rec.tx.clone());
        }

        let next = match status {
            GatewayStatus::Approved => TxState::Paid,
            GatewayStatus::Rejected => TxState::Failed,
            GatewayStatus::Expired => TxState::Expired,
            GatewayStatus::Pending => unreachable!("non-terminal handled above"),
        };

        let prior = rec.tx.state;
        rec.tx.state = next;
        rec.tx.version += 1;
        rec.tx.updated_at = Utc::now();
        if let Some(g) = rec.gateway.as_mut() {
            // The gateway record freezes once the gateway reports terminal
            if !g.gateway_state.is_terminal() {
                g.gateway_state = status;
            }
        }
        {
            let mut inner = self.inner.lock();
            inner.open_by_link.remove(&rec.tx.link);
        }
        info!("[RECON] {} {} -> {} (gateway {})", rec.tx.id, prior, next, status);

        if next == TxState::Paid {
            if let Err(e) = self.sink.apply_settlement(&rec.tx.link).await {
                // Payment stands; the settlement sink is idempotent and the
                // failure is surfaced for the operator to re-drive.
                error!("[RECON] {} settlement notification failed: {:#}", rec.tx.id, e);
                return Err(ReconcileError::Infra(e));
            }
        }

        Ok(rec.tx.clone())
    }

    /// Poll path: re-query the gateway and apply the same transition logic
    /// as the webhook path. Covers the webhook-never-delivered case.
    pub async fn refresh(&self, tx: TxId) -> Result<Transaction, ReconcileError> {
        let row = self.row(tx)?;
        let external_ref = {
            let rec = row.lock().await;
            if rec.tx.state.is_terminal() {
                return Ok(rec.tx.clone());
            }
            match rec.gateway.as_ref() {
                Some(g) => g.external_ref.clone(),
                // No session yet: nothing to poll
                None => return Ok(rec.tx.clone()),
            }
        };

        let report = self
            .gateway
            .fetch_status(&external_ref)
            .await
            .map_err(ReconcileError::Infra)?;
        self.apply_status(&row, report.status, report.event_id).await
    }

    /// Admin force-confirm: an explicit refresh with audit logging. The
    /// gateway stays authoritative — a still-pending gateway state leaves
    /// the transaction pending (no optimistic update).
    pub async fn force_confirm(&self, tx: TxId) -> Result<Transaction, ReconcileError> {
        info!("[RECON] {} admin force-confirm requested", tx);
        self.refresh(tx).await
    }

    /// Admin-only `paid -> refunded | reverted`. No automatic retry:
    /// either applies atomically or leaves state unchanged.
    pub async fn unwind(&self, tx: TxId, to: TxState) -> Result<Transaction, ReconcileError> {
        debug_assert!(matches!(to, TxState::Refunded | TxState::Reverted));
        let row = self.row(tx)?;
        let mut rec = row.lock().await;
        if rec.tx.state != TxState::Paid {
            return Err(ReconcileError::Invalid(InvalidTxTransition {
                tx,
                from: rec.tx.state,
                to,
            }));
        }
        rec.tx.state = to;
        rec.tx.version += 1;
        rec.tx.updated_at = Utc::now();
        info!("[RECON] {} paid -> {} (admin)", tx, to);
        Ok(rec.tx.clone())
    }

    /// Expire pending transactions whose checkout session has outlived its
    /// TTL. Called by the delinquency sweep; each row transitions
    /// independently.
    pub async fn expire_stale(&self) -> Vec<TxId> {
        let now = Utc::now();
        let ttl = Duration::seconds(self.checkout_session_ttl_secs as i64);
        let rows: Vec<TxRow> = self.inner.lock().rows.values().cloned().collect();

        let mut expired = Vec::new();
        for row in rows {
            let mut rec = row.lock().await;
            if rec.tx.state == TxState::Pending && rec.tx.created_at + ttl <= now {
                rec.tx.state = TxState::Expired;
                rec.tx.version += 1;
                rec.tx.updated_at = now;
                self.inner.lock().open_by_link.remove(&rec.tx.link);
                info!("[RECON] {} pending -> expired (session TTL)", rec.tx.id);
                expired.push(rec.tx.id);
            }
        }
        expired
    }

    fn row(&self, tx: TxId) -> Result<TxRow, ReconcileError> {
        self.inner
            .lock()
            .rows
            .get(&tx)
            .cloned()
            .ok_or(ReconcileError::NotFound(tx))
    }

    /// Current transaction and gateway record.
    pub async fn get(&self, tx: TxId) -> Option<(Transaction, Option<PaymentGatewayRecord>)> {
        let row = self.row(tx).ok()?;
        let rec = row.lock().await;
        Some((rec.tx.clone(), rec.gateway.clone()))
    }

    /// Most recent transaction recorded for a domain link.
    pub fn latest_for_link(&self, link: &TxLink) -> Option<TxId> {
        self.inner.lock().latest_by_link.get(link).copied()
    }
}
