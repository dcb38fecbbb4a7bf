//! Core type definitions for the auction and payment reconciliation engine.
//!
//! This module provides the foundational types for lot lifecycle management,
//! bid ranking, token reservations, and transaction reconciliation.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

// === Identifiers ===

/// Monetary amounts are integer cents. No floats touch the ledger.
pub type Cents = u64;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

id_type!(
    /// An auctionable unit belonging to a project.
    LotId, "lot"
);
id_type!(
    /// A single bid placed against a lot.
    BidId, "bid"
);
id_type!(
    /// A bidder account.
    UserId, "user"
);
id_type!(
    /// The subscription that funds a bidder's token budget.
    SubscriptionId, "sub"
);
id_type!(
    /// The project a lot belongs to.
    ProjectId, "proj"
);
id_type!(
    /// A payment transaction.
    TxId, "tx"
);
id_type!(
    /// A token reservation backing an active bid.
    ReservationId, "rsv"
);
id_type!(
    /// A step-up (2FA) challenge.
    ChallengeId, "chal"
);
id_type!(
    /// A direct investment (external collaborator linkage).
    InvestmentId, "inv"
);

// === Lot ===

/// Lifecycle state of a lot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotState {
    Scheduled,
    Active,
    Closing,
    Closed,
    Cancelled,
}

impl std::fmt::Display for LotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LotState::Scheduled => write!(f, "scheduled"),
            LotState::Active => write!(f, "active"),
            LotState::Closing => write!(f, "closing"),
            LotState::Closed => write!(f, "closed"),
            LotState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A lot and its auction bookkeeping.
///
/// Lots are never physically deleted; terminal outcomes are soft state.
/// `failed_attempts` counts failed payments per bidder on this lot — at the
/// configured cap the bidder is permanently disqualified from this lot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,
    pub project: ProjectId,
    pub base_price_cents: Cents,
    pub state: LotState,
    /// Current winner candidate (state `winning_pending` or `winning_paid`)
    pub winner: Option<BidId>,
    /// Hard deadline for the pending winner's payment
    pub payment_deadline: Option<DateTime<Utc>>,
    /// Failed-payment counter per bidder, capped at the policy maximum
    #[serde(default)]
    pub failed_attempts: FxHashMap<UserId, u32>,
}

impl Lot {
    pub fn new(id: LotId, project: ProjectId, base_price_cents: Cents) -> Self {
        Self {
            id,
            project,
            base_price_cents,
            state: LotState::Scheduled,
            winner: None,
            payment_deadline: None,
            failed_attempts: FxHashMap::default(),
        }
    }

    /// Failed payment count for a bidder on this lot
    pub fn failures_for(&self, bidder: UserId) -> u32 {
        self.failed_attempts.get(&bidder).copied().unwrap_or(0)
    }

    /// Whether a bidder has hit the disqualification cap on this lot
    pub fn is_disqualified(&self, bidder: UserId, max_failed_attempts: u32) -> bool {
        self.failures_for(bidder) >= max_failed_attempts
    }
}

// === Bid ===

/// State of a bid within its lot's ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidState {
    /// In the running; ranked by amount
    Active,
    /// Sole winner candidate, payment not yet confirmed
    WinningPending,
    /// Winner with confirmed payment
    WinningPaid,
    /// Outranked at lot close; immutable history
    Superseded,
    /// Withdrawn or failed out (delinquency, admin cancel)
    Cancelled,
}

impl std::fmt::Display for BidState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BidState::Active => write!(f, "active"),
            BidState::WinningPending => write!(f, "winning_pending"),
            BidState::WinningPaid => write!(f, "winning_paid"),
            BidState::Superseded => write!(f, "superseded"),
            BidState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A bid against a lot. Superseded bids stay on record, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub lot: LotId,
    pub bidder: UserId,
    pub subscription: SubscriptionId,
    pub amount_cents: Cents,
    pub state: BidState,
    pub placed_at: DateTime<Utc>,
    /// Token reservation backing this bid; cleared when released or committed
    pub reservation: Option<ReservationId>,
}

/// Why a bid placement was rejected. A business outcome, not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BidRejection {
    LotNotActive,
    AmountNotGreaterThanCurrentHighest,
    InsufficientTokens,
    BidderDisqualifiedOnLot,
}

impl std::fmt::Display for BidRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BidRejection::LotNotActive => write!(f, "lot-not-active"),
            BidRejection::AmountNotGreaterThanCurrentHighest => {
                write!(f, "amount-not-greater-than-current-highest")
            }
            BidRejection::InsufficientTokens => write!(f, "insufficient-tokens"),
            BidRejection::BidderDisqualifiedOnLot => write!(f, "bidder-disqualified-on-lot"),
        }
    }
}

// === Transitions ===

/// A lot transition attempted from a state that does not permit it.
/// Rejected, never silently coerced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidTransition {
    pub lot: LotId,
    pub from: LotState,
    pub operation: &'static str,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid-transition: {} cannot {} from {}",
            self.lot, self.operation, self.from
        )
    }
}

// === Transaction ===

/// What a transaction pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxType {
    Direct,
    Bid,
    SubscriptionInitial,
    Monthly,
}

/// Domain object a transaction settles. A transaction never links to more
/// than one, which the enum enforces structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxLink {
    Investment(InvestmentId),
    Bid(BidId),
    Subscription(SubscriptionId),
    Monthly(SubscriptionId),
}

/// Transaction state. Transitions are monotonic:
/// `pending` moves once to a terminal business state, and only `paid` may
/// later move to the admin-only `refunded`/`reverted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxState {
    Pending,
    Paid,
    Failed,
    Expired,
    RejectedCapacity,
    RejectedClosed,
    Refunded,
    Reverted,
}

impl TxState {
    /// Terminal for the reconciliation loop (webhook/poll no longer applies)
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxState::Pending)
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxState::Pending => "pending",
            TxState::Paid => "paid",
            TxState::Failed => "failed",
            TxState::Expired => "expired",
            TxState::RejectedCapacity => "rejected-capacity",
            TxState::RejectedClosed => "rejected-closed",
            TxState::Refunded => "refunded",
            TxState::Reverted => "reverted",
        };
        write!(f, "{}", s)
    }
}

/// A payment transaction, retained indefinitely for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub tx_type: TxType,
    pub amount_cents: Cents,
    pub state: TxState,
    pub link: TxLink,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter; bumped on every applied transition
    pub version: u64,
}

/// Gateway-side record for a transaction. One-to-one, absent until a
/// checkout session exists, immutable once the gateway reports terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentGatewayRecord {
    pub tx: TxId,
    pub external_ref: String,
    pub gateway_state: crate::gateway::GatewayStatus,
    pub raw_amount_cents: Cents,
}

/// A transaction transition attempted from a state that does not permit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidTxTransition {
    pub tx: TxId,
    pub from: TxState,
    pub to: TxState,
}

impl std::fmt::Display for InvalidTxTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid-transition: {} cannot move {} -> {}",
            self.tx, self.from, self.to
        )
    }
}

// === Service-level rejection taxonomy ===

/// Stable machine-readable rejection reasons surfaced to API callers.
/// Business rejections only — infrastructure failures are carried
/// separately and never conflated with these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "reason")]
pub enum Rejection {
    LotNotActive,
    AmountTooLow,
    InsufficientTokens,
    BidderDisqualifiedOnLot,
    InvalidTransition,
    RejectedClosed,
    RejectedCapacity,
    InvalidCode,
    ExpiredChallenge,
    NoPendingWinner,
    TxNotRefundable,
    NotFound,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::LotNotActive => "lot-not-active",
            Rejection::AmountTooLow => "amount-too-low",
            Rejection::InsufficientTokens => "insufficient-tokens",
            Rejection::BidderDisqualifiedOnLot => "bidder-disqualified-on-lot",
            Rejection::InvalidTransition => "invalid-transition",
            Rejection::RejectedClosed => "rejected-closed",
            Rejection::RejectedCapacity => "rejected-capacity",
            Rejection::InvalidCode => "invalid-code",
            Rejection::ExpiredChallenge => "expired-challenge",
            Rejection::NoPendingWinner => "no-pending-winner",
            Rejection::TxNotRefundable => "tx-not-refundable",
            Rejection::NotFound => "not-found",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl From<BidRejection> for Rejection {
    fn from(r: BidRejection) -> Self {
        match r {
            BidRejection::LotNotActive => Rejection::LotNotActive,
            BidRejection::AmountNotGreaterThanCurrentHighest => Rejection::AmountTooLow,
            BidRejection::InsufficientTokens => Rejection::InsufficientTokens,
            BidRejection::BidderDisqualifiedOnLot => Rejection::BidderDisqualifiedOnLot,
        }
    }
}

impl From<InvalidTransition> for Rejection {
    fn from(_: InvalidTransition) -> Self {
        Rejection::InvalidTransition
    }
}

impl From<InvalidTxTransition> for Rejection {
    fn from(_: InvalidTxTransition) -> Self {
        Rejection::TxNotRefundable
    }
}
