//! Auction and payment reconciliation engine.
//!
//! Lots move through an explicit lifecycle (`scheduled → active → closing
//! → closed`); bids are backed by token reservations drawn from a
//! per-subscription budget; the winning bid's payment is reconciled
//! asynchronously against an external gateway (webhook push plus status
//! polling), with a periodic sweep expiring delinquent winners and stale
//! checkout sessions.
//!
//! The crate is a library of domain components plus a binary that wires
//! them behind an HTTP/JSON API. All behavior is reachable (and tested)
//! through the [`service::AuctionService`] facade without the HTTP layer.

pub mod api;
pub mod auction;
pub mod audit;
pub mod config;
pub mod delinquency;
pub mod gateway;
pub mod ledger;
pub mod reconciler;
pub mod service;
pub mod tokens;
pub mod twofactor;
pub mod types;

pub use service::{AuctionService, CheckoutStart, ServiceError, ServiceResult};
pub use types::{
    Bid, BidId, BidState, Cents, Lot, LotId, LotState, Rejection, Transaction, TxId, TxLink,
    TxState,
};
