//! HTTP/JSON surface over the service facade.
//!
//! Handlers are thin: parse, delegate to `AuctionService`, map the result.
//! Business rejections serialize as `{"reason": "<code>"}` with a 4xx
//! status; infrastructure failures (gateway unreachable) are 502 so the
//! caller knows to retry. No domain logic lives here.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::gateway::GatewayReport;
use crate::service::{AuctionService, CheckoutStart, ServiceError};
use crate::types::{
    Bid, BidId, Cents, ChallengeId, Lot, LotId, PaymentGatewayRecord, ProjectId, Rejection,
    SubscriptionId, Transaction, TxId, UserId,
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AuctionService>,
}

pub fn router(service: Arc<AuctionService>) -> Router {
    Router::new()
        .route("/lots", post(create_lot))
        .route("/lots/:id", get(get_lot))
        .route("/lots/:id/start", post(start_lot))
        .route("/lots/:id/close", post(close_lot))
        .route("/lots/:id/bids", post(place_bid))
        .route("/lots/:id/simulate-default", post(simulate_default))
        .route("/bids/:id/cancel", post(cancel_winning_bid))
        .route("/checkout", post(initiate_checkout))
        .route("/checkout/verify", post(verify_checkout))
        .route("/transactions/:id", get(transaction_status))
        .route("/transactions/:id/force-confirm", post(force_confirm))
        .route("/transactions/:id/revert", post(revert_transaction))
        .route("/transactions/:id/refund", post(refund_transaction))
        .route("/webhooks/gateway", post(gateway_webhook))
        .route("/subscriptions/:id/tokens", post(grant_tokens))
        .route("/users/:id/step-up", post(set_step_up))
        .with_state(AppState { service })
}

/// Wraps service results for the response mapping.
struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            ServiceError::Rejected(rejection) => {
                let status = rejection_status(&rejection);
                (status, Json(rejection)).into_response()
            }
            ServiceError::Infra(e) => {
                error!("[API] infrastructure failure: {:#}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    Json(serde_json::json!({ "reason": "upstream-unavailable" })),
                )
                    .into_response()
            }
        }
    }
}

fn rejection_status(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::NotFound => StatusCode::NOT_FOUND,
        Rejection::InvalidCode | Rejection::ExpiredChallenge => StatusCode::FORBIDDEN,
        _ => StatusCode::CONFLICT,
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// === Lot lifecycle ===

#[derive(Deserialize)]
struct CreateLotRequest {
    project: ProjectId,
    base_price_cents: Cents,
}

async fn create_lot(
    State(state): State<AppState>,
    Json(req): Json<CreateLotRequest>,
) -> ApiResult<Lot> {
    Ok(Json(
        state.service.create_lot(req.project, req.base_price_cents),
    ))
}

async fn get_lot(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Lot> {
    Ok(Json(state.service.get_lot(LotId(id)).await?))
}

async fn start_lot(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Lot> {
    Ok(Json(state.service.start_auction(LotId(id)).await?))
}

#[derive(Serialize)]
struct CloseLotResponse {
    lot: Lot,
    winner: Option<Bid>,
}

/// End bidding and fix the winner in one call: `active -> closing -> closed`.
async fn close_lot(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<CloseLotResponse> {
    let lot_id = LotId(id);
    state.service.end_auction(lot_id).await?;
    let winner = state.service.finalize_close(lot_id).await?;
    let lot = state.service.get_lot(lot_id).await?;
    Ok(Json(CloseLotResponse { lot, winner }))
}

// === Bidding ===

#[derive(Deserialize)]
struct PlaceBidRequest {
    bidder: UserId,
    subscription: SubscriptionId,
    amount_cents: Cents,
}

async fn place_bid(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<PlaceBidRequest>,
) -> ApiResult<Bid> {
    let bid = state
        .service
        .place_bid(LotId(id), req.bidder, req.subscription, req.amount_cents)
        .await?;
    Ok(Json(bid))
}

// === Checkout ===

#[derive(Deserialize)]
struct CheckoutRequest {
    user: UserId,
    bid: BidId,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
enum CheckoutResponse {
    Redirect {
        tx: Transaction,
        redirect_url: String,
    },
    StepUpRequired {
        challenge: ChallengeId,
    },
}

impl From<CheckoutStart> for CheckoutResponse {
    fn from(start: CheckoutStart) -> Self {
        match start {
            CheckoutStart::Redirect { tx, redirect_url } => {
                CheckoutResponse::Redirect { tx, redirect_url }
            }
            CheckoutStart::StepUpRequired { challenge } => {
                CheckoutResponse::StepUpRequired { challenge }
            }
        }
    }
}

async fn initiate_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<CheckoutResponse> {
    let start = state.service.initiate_checkout(req.user, req.bid).await?;
    Ok(Json(start.into()))
}

#[derive(Deserialize)]
struct VerifyRequest {
    challenge: ChallengeId,
    code: String,
}

async fn verify_checkout(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<CheckoutResponse> {
    let start = state
        .service
        .confirm_step_up(req.challenge, &req.code)
        .await?;
    Ok(Json(start.into()))
}

// === Transactions ===

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Serialize)]
struct TransactionResponse {
    transaction: Transaction,
    gateway: Option<PaymentGatewayRecord>,
}

async fn transaction_status(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<TransactionResponse> {
    let (transaction, gateway) = state
        .service
        .payment_status(TxId(id), query.refresh)
        .await?;
    Ok(Json(TransactionResponse {
        transaction,
        gateway,
    }))
}

async fn force_confirm(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Transaction> {
    Ok(Json(state.service.force_confirm(TxId(id)).await?))
}

async fn revert_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Transaction> {
    Ok(Json(state.service.revert_transaction(TxId(id)).await?))
}

async fn refund_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Transaction> {
    Ok(Json(state.service.refund_transaction(TxId(id)).await?))
}

// === Admin overrides ===

#[derive(Serialize)]
struct ReassignResponse {
    lot: LotId,
    prior_winner: BidId,
    promoted: Option<Bid>,
}

async fn simulate_default(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<ReassignResponse> {
    let outcome = state.service.simulate_default(LotId(id)).await?;
    Ok(Json(ReassignResponse {
        lot: outcome.lot,
        prior_winner: outcome.prior_winner,
        promoted: outcome.promoted,
    }))
}

async fn cancel_winning_bid(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<ReassignResponse> {
    let outcome = state.service.cancel_winning_bid(BidId(id)).await?;
    Ok(Json(ReassignResponse {
        lot: outcome.lot,
        prior_winner: outcome.prior_winner,
        promoted: outcome.promoted,
    }))
}

// === Gateway webhook ===

async fn gateway_webhook(
    State(state): State<AppState>,
    Json(report): Json<GatewayReport>,
) -> ApiResult<Transaction> {
    Ok(Json(state.service.handle_gateway_report(&report).await?))
}

// === Account setup (fed by the external account/subscription services) ===

#[derive(Deserialize)]
struct GrantTokensRequest {
    tokens: u32,
}

async fn grant_tokens(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<GrantTokensRequest>,
) -> ApiResult<serde_json::Value> {
    let sub = SubscriptionId(id);
    state.service.tokens().grant(sub, req.tokens);
    let balance = state.service.tokens().balance(sub);
    Ok(Json(serde_json::json!({
        "subscription": sub,
        "available": balance.available,
        "reserved": balance.reserved,
    })))
}

#[derive(Deserialize)]
struct StepUpRequest {
    enabled: bool,
}

async fn set_step_up(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<StepUpRequest>,
) -> ApiResult<serde_json::Value> {
    let user = UserId(id);
    state.service.gate().set_enabled(user, req.enabled);
    Ok(Json(serde_json::json!({
        "user": user,
        "step_up_enabled": req.enabled,
    })))
}
