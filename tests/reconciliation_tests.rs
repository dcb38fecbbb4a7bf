//! Reconciliation and checkout flows: step-up verification, webhook
//! replays, force-confirm against a pending gateway, sweep expiry, and the
//! HTTP gateway client against a wiremock server.

use std::sync::Arc;

use auction_engine::audit::AuditLog;
use auction_engine::config::EnginePolicy;
use auction_engine::delinquency::DelinquencyMonitor;
use auction_engine::gateway::mock::MockGateway;
use auction_engine::gateway::{GatewayReport, GatewayStatus, HttpGateway, PaymentGateway};
use auction_engine::service::{AuctionService, CheckoutStart, ServiceError};
use auction_engine::types::{
    Bid, BidState, ProjectId, Rejection, SubscriptionId, Transaction, TxState, UserId,
};

const ALICE: UserId = UserId(1);
const SUB_ALICE: SubscriptionId = SubscriptionId(1);

struct Harness {
    service: Arc<AuctionService>,
    gateway: Arc<MockGateway>,
    audit: Arc<AuditLog>,
    _audit_dir: tempfile::TempDir,
}

fn harness_with(policy: EnginePolicy) -> Harness {
    let audit_dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(MockGateway::new());
    let audit = Arc::new(AuditLog::new(audit_dir.path()).unwrap());
    let service = Arc::new(AuctionService::new(
        &policy,
        Arc::clone(&gateway) as Arc<dyn PaymentGateway>,
        Arc::clone(&audit),
    ));
    Harness {
        service,
        gateway,
        audit,
        _audit_dir: audit_dir,
    }
}

fn harness() -> Harness {
    harness_with(EnginePolicy::default())
}

impl Harness {
    /// One-bidder auction driven to a pending winner.
    async fn pending_winner(&self) -> Bid {
        self.service.tokens().grant(SUB_ALICE, 5);
        let lot = self.service.create_lot(ProjectId(1), 10_000);
        self.service.start_auction(lot.id).await.unwrap();
        let bid = self
            .service
            .place_bid(lot.id, ALICE, SUB_ALICE, 10_000)
            .await
            .unwrap();
        self.service.end_auction(lot.id).await.unwrap();
        self.service.finalize_close(lot.id).await.unwrap();
        bid
    }

    async fn checkout_redirect(&self, bid: &Bid) -> Transaction {
        match self.service.initiate_checkout(ALICE, bid.id).await.unwrap() {
            CheckoutStart::Redirect { tx, .. } => tx,
            CheckoutStart::StepUpRequired { .. } => panic!("unexpected step-up"),
        }
    }
}

fn rejection(err: ServiceError) -> Rejection {
    match err {
        ServiceError::Rejected(r) => r,
        ServiceError::Infra(e) => panic!("expected rejection, got infra error: {:#}", e),
    }
}

#[tokio::test]
async fn test_step_up_gates_checkout_until_verified() {
    let h = harness();
    h.service.gate().set_enabled(ALICE, true);
    let bid = h.pending_winner().await;

    let CheckoutStart::StepUpRequired { challenge } =
        h.service.initiate_checkout(ALICE, bid.id).await.unwrap()
    else {
        panic!("expected step-up");
    };
    // No gateway session exists before verification
    assert!(h.gateway.get_calls().is_empty());

    // Wrong code: rejected, challenge stays usable
    let err = h
        .service
        .confirm_step_up(challenge, "badcode")
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::InvalidCode);

    let code = h
        .service
        .gate()
        .challenge(challenge)
        .unwrap()
        .code()
        .to_string();
    let CheckoutStart::Redirect { tx, redirect_url } =
        h.service.confirm_step_up(challenge, &code).await.unwrap()
    else {
        panic!("expected redirect after verification");
    };
    assert_eq!(tx.state, TxState::Pending);
    assert!(redirect_url.contains("mock-gateway"));

    // Replayed confirmation cannot re-open the checkout
    let err = h.service.confirm_step_up(challenge, &code).await.unwrap_err();
    assert_eq!(rejection(err), Rejection::ExpiredChallenge);
}

#[tokio::test]
async fn test_expired_challenge_is_rejected() {
    let policy = EnginePolicy {
        challenge_ttl_secs: 1,
        ..EnginePolicy::default()
    };
    let h = harness_with(policy);
    h.service.gate().set_enabled(ALICE, true);
    let bid = h.pending_winner().await;

    let CheckoutStart::StepUpRequired { challenge } =
        h.service.initiate_checkout(ALICE, bid.id).await.unwrap()
    else {
        panic!("expected step-up");
    };
    let code = h
        .service
        .gate()
        .challenge(challenge)
        .unwrap()
        .code()
        .to_string();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let err = h.service.confirm_step_up(challenge, &code).await.unwrap_err();
    assert_eq!(rejection(err), Rejection::ExpiredChallenge);
}

#[tokio::test]
async fn test_force_confirm_respects_pending_gateway() {
    let h = harness();
    let bid = h.pending_winner().await;
    let tx = h.checkout_redirect(&bid).await;

    // Gateway still says pending: force-confirm changes nothing
    let after = h.service.force_confirm(tx.id).await.unwrap();
    assert_eq!(after.state, TxState::Pending);
    assert_eq!(
        h.service.auction().ledger().get(bid.id).unwrap().state,
        BidState::WinningPending
    );

    // Once the gateway approves, force-confirm applies the verdict
    let external_ref = MockGateway::external_ref_for(&tx.id.to_string());
    h.gateway.set_status(&external_ref, GatewayStatus::Approved);
    let after = h.service.force_confirm(tx.id).await.unwrap();
    assert_eq!(after.state, TxState::Paid);
    assert_eq!(
        h.service.auction().ledger().get(bid.id).unwrap().state,
        BidState::WinningPaid
    );
}

#[tokio::test]
async fn test_webhook_replay_does_not_double_settle() {
    let h = harness();
    let bid = h.pending_winner().await;
    let tx = h.checkout_redirect(&bid).await;

    let external_ref = MockGateway::external_ref_for(&tx.id.to_string());
    h.gateway.set_status(&external_ref, GatewayStatus::Approved);
    let report = GatewayReport {
        external_ref,
        status: GatewayStatus::Approved,
        amount_cents: tx.amount_cents,
        event_id: Some("evt-dup".to_string()),
    };

    let first = h.service.handle_gateway_report(&report).await.unwrap();
    assert_eq!(first.state, TxState::Paid);
    let available_after_first = h.service.tokens().balance(SUB_ALICE).available;

    let second = h.service.handle_gateway_report(&report).await.unwrap();
    assert_eq!(second.state, TxState::Paid);
    assert_eq!(second.version, first.version);
    // The token was consumed exactly once
    assert_eq!(
        h.service.tokens().balance(SUB_ALICE).available,
        available_after_first
    );
}

#[tokio::test]
async fn test_rejected_payment_leaves_winner_pending() {
    let h = harness();
    let bid = h.pending_winner().await;
    let tx = h.checkout_redirect(&bid).await;

    let external_ref = MockGateway::external_ref_for(&tx.id.to_string());
    let failed = h
        .service
        .handle_gateway_report(&GatewayReport {
            external_ref,
            status: GatewayStatus::Rejected,
            amount_cents: tx.amount_cents,
            event_id: None,
        })
        .await
        .unwrap();
    assert_eq!(failed.state, TxState::Failed);

    // The win is untouched: the bidder may retry within the deadline
    assert_eq!(
        h.service.auction().ledger().get(bid.id).unwrap().state,
        BidState::WinningPending
    );
    let retry = h.checkout_redirect(&bid).await;
    assert_ne!(retry.id, tx.id);
    assert_eq!(retry.state, TxState::Pending);
}

#[tokio::test]
async fn test_gateway_outage_keeps_tx_pending_and_retryable() {
    let h = harness();
    let bid = h.pending_winner().await;

    h.gateway.set_fail_create(true);
    let err = h.service.initiate_checkout(ALICE, bid.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Infra(_)));

    h.gateway.set_fail_create(false);
    let tx = h.checkout_redirect(&bid).await;
    assert_eq!(tx.state, TxState::Pending);
}

#[tokio::test]
async fn test_checkout_after_reassignment_is_rejected_closed() {
    let h = harness();
    let bid = h.pending_winner().await;

    // Admin pulls the win before the bidder pays
    h.service.simulate_default(bid.lot).await.unwrap();

    let err = h.service.initiate_checkout(ALICE, bid.id).await.unwrap_err();
    assert_eq!(rejection(err), Rejection::RejectedClosed);
}

#[tokio::test]
async fn test_sweep_expires_stale_sessions_and_audits() {
    let policy = EnginePolicy {
        checkout_session_ttl_secs: 1,
        sweep_interval_secs: 1,
        ..EnginePolicy::default()
    };
    let h = harness_with(policy);
    let bid = h.pending_winner().await;
    let tx = h.checkout_redirect(&bid).await;

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let monitor = DelinquencyMonitor::new(
        Arc::clone(h.service.auction()),
        Arc::clone(h.service.reconciler()),
        Arc::clone(&h.audit),
        1,
    );
    let summary = monitor.sweep_once().await;
    assert_eq!(summary.transactions_expired, 1);

    let (tx_now, _) = h.service.payment_status(tx.id, false).await.unwrap();
    assert_eq!(tx_now.state, TxState::Expired);

    let audit_contents = std::fs::read_to_string(h.audit.file_path()).unwrap();
    assert!(audit_contents.contains("expire_transaction"));
}

#[tokio::test]
async fn test_http_gateway_round_trip_against_wiremock() {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/checkouts"))
        .and(body_partial_json(serde_json::json!({
            "reference": "tx-1",
            "amount_cents": 10_000,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "ext-abc",
            "redirect_url": "https://pay.example.com/ext-abc",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/checkouts/ext-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "ext-abc",
            "status": "approved",
            "amount_cents": 10_000,
        })))
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(&server.uri());
    let session = gateway.create_checkout("tx-1", 10_000).await.unwrap();
    assert_eq!(session.external_ref, "ext-abc");
    assert_eq!(session.redirect_url, "https://pay.example.com/ext-abc");

    let report = gateway.fetch_status("ext-abc").await.unwrap();
    assert_eq!(report.status, GatewayStatus::Approved);
    assert_eq!(report.amount_cents, 10_000);
}

#[tokio::test]
async fn test_http_gateway_5xx_is_infra_error() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/checkouts"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(&server.uri());
    let err = gateway.create_checkout("tx-1", 10_000).await.unwrap_err();
    assert!(err.to_string().contains("gateway rejected checkout creation"));
}
