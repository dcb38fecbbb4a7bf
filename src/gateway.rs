//! Trait abstraction over the external payment gateway.
//!
//! The gateway is an opaque external dependency reached only through this
//! adapter: create a checkout session, query a session's state. The trait
//! enables dependency injection so the reconciler can be driven by a mock
//! in tests; the real implementation is a thin reqwest client.
//!
//! Gateway calls are the only operations expected to block on network I/O
//! and must never run while a lot or bid lock is held.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Cents;

/// Gateway-reported state of a checkout session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl GatewayStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, GatewayStatus::Pending)
    }
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayStatus::Pending => write!(f, "pending"),
            GatewayStatus::Approved => write!(f, "approved"),
            GatewayStatus::Rejected => write!(f, "rejected"),
            GatewayStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A created checkout session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Gateway-side reference id for this session
    pub external_ref: String,
    /// URL the payer is redirected to
    pub redirect_url: String,
}

/// A gateway state report, from a webhook push or a status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayReport {
    pub external_ref: String,
    pub status: GatewayStatus,
    pub amount_cents: Cents,
    /// Gateway event id when one is delivered (webhook pushes carry one);
    /// the reconciler uses it as the replay-dedup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Outbound interface to the external payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a checkout session for a reference (our transaction id) and
    /// amount. Network failure here is an infrastructure error, never a
    /// payment outcome.
    async fn create_checkout(&self, reference: &str, amount_cents: Cents)
        -> Result<CheckoutSession>;

    /// Query the current state of a session (poll / force-confirm path).
    async fn fetch_status(&self, external_ref: &str) -> Result<GatewayReport>;
}

// =============================================================================
// HTTP IMPLEMENTATION
// =============================================================================

#[derive(Debug, Serialize)]
struct CreateCheckoutRequest<'a> {
    reference: &'a str,
    amount_cents: Cents,
}

#[derive(Debug, Deserialize)]
struct CreateCheckoutResponse {
    id: String,
    redirect_url: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    id: String,
    status: GatewayStatus,
    amount_cents: Cents,
}

/// JSON-over-HTTP gateway client.
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_checkout(
        &self,
        reference: &str,
        amount_cents: Cents,
    ) -> Result<CheckoutSession> {
        let url = format!("{}/checkouts", self.base_url);
        let resp: CreateCheckoutResponse = self
            .http
            .post(&url)
            .json(&CreateCheckoutRequest {
                reference,
                amount_cents,
            })
            .send()
            .await
            .context("gateway unreachable during checkout creation")?
            .error_for_status()
            .context("gateway rejected checkout creation")?
            .json()
            .await
            .context("gateway returned malformed checkout response")?;

        Ok(CheckoutSession {
            external_ref: resp.id,
            redirect_url: resp.redirect_url,
        })
    }

    async fn fetch_status(&self, external_ref: &str) -> Result<GatewayReport> {
        let url = format!("{}/checkouts/{}", self.base_url, external_ref);
        let resp: StatusResponse = self
            .http
            .get(&url)
            .send()
            .await
            .context("gateway unreachable during status poll")?
            .error_for_status()
            .context("gateway rejected status poll")?
            .json()
            .await
            .context("gateway returned malformed status response")?;

        Ok(GatewayReport {
            external_ref: resp.id,
            status: resp.status,
            amount_cents: resp.amount_cents,
            event_id: None,
        })
    }
}

// =============================================================================
// MOCK IMPLEMENTATION (FOR TESTING)
// =============================================================================

/// Mock module for testing. Available in all builds but only used in tests.
pub mod mock {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::RwLock;

    /// Record of a call to the mock gateway.
    #[derive(Clone, Debug)]
    pub struct MockCall {
        pub method: String,
        pub reference: String,
    }

    /// Mock payment gateway for testing.
    ///
    /// Checkout creation succeeds with a deterministic external ref unless
    /// configured to fail; status polls answer from configured canned
    /// states. All calls are recorded for verification in tests.
    pub struct MockGateway {
        statuses: RwLock<HashMap<String, GatewayStatus>>,
        fail_create: RwLock<bool>,
        fail_status: RwLock<bool>,
        calls: RwLock<Vec<MockCall>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                statuses: RwLock::new(HashMap::new()),
                fail_create: RwLock::new(false),
                fail_status: RwLock::new(false),
                calls: RwLock::new(Vec::new()),
            }
        }

        /// External ref the mock will mint for a given reference.
        pub fn external_ref_for(reference: &str) -> String {
            format!("ext-{}", reference)
        }

        /// Configure the gateway-side state reported for an external ref.
        pub fn set_status(&self, external_ref: &str, status: GatewayStatus) {
            self.statuses
                .write()
                .unwrap()
                .insert(external_ref.to_string(), status);
        }

        /// Make checkout creation fail (gateway unreachable).
        pub fn set_fail_create(&self, fail: bool) {
            *self.fail_create.write().unwrap() = fail;
        }

        /// Make status polls fail (gateway unreachable).
        pub fn set_fail_status(&self, fail: bool) {
            *self.fail_status.write().unwrap() = fail;
        }

        /// All calls made to this mock.
        pub fn get_calls(&self) -> Vec<MockCall> {
            self.calls.read().unwrap().clone()
        }

        fn record_call(&self, method: &str, reference: &str) {
            self.calls.write().unwrap().push(MockCall {
                method: method.to_string(),
                reference: reference.to_string(),
            });
        }
    }

    impl Default for MockGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_checkout(
            &self,
            reference: &str,
            _amount_cents: Cents,
        ) -> Result<CheckoutSession> {
            self.record_call("create_checkout", reference);
            if *self.fail_create.read().unwrap() {
                return Err(anyhow!("mock gateway unreachable"));
            }
            let external_ref = Self::external_ref_for(reference);
            self.statuses
                .write()
                .unwrap()
                .entry(external_ref.clone())
                .or_insert(GatewayStatus::Pending);
            Ok(CheckoutSession {
                redirect_url: format!("https://mock-gateway/pay/{}", external_ref),
                external_ref,
            })
        }

        async fn fetch_status(&self, external_ref: &str) -> Result<GatewayReport> {
            self.record_call("fetch_status", external_ref);
            if *self.fail_status.read().unwrap() {
                return Err(anyhow!("mock gateway unreachable"));
            }
            let status = self
                .statuses
                .read()
                .unwrap()
                .get(external_ref)
                .copied()
                .ok_or_else(|| anyhow!("no mock status configured for ref: {}", external_ref))?;
            Ok(GatewayReport {
                external_ref: external_ref.to_string(),
                status,
                amount_cents: 0,
                event_id: None,
            })
        }
    }
}
