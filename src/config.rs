//! Engine configuration and business policy values.
//!
//! Policy values (disqualification cap, payment deadline, sweep cadence,
//! challenge TTLs) are read from the environment, never hard-coded at call
//! sites. All accessors cache on first read.

use std::sync::OnceLock;
use tracing::warn;

/// Default payment deadline for a pending winner (48 hours)
pub const DEFAULT_PAYMENT_DEADLINE_SECS: u64 = 48 * 3600;

/// Default checkout-session lifetime before a pending transaction expires
pub const DEFAULT_CHECKOUT_SESSION_TTL_SECS: u64 = 30 * 60;

/// Default step-up challenge lifetime
pub const DEFAULT_CHALLENGE_TTL_SECS: u64 = 5 * 60;

/// Default delinquency sweep interval
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 120;

/// Default failed-payment cap before a bidder is disqualified on a lot
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 3;

/// Parse a positive integer from an env var, logging a warning for invalid values.
fn parse_positive_u64_env(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => match v.parse::<u64>() {
            Ok(val) if val > 0 => val,
            Ok(val) => {
                warn!("[CONFIG] {}={} is invalid (must be > 0), using default {}", name, val, default);
                default
            }
            Err(_) => {
                warn!("[CONFIG] {}='{}' is not a valid number, using default {}", name, v, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Business policy for the auction state machine and delinquency monitor.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// Failed payments on a lot before that bidder is disqualified from it
    pub max_failed_attempts: u32,
    /// Seconds a pending winner has to complete payment
    pub payment_deadline_secs: u64,
    /// Seconds before a `pending` transaction's checkout session expires
    pub checkout_session_ttl_secs: u64,
    /// Seconds a step-up challenge stays valid
    pub challenge_ttl_secs: u64,
    /// Delinquency sweep cadence in seconds
    pub sweep_interval_secs: u64,
}

impl EnginePolicy {
    pub fn from_env() -> Self {
        Self {
            max_failed_attempts: parse_positive_u64_env(
                "MAX_FAILED_ATTEMPTS",
                DEFAULT_MAX_FAILED_ATTEMPTS as u64,
            ) as u32,
            payment_deadline_secs: parse_positive_u64_env(
                "PAYMENT_DEADLINE_SECS",
                DEFAULT_PAYMENT_DEADLINE_SECS,
            ),
            checkout_session_ttl_secs: parse_positive_u64_env(
                "CHECKOUT_SESSION_TTL_SECS",
                DEFAULT_CHECKOUT_SESSION_TTL_SECS,
            ),
            challenge_ttl_secs: parse_positive_u64_env(
                "CHALLENGE_TTL_SECS",
                DEFAULT_CHALLENGE_TTL_SECS,
            ),
            sweep_interval_secs: parse_positive_u64_env(
                "SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            ),
        }
    }
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            payment_deadline_secs: DEFAULT_PAYMENT_DEADLINE_SECS,
            checkout_session_ttl_secs: DEFAULT_CHECKOUT_SESSION_TTL_SECS,
            challenge_ttl_secs: DEFAULT_CHALLENGE_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

/// Payment gateway base URL.
/// Set `GATEWAY_BASE_URL` to point at the external processor.
pub fn gateway_base_url() -> &'static str {
    static CACHED: OnceLock<String> = OnceLock::new();
    CACHED.get_or_init(|| {
        std::env::var("GATEWAY_BASE_URL")
            .unwrap_or_else(|_| "https://gateway.example.com/api".to_string())
    })
}

/// API bind address for the HTTP layer.
/// Set `ENGINE_BIND` (default `127.0.0.1:8080`).
pub fn api_bind() -> &'static str {
    static CACHED: OnceLock<String> = OnceLock::new();
    CACHED.get_or_init(|| {
        std::env::var("ENGINE_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string())
    })
}

/// Directory for the audit trail files.
/// Set `AUDIT_DIR` (default `.audit`).
pub fn audit_dir() -> &'static str {
    static CACHED: OnceLock<String> = OnceLock::new();
    CACHED.get_or_init(|| std::env::var("AUDIT_DIR").unwrap_or_else(|_| ".audit".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_values() {
        let policy = EnginePolicy::default();
        assert_eq!(policy.max_failed_attempts, 3);
        assert_eq!(policy.challenge_ttl_secs, 300);
        assert!(policy.payment_deadline_secs > policy.checkout_session_ttl_secs);
    }

    #[test]
    fn test_parse_positive_rejects_zero() {
        std::env::set_var("TEST_POLICY_ZERO", "0");
        assert_eq!(parse_positive_u64_env("TEST_POLICY_ZERO", 7), 7);
        std::env::remove_var("TEST_POLICY_ZERO");
    }

    #[test]
    fn test_parse_positive_rejects_garbage() {
        std::env::set_var("TEST_POLICY_GARBAGE", "not-a-number");
        assert_eq!(parse_positive_u64_env("TEST_POLICY_GARBAGE", 11), 11);
        std::env::remove_var("TEST_POLICY_GARBAGE");
    }
}
