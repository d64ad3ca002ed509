// Engine crate clippy configuration
#![allow(clippy::result_large_err)] // EngineError::Throttled carries scheduling data
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clubpass Engine
//!
//! Core of the membership discount platform: the voucher lifecycle and the
//! subscription reconciliation engine.
//!
//! ## Features
//!
//! - **Vouchers**: throttled generation, operator validation, atomic
//!   check-in with its companion rating request, lazy expiration
//! - **Reconciliation**: provider payment events upserted idempotently
//!   into canonical Subscription records
//! - **Identity Resolution**: ordered fallback chain over document id,
//!   external auth id and email, with self-healing for identifier drift
//! - **Webhooks**: signature verification, payload parsing, event-id
//!   idempotency ledger
//! - **Invariants**: runnable consistency checks over both stores
//!
//! HTTP routing, dashboards and templated email live outside this crate;
//! handlers call in through the service structs re-exported here.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod expiry;
pub mod identity;
pub mod invariants;
pub mod pricing;
pub mod reconcile;
pub mod throttle;
pub mod vouchers;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Cache
pub use cache::ReadCache;

// Config
pub use config::{EngineConfig, ProviderEndpoint};

// Error
pub use error::{EngineError, EngineResult};

// Events
pub use events::{ActorType, EngineEventBuilder, EngineEventLogger, EngineEventType};

// Expiry
pub use expiry::{is_expired, should_expire};

// Identity
pub use identity::{CanonicalIdentity, IdentityHint, IdentityResolver, LookupStrategy};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Pricing
pub use pricing::{PlanResolver, PlanSource, ResolvedPlan};

// Reconciliation
pub use reconcile::{
    ParkedEvent, PartnerAssignment, PaymentEvent, PaymentSignal, ReconcileOutcome,
    ReconciliationService, SubscriptionRecord,
};

// Throttle
pub use throttle::ThrottleGate;

// Vouchers
pub use vouchers::{
    CheckInConfirmation, EstablishmentSummary, GeneratedVoucher, MemberSummary,
    ValidationResponse, VoucherRecord, VoucherService,
};

// Webhooks
pub use webhooks::{ParsedWebhook, WebhookIntake, WebhookOutcome};

use sqlx::PgPool;

/// Main engine service combining the voucher and reconciliation stacks
pub struct EngineService {
    pub config: EngineConfig,
    pub identity: IdentityResolver,
    pub invariants: InvariantChecker,
    pub reconciliation: ReconciliationService,
    pub throttle: ThrottleGate,
    pub vouchers: VoucherService,
    pub webhooks: WebhookIntake,
}

impl EngineService {
    /// Create an engine service from environment variables
    pub fn from_env(pool: PgPool) -> EngineResult<Self> {
        let config = EngineConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create an engine service with explicit config
    pub fn new(config: EngineConfig, pool: PgPool) -> Self {
        Self {
            identity: IdentityResolver::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            reconciliation: ReconciliationService::new(pool.clone(), config.clone()),
            throttle: ThrottleGate::new(pool.clone()),
            vouchers: VoucherService::new(pool.clone()),
            webhooks: WebhookIntake::new(pool, config.clone()),
            config,
        }
    }
}
