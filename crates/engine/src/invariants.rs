//! Engine Invariants Module
//!
//! Runnable consistency checks for the voucher and subscription stores.
//! Meant to be run after webhook bursts, batch links, or manual data
//! surgery to confirm the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EngineResult;

/// Result of a single failed invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Record(s) affected
    pub record_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - redemptions or entitlements may be double-counted
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct UnpairedVoucherRow {
    voucher_id: Uuid,
    code: String,
    used_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanRatingRequestRow {
    rating_request_id: Uuid,
    voucher_id: Uuid,
    voucher_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateActivePairRow {
    member_id: Uuid,
    partner_id: Uuid,
    active_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PrematureExpiryRow {
    voucher_id: Uuid,
    expires_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct UnstampedUsedVoucherRow {
    voucher_id: Uuid,
    code: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ActiveWithoutExpiryRow {
    subscription_id: Uuid,
    member_id: Uuid,
    partner_id: Uuid,
}

/// Service for running engine invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary
    pub async fn run_all_checks(&self) -> EngineResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_used_voucher_has_rating_request().await?);
        violations.extend(self.check_rating_request_pairs_used_voucher().await?);
        violations.extend(self.check_single_active_subscription_per_pair().await?);
        violations.extend(self.check_expired_vouchers_past_deadline().await?);
        violations.extend(self.check_used_vouchers_were_verified().await?);
        violations.extend(self.check_active_subscriptions_have_expiry().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: every used voucher has its companion rating request
    ///
    /// Check-in writes both in one transaction; a used voucher without a
    /// rating request means review solicitation and reporting are missing
    /// a redemption.
    async fn check_used_voucher_has_rating_request(
        &self,
    ) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<UnpairedVoucherRow> = sqlx::query_as(
            r#"
            SELECT v.id as voucher_id, v.code, v.used_at
            FROM vouchers v
            WHERE v.status = 'used'
              AND NOT EXISTS (
                  SELECT 1 FROM rating_requests r WHERE r.voucher_id = v.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "used_voucher_has_rating_request".to_string(),
                record_ids: vec![row.voucher_id],
                description: format!(
                    "Used voucher '{}' has no companion rating request",
                    row.code
                ),
                context: serde_json::json!({
                    "code": row.code,
                    "used_at": row.used_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: every rating request points at a used voucher
    ///
    /// The reverse direction of invariant 1; a rating request for an
    /// unused voucher would solicit a review for a redemption that never
    /// happened.
    async fn check_rating_request_pairs_used_voucher(
        &self,
    ) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanRatingRequestRow> = sqlx::query_as(
            r#"
            SELECT r.id as rating_request_id, r.voucher_id, v.status as voucher_status
            FROM rating_requests r
            JOIN vouchers v ON v.id = r.voucher_id
            WHERE v.status != 'used'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "rating_request_pairs_used_voucher".to_string(),
                record_ids: vec![row.rating_request_id],
                description: format!(
                    "Rating request exists but its voucher is '{}', not 'used'",
                    row.voucher_status
                ),
                context: serde_json::json!({
                    "voucher_id": row.voucher_id,
                    "voucher_status": row.voucher_status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: at most one active subscription per (member, partner)
    ///
    /// Supersession demotes older actives in the same transaction that
    /// creates a new one; duplicates mean entitlement checks and partner
    /// reporting double-count.
    async fn check_single_active_subscription_per_pair(
        &self,
    ) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateActivePairRow> = sqlx::query_as(
            r#"
            SELECT member_id, partner_id, COUNT(*) as active_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY member_id, partner_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription_per_pair".to_string(),
                record_ids: vec![row.member_id, row.partner_id],
                description: format!(
                    "Member has {} active subscriptions with the same partner (expected 1)",
                    row.active_count
                ),
                context: serde_json::json!({
                    "member_id": row.member_id,
                    "partner_id": row.partner_id,
                    "active_count": row.active_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: expired vouchers are actually past their deadline
    ///
    /// `expires_at` is fixed at creation and the status machine only moves
    /// forward; an expired voucher with a future deadline means something
    /// wrote a backward or premature transition.
    async fn check_expired_vouchers_past_deadline(
        &self,
    ) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<PrematureExpiryRow> = sqlx::query_as(
            r#"
            SELECT id as voucher_id, expires_at
            FROM vouchers
            WHERE status = 'expired' AND expires_at > NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expired_vouchers_past_deadline".to_string(),
                record_ids: vec![row.voucher_id],
                description: "Voucher is marked expired before its deadline".to_string(),
                context: serde_json::json!({
                    "expires_at": row.expires_at.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: used vouchers carry verification stamps
    ///
    /// The only path to `used` runs through `verified`; a used voucher
    /// without `verified_at`/`used_at` indicates a skipped transition.
    async fn check_used_vouchers_were_verified(&self) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<UnstampedUsedVoucherRow> = sqlx::query_as(
            r#"
            SELECT id as voucher_id, code
            FROM vouchers
            WHERE status = 'used'
              AND (verified_at IS NULL OR used_at IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "used_vouchers_were_verified".to_string(),
                record_ids: vec![row.voucher_id],
                description: format!(
                    "Used voucher '{}' is missing verification or usage stamps",
                    row.code
                ),
                context: serde_json::json!({ "code": row.code }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: active subscriptions have an expiry
    ///
    /// `expires_at` may be null only while `initiated`; an active
    /// subscription without one can never lapse.
    async fn check_active_subscriptions_have_expiry(
        &self,
    ) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<ActiveWithoutExpiryRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, member_id, partner_id
            FROM subscriptions
            WHERE status = 'active' AND expires_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_subscriptions_have_expiry".to_string(),
                record_ids: vec![row.subscription_id],
                description: "Active subscription has no expiry date".to_string(),
                context: serde_json::json!({
                    "member_id": row.member_id,
                    "partner_id": row.partner_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> EngineResult<Vec<InvariantViolation>> {
        match name {
            "used_voucher_has_rating_request" => self.check_used_voucher_has_rating_request().await,
            "rating_request_pairs_used_voucher" => {
                self.check_rating_request_pairs_used_voucher().await
            }
            "single_active_subscription_per_pair" => {
                self.check_single_active_subscription_per_pair().await
            }
            "expired_vouchers_past_deadline" => self.check_expired_vouchers_past_deadline().await,
            "used_vouchers_were_verified" => self.check_used_vouchers_were_verified().await,
            "active_subscriptions_have_expiry" => {
                self.check_active_subscriptions_have_expiry().await
            }
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "used_voucher_has_rating_request",
            "rating_request_pairs_used_voucher",
            "single_active_subscription_per_pair",
            "expired_vouchers_past_deadline",
            "used_vouchers_were_verified",
            "active_subscriptions_have_expiry",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"used_voucher_has_rating_request"));
        assert!(checks.contains(&"single_active_subscription_per_pair"));
    }
}
