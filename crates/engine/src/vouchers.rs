//! Voucher lifecycle
//!
//! Owns creation, validation, check-in and lazy expiration of single-use
//! discount vouchers. Status only moves forward (`pending → verified →
//! used`, with `expired` reachable from the first two); vouchers are never
//! hard-deleted, reporting depends on the full history.
//!
//! Check-in is the one operation with hard atomicity requirements: the
//! `verified → used` transition and the companion rating-request record
//! are written in a single transaction, and the precondition read happens
//! inside that same transaction under a row lock so concurrent check-ins
//! cannot both win.

use rand::Rng;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use clubpass_shared::VoucherStatus;

use crate::error::{EngineError, EngineResult};
use crate::events::{ActorType, EngineEventBuilder, EngineEventLogger, EngineEventType};
use crate::expiry::should_expire;
use crate::identity::{IdentityHint, IdentityResolver};
use crate::throttle::ThrottleGate;

/// Code alphabet: uppercase alphanumerics minus the lookalikes 0/O/1/I.
/// Codes are matched exactly, never case-folded.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;
const MAX_CODE_ATTEMPTS: u32 = 5;

pub(crate) fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Why a voucher in `status` cannot be validated. `None` means it can.
fn validation_rejection(status: VoucherStatus) -> Option<&'static str> {
    match status {
        VoucherStatus::Pending => None,
        VoucherStatus::Verified => Some("voucher was already verified"),
        VoucherStatus::Used => Some("voucher was already used"),
        VoucherStatus::Expired => Some("voucher expired"),
    }
}

/// A stored voucher row.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct VoucherRecord {
    pub id: Uuid,
    pub code: String,
    pub establishment_id: Uuid,
    /// Member reference as supplied at generation time. Historically this
    /// slot has carried document ids and external auth ids alike, so it is
    /// stored verbatim and resolved through the identity fallback chain.
    pub member_ref: String,
    pub member_email: Option<String>,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub verified_at: Option<OffsetDateTime>,
    pub verified_by: Option<Uuid>,
    pub used_at: Option<OffsetDateTime>,
    pub used_by: Option<Uuid>,
}

impl VoucherRecord {
    pub fn status(&self) -> EngineResult<VoucherStatus> {
        self.status
            .parse()
            .map_err(|e: String| EngineError::Internal(e))
    }

    /// Status as observed at read time: the stored status with the lazy
    /// expiration check applied. Listing paths use this so no caller ever
    /// sees a voucher as usable past its deadline, even when the stored
    /// status has not been swept yet.
    pub fn effective_status(&self, now: OffsetDateTime) -> EngineResult<VoucherStatus> {
        let status = self.status()?;
        if should_expire(status, self.expires_at, now) {
            Ok(VoucherStatus::Expired)
        } else {
            Ok(status)
        }
    }
}

/// Result of a successful generation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GeneratedVoucher {
    pub voucher_id: Uuid,
    pub code: String,
    pub expires_at: OffsetDateTime,
}

/// Member display identity attached to a validation response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemberSummary {
    pub member_id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub photo_url: Option<String>,
}

/// Establishment display fields attached to a validation response.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct EstablishmentSummary {
    pub establishment_id: Uuid,
    pub name: String,
}

/// Response to a successful validation.
///
/// `member` is `None` when identity resolution exhausted its fallback
/// chain; the verification itself still stands, enrichment is
/// presentation, not correctness.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationResponse {
    pub voucher: VoucherRecord,
    pub member: Option<MemberSummary>,
    pub establishment: EstablishmentSummary,
}

/// Confirmation of a completed check-in.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckInConfirmation {
    pub voucher_id: Uuid,
    pub rating_request_id: Uuid,
    pub used_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct EstablishmentRow {
    name: String,
    active: bool,
    voucher_expiration_hours: i32,
}

/// Voucher state machine service.
#[derive(Clone)]
pub struct VoucherService {
    pool: PgPool,
    throttle: ThrottleGate,
    identity: IdentityResolver,
    event_logger: EngineEventLogger,
}

impl VoucherService {
    pub fn new(pool: PgPool) -> Self {
        let throttle = ThrottleGate::new(pool.clone());
        let identity = IdentityResolver::new(pool.clone());
        let event_logger = EngineEventLogger::new(pool.clone());
        Self {
            pool,
            throttle,
            identity,
            event_logger,
        }
    }

    pub fn throttle(&self) -> &ThrottleGate {
        &self.throttle
    }

    /// Generate a new voucher for a member at an establishment.
    ///
    /// Preconditions: the establishment exists and is active, and the
    /// throttle gate allows the pair. Creating the voucher is what
    /// advances the throttle window; no separate timestamp is written.
    pub async fn generate(
        &self,
        establishment_id: Uuid,
        member_ref: &str,
    ) -> EngineResult<GeneratedVoucher> {
        let establishment: Option<EstablishmentRow> = sqlx::query_as(
            "SELECT name, active, voucher_expiration_hours FROM establishments WHERE id = $1",
        )
        .bind(establishment_id)
        .fetch_optional(&self.pool)
        .await?;

        let establishment = establishment
            .filter(|e| e.active)
            .ok_or_else(|| EngineError::NotFound(format!("establishment {}", establishment_id)))?;

        if let Some(next_available_at) = self
            .throttle
            .next_available_at(establishment_id, member_ref)
            .await?
        {
            return Err(EngineError::Throttled { next_available_at });
        }

        // Email snapshot feeds the validation-time enrichment fallback.
        // Resolution failure must not block generation.
        let member_email = match self
            .identity
            .resolve_member(&IdentityHint::from_document_id(member_ref))
            .await
        {
            Ok(identity) => identity.email,
            Err(e) => {
                tracing::debug!(member_ref = %member_ref, error = %e,
                    "Member not resolvable at generation time, skipping email snapshot");
                None
            }
        };

        let now = OffsetDateTime::now_utc();
        let expires_at = now + Duration::hours(establishment.voucher_expiration_hours as i64);

        // Codes are random; collisions are resolved by regenerating, with
        // the unique index as the arbiter.
        let mut created: Option<(Uuid, String)> = None;
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code();
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO vouchers
                    (code, establishment_id, member_ref, member_email, status, created_at, expires_at)
                VALUES ($1, $2, $3, $4, 'pending', $5, $6)
                ON CONFLICT (code) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&code)
            .bind(establishment_id)
            .bind(member_ref)
            .bind(&member_email)
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((id,)) = inserted {
                created = Some((id, code));
                break;
            }
        }

        let (voucher_id, code) = created.ok_or_else(|| {
            EngineError::Internal(format!(
                "could not allocate a unique voucher code after {} attempts",
                MAX_CODE_ATTEMPTS
            ))
        })?;

        if let Err(e) = self
            .event_logger
            .log_event(
                EngineEventBuilder::new(voucher_id, EngineEventType::VoucherGenerated)
                    .actor(ActorType::Member, member_ref)
                    .data(serde_json::json!({
                        "establishment_id": establishment_id,
                        "establishment_name": establishment.name,
                        "expires_at": expires_at.to_string(),
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log voucher generated event");
        }

        tracing::info!(
            voucher_id = %voucher_id,
            establishment_id = %establishment_id,
            member_ref = %member_ref,
            expires_at = %expires_at,
            "Voucher generated"
        );

        Ok(GeneratedVoucher {
            voucher_id,
            code,
            expires_at,
        })
    }

    /// Validate a voucher by code on behalf of an operator.
    ///
    /// Applies the lazy expiration check before anything else: an overdue
    /// pending/verified voucher is persisted as `expired` and then
    /// rejected. On success the voucher moves `pending → verified` and the
    /// response is enriched with the member's display identity through the
    /// resolver's fallback chain.
    pub async fn validate(&self, code: &str, operator_id: Uuid) -> EngineResult<ValidationResponse> {
        let voucher: Option<VoucherRecord> =
            sqlx::query_as("SELECT * FROM vouchers WHERE code = $1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;

        let voucher =
            voucher.ok_or_else(|| EngineError::NotFound(format!("voucher code {}", code)))?;
        let status = voucher.status()?;
        let now = OffsetDateTime::now_utc();

        if should_expire(status, voucher.expires_at, now) {
            self.persist_expiration(&voucher, status).await?;
            return Err(EngineError::invalid_state("voucher expired"));
        }

        if let Some(reason) = validation_rejection(status) {
            return Err(EngineError::invalid_state(reason));
        }

        let verified: Option<VoucherRecord> = sqlx::query_as(
            r#"
            UPDATE vouchers
            SET status = 'verified', verified_at = $2, verified_by = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(voucher.id)
        .bind(now)
        .bind(operator_id)
        .fetch_optional(&self.pool)
        .await?;

        let verified = verified.ok_or_else(|| {
            EngineError::ConcurrentModification(
                "voucher left the pending state during validation".to_string(),
            )
        })?;

        let member = self.enrich_member(&verified).await;

        let establishment: EstablishmentSummary = sqlx::query_as(
            "SELECT id as establishment_id, name FROM establishments WHERE id = $1",
        )
        .bind(verified.establishment_id)
        .fetch_one(&self.pool)
        .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                EngineEventBuilder::new(verified.id, EngineEventType::VoucherValidated)
                    .actor(ActorType::Operator, operator_id.to_string())
                    .data(serde_json::json!({
                        "member_resolved": member.is_some(),
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log voucher validated event");
        }

        tracing::info!(
            voucher_id = %verified.id,
            operator_id = %operator_id,
            member_resolved = member.is_some(),
            "Voucher validated"
        );

        Ok(ValidationResponse {
            voucher: verified,
            member,
            establishment,
        })
    }

    /// Check in (redeem) an already-validated voucher.
    ///
    /// The precondition read, the `verified → used` transition and the
    /// companion rating-request insert all run inside one transaction:
    /// either the voucher is used and its rating request exists, or
    /// neither. Of two concurrent check-ins, exactly one commits; the
    /// loser observes the state error.
    pub async fn check_in(&self, code: &str, operator_id: Uuid) -> EngineResult<CheckInConfirmation> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        let voucher: Option<VoucherRecord> =
            sqlx::query_as("SELECT * FROM vouchers WHERE code = $1 FOR UPDATE")
                .bind(code)
                .fetch_optional(&mut *tx)
                .await?;

        let voucher =
            voucher.ok_or_else(|| EngineError::NotFound(format!("voucher code {}", code)))?;
        let status = voucher.status()?;
        let now = OffsetDateTime::now_utc();

        if should_expire(status, voucher.expires_at, now) {
            // Persist the sweep before rejecting; the rejection must not
            // roll it back.
            sqlx::query("UPDATE vouchers SET status = 'expired' WHERE id = $1")
                .bind(voucher.id)
                .execute(&mut *tx)
                .await?;
            tx.commit()
                .await
                .map_err(|e| EngineError::Database(e.to_string()))?;
            return Err(EngineError::invalid_state("voucher expired"));
        }

        if status != VoucherStatus::Verified {
            return Err(EngineError::invalid_state(format!(
                "check-in requires a verified voucher, found '{}'",
                status
            )));
        }

        let updated = sqlx::query(
            r#"
            UPDATE vouchers
            SET status = 'used', used_at = $2, used_by = $3
            WHERE id = $1 AND status = 'verified'
            "#,
        )
        .bind(voucher.id)
        .bind(now)
        .bind(operator_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(EngineError::ConcurrentModification(
                "voucher was checked in by another operator".to_string(),
            ));
        }

        let rating_request_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO rating_requests (voucher_id, member_ref, establishment_id, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(voucher.id)
        .bind(&voucher.member_ref)
        .bind(voucher.establishment_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        if let Err(e) = self
            .event_logger
            .log_event(
                EngineEventBuilder::new(voucher.id, EngineEventType::VoucherCheckedIn)
                    .actor(ActorType::Operator, operator_id.to_string())
                    .data(serde_json::json!({
                        "rating_request_id": rating_request_id,
                        "establishment_id": voucher.establishment_id,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log voucher check-in event");
        }

        tracing::info!(
            voucher_id = %voucher.id,
            rating_request_id = %rating_request_id,
            operator_id = %operator_id,
            "Voucher checked in"
        );

        Ok(CheckInConfirmation {
            voucher_id: voucher.id,
            rating_request_id,
            used_at: now,
        })
    }

    /// Vouchers for an establishment with read-time expiration applied.
    pub async fn list_for_establishment(
        &self,
        establishment_id: Uuid,
    ) -> EngineResult<Vec<(VoucherRecord, VoucherStatus)>> {
        let rows: Vec<VoucherRecord> = sqlx::query_as(
            "SELECT * FROM vouchers WHERE establishment_id = $1 ORDER BY created_at DESC",
        )
        .bind(establishment_id)
        .fetch_all(&self.pool)
        .await?;

        let now = OffsetDateTime::now_utc();
        rows.into_iter()
            .map(|v| v.effective_status(now).map(|s| (v, s)))
            .collect()
    }

    /// Bulk lazy sweep for maintenance: persist `expired` on every overdue
    /// pending/verified voucher. Returns the number of rows swept.
    pub async fn sweep_overdue(&self) -> EngineResult<u64> {
        let swept = sqlx::query(
            r#"
            UPDATE vouchers
            SET status = 'expired'
            WHERE status IN ('pending', 'verified') AND expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if swept > 0 {
            tracing::info!(swept = swept, "Swept overdue vouchers");
        }
        Ok(swept)
    }

    /// Persist a lazy expiration observed outside a transaction, guarded
    /// against racing writers.
    async fn persist_expiration(
        &self,
        voucher: &VoucherRecord,
        from_status: VoucherStatus,
    ) -> EngineResult<()> {
        let updated = sqlx::query("UPDATE vouchers SET status = 'expired' WHERE id = $1 AND status = $2")
            .bind(voucher.id)
            .bind(from_status.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated > 0 {
            if let Err(e) = self
                .event_logger
                .log_event(
                    EngineEventBuilder::new(voucher.id, EngineEventType::VoucherExpired).data(
                        serde_json::json!({
                            "expires_at": voucher.expires_at.to_string(),
                            "previous_status": from_status.as_str(),
                        }),
                    ),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log voucher expired event");
            }
        }
        Ok(())
    }

    async fn enrich_member(&self, voucher: &VoucherRecord) -> Option<MemberSummary> {
        let hint = IdentityHint {
            document_id: Some(voucher.member_ref.clone()),
            external_auth_id: None,
            email: voucher.member_email.clone(),
        };

        match self.identity.resolve_member(&hint).await {
            Ok(identity) => Some(MemberSummary {
                member_id: identity.member_id,
                name: identity.name,
                email: identity.email,
                phone: identity.phone,
                photo_url: identity.photo_url,
            }),
            Err(e) => {
                // Verification stands; only the display identity is missing.
                tracing::warn!(
                    voucher_id = %voucher.id,
                    member_ref = %voucher.member_ref,
                    error = %e,
                    "Member enrichment failed for verified voucher"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(status: &str, expires_at: OffsetDateTime) -> VoucherRecord {
        VoucherRecord {
            id: Uuid::new_v4(),
            code: "ABCD2345".to_string(),
            establishment_id: Uuid::new_v4(),
            member_ref: "member-1".to_string(),
            member_email: None,
            status: status.to_string(),
            created_at: expires_at - Duration::hours(48),
            expires_at,
            verified_at: None,
            verified_by: None,
            used_at: None,
            used_by: None,
        }
    }

    #[test]
    fn test_generated_codes_use_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LENGTH);
            for c in code.bytes() {
                assert!(CODE_ALPHABET.contains(&c), "unexpected character {}", c as char);
            }
            assert!(!code.contains('0'));
            assert!(!code.contains('O'));
            assert!(!code.contains('1'));
            assert!(!code.contains('I'));
        }
    }

    #[test]
    fn test_generated_codes_vary() {
        let a = generate_code();
        let b = generate_code();
        assert_ne!(a, b);
    }

    #[test]
    fn test_validation_rejection_reasons() {
        assert!(validation_rejection(VoucherStatus::Pending).is_none());
        assert_eq!(
            validation_rejection(VoucherStatus::Used),
            Some("voucher was already used")
        );
        assert_eq!(
            validation_rejection(VoucherStatus::Expired),
            Some("voucher expired")
        );
        assert_eq!(
            validation_rejection(VoucherStatus::Verified),
            Some("voucher was already verified")
        );
    }

    #[test]
    fn test_effective_status_applies_lazy_expiration() {
        let deadline = datetime!(2024-05-01 00:00 UTC);
        let after = datetime!(2024-05-03 00:00 UTC);
        let before = datetime!(2024-04-30 00:00 UTC);

        let pending = record("pending", deadline);
        assert_eq!(
            pending.effective_status(after).unwrap(),
            VoucherStatus::Expired
        );
        assert_eq!(
            pending.effective_status(before).unwrap(),
            VoucherStatus::Pending
        );
    }

    #[test]
    fn test_effective_status_never_expires_used() {
        let deadline = datetime!(2024-05-01 00:00 UTC);
        let long_after = datetime!(2024-06-01 00:00 UTC);

        let used = record("used", deadline);
        assert_eq!(used.effective_status(long_after).unwrap(), VoucherStatus::Used);
    }

    #[test]
    fn test_unknown_stored_status_is_an_internal_error() {
        let bad = record("refunded", datetime!(2024-05-01 00:00 UTC));
        assert!(matches!(bad.status(), Err(EngineError::Internal(_))));
    }
}
