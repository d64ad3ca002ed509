//! Subscription reconciliation
//!
//! Converts asynchronous, provider-specific payment events into canonical
//! Subscription records. Providers deliver at-least-once and sometimes out
//! of order, so reconciliation is defended twice: the webhook intake claims
//! the provider event id, and the store enforces a unique
//! `(member_id, partner_id, payment_reference)` idempotency key. The
//! existence check and the insert are the same statement
//! (`INSERT … ON CONFLICT … RETURNING`), inside one transaction with any
//! superseding demotions.
//!
//! Identity failures here are never recovered silently: money changed
//! hands, so the event is parked for manual follow-up and the failure
//! surfaced.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use clubpass_shared::{BillingInterval, PaymentProvider, SubscriptionStatus};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{ActorType, EngineEventBuilder, EngineEventLogger, EngineEventType};
use crate::expiry::is_expired;
use crate::identity::{IdentityHint, IdentityResolver};
use crate::pricing::PlanResolver;

/// Monetary/status signal carried by a payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentSignal {
    Confirmed,
    Canceled,
}

impl PaymentSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentSignal::Confirmed => "confirmed",
            PaymentSignal::Canceled => "canceled",
        }
    }
}

/// Canonical payment event, as produced by the webhook intake.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PaymentEvent {
    pub provider: PaymentProvider,
    /// Provider's event id; claimed by the intake ledger.
    pub event_id: String,
    /// Provider's transaction/subscription reference; part of the
    /// idempotency key.
    pub payment_reference: String,
    pub signal: PaymentSignal,
    pub buyer: IdentityHint,
    pub partner_id: Option<Uuid>,
    pub partner_link_id: Option<Uuid>,
    pub interval: Option<BillingInterval>,
    /// Provider-supplied period end; fallback when no interval descriptor
    /// is present.
    pub period_end: Option<OffsetDateTime>,
    pub amount_cents: Option<i64>,
    pub plan_code: Option<String>,
    pub occurred_at: OffsetDateTime,
}

/// Expiry for the subscription an event produces.
///
/// Interval descriptor first, provider period end second. With neither,
/// the event is malformed: it gets parked for manual review, never
/// guessed at.
pub fn subscription_expiry(event: &PaymentEvent) -> EngineResult<OffsetDateTime> {
    if let Some(interval) = event.interval {
        return Ok(interval.expires_from(event.occurred_at));
    }
    if let Some(period_end) = event.period_end {
        return Ok(period_end);
    }
    Err(EngineError::MalformedEvent(
        "event carries neither a billing interval nor a period end".to_string(),
    ))
}

/// What reconciliation did with an event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum ReconcileOutcome {
    /// A new active subscription was created.
    Created { subscription_id: Uuid },
    /// An `initiated` checkout record was promoted to active.
    Promoted { subscription_id: Uuid },
    /// The idempotency key already exists; nothing was written.
    AlreadyReconciled { subscription_id: Uuid },
    /// A cancellation demoted the subscription to inactive.
    Deactivated { subscription_id: Uuid },
}

/// A stored subscription row.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub member_id: Uuid,
    pub partner_id: Uuid,
    pub status: String,
    pub payment_provider: String,
    pub payment_reference: String,
    pub plan_name: Option<String>,
    pub amount_cents: Option<i64>,
    pub partner_link_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

impl SubscriptionRecord {
    pub fn status(&self) -> EngineResult<SubscriptionStatus> {
        self.status
            .parse()
            .map_err(|e: String| EngineError::Internal(e))
    }
}

/// One partner in an administrative batch link.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PartnerAssignment {
    pub partner_id: Uuid,
    pub interval: BillingInterval,
    pub plan_code: Option<String>,
}

/// An event parked for manual resolution.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ParkedEvent {
    pub id: Uuid,
    pub provider: String,
    pub payment_reference: String,
    pub reason: String,
    pub parked_at: OffsetDateTime,
    pub resolved_at: Option<OffsetDateTime>,
}

/// Split a member's currently-active set against a desired batch.
///
/// Returns `(subscription ids to deactivate, partner ids to create)`:
/// actives outside the batch are demoted, partners already active are kept
/// as-is rather than duplicated, and the rest are created. The resulting
/// active set is exactly the batch.
pub fn partition_active_set(
    current_active: &[(Uuid, Uuid)],
    desired_partners: &[Uuid],
) -> (Vec<Uuid>, Vec<Uuid>) {
    let to_deactivate: Vec<Uuid> = current_active
        .iter()
        .filter(|(_, partner)| !desired_partners.contains(partner))
        .map(|(sub, _)| *sub)
        .collect();

    let mut to_create: Vec<Uuid> = Vec::new();
    for partner in desired_partners {
        let already_active = current_active.iter().any(|(_, p)| p == partner);
        if !already_active && !to_create.contains(partner) {
            to_create.push(*partner);
        }
    }

    (to_deactivate, to_create)
}

/// Entitlement reconciliation service.
#[derive(Clone)]
pub struct ReconciliationService {
    pool: PgPool,
    identity: IdentityResolver,
    pricing: PlanResolver,
    event_logger: EngineEventLogger,
}

impl ReconciliationService {
    pub fn new(pool: PgPool, config: EngineConfig) -> Self {
        let identity = IdentityResolver::new(pool.clone());
        let pricing = PlanResolver::new(pool.clone(), config);
        let event_logger = EngineEventLogger::new(pool.clone());
        Self {
            pool,
            identity,
            pricing,
            event_logger,
        }
    }

    /// Record the start of a checkout as a soft `initiated` subscription.
    ///
    /// Idempotent on the same key: re-entering an unfinished checkout
    /// returns the existing record. Never-completed records are purged by
    /// maintenance after a TTL.
    pub async fn begin_checkout(
        &self,
        buyer: &IdentityHint,
        partner_id: Option<Uuid>,
        partner_link_id: Option<Uuid>,
        provider: PaymentProvider,
        payment_reference: &str,
    ) -> EngineResult<Uuid> {
        let buyer = self.identity.resolve_member(buyer).await?;
        let partner = self
            .identity
            .resolve_partner(partner_id, partner_link_id)
            .await?;

        let now = OffsetDateTime::now_utc();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (member_id, partner_id, status, payment_provider, payment_reference,
                 partner_link_id, created_at, updated_at)
            VALUES ($1, $2, 'initiated', $3, $4, $5, $6, $6)
            ON CONFLICT (member_id, partner_id, payment_reference) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(buyer.member_id)
        .bind(partner)
        .bind(provider.as_str())
        .bind(payment_reference)
        .bind(partner_link_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let subscription_id = match inserted {
            Some((id,)) => {
                if let Err(e) = self
                    .event_logger
                    .log_event(
                        EngineEventBuilder::new(id, EngineEventType::SubscriptionInitiated)
                            .actor(ActorType::Member, buyer.member_id.to_string())
                            .payment_reference(payment_reference)
                            .data(serde_json::json!({
                                "partner_id": partner,
                                "provider": provider.as_str(),
                            })),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log checkout initiated event");
                }
                id
            }
            None => {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM subscriptions
                    WHERE member_id = $1 AND partner_id = $2 AND payment_reference = $3
                    "#,
                )
                .bind(buyer.member_id)
                .bind(partner)
                .bind(payment_reference)
                .fetch_one(&self.pool)
                .await?
            }
        };

        Ok(subscription_id)
    }

    /// Reconcile a canonical payment event into the subscription store.
    pub async fn reconcile(&self, event: &PaymentEvent) -> EngineResult<ReconcileOutcome> {
        if event.signal == PaymentSignal::Canceled {
            return self.deactivate_by_reference(event).await;
        }

        let buyer = match self.identity.resolve_member(&event.buyer).await {
            Ok(buyer) => buyer,
            Err(e) => {
                tracing::warn!(
                    provider = %event.provider,
                    payment_reference = %event.payment_reference,
                    error = %e,
                    "Payment event buyer unresolvable, parking event"
                );
                self.park_event(event, "buyer_unresolvable").await;
                return Err(EngineError::BuyerUnresolvable);
            }
        };

        let partner = match self
            .identity
            .resolve_partner(event.partner_id, event.partner_link_id)
            .await
        {
            Ok(partner) => partner,
            Err(e) => {
                tracing::warn!(
                    provider = %event.provider,
                    payment_reference = %event.payment_reference,
                    error = %e,
                    "Payment event partner unresolvable, parking event"
                );
                self.park_event(event, "partner_unresolvable").await;
                return Err(EngineError::PartnerUnresolvable);
            }
        };

        let expires_at = match subscription_expiry(event) {
            Ok(expires_at) => expires_at,
            Err(e) => {
                self.park_event(event, "missing_billing_interval").await;
                return Err(e);
            }
        };

        // Enrichment only; resolution lands on a hard default rather than
        // failing.
        let plan = self
            .pricing
            .resolve(partner, event.provider, event.plan_code.as_deref())
            .await;

        let now = OffsetDateTime::now_utc();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (member_id, partner_id, status, payment_provider, payment_reference,
                 plan_name, amount_cents, partner_link_id, created_at, updated_at, expires_at)
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7, $8, $8, $9)
            ON CONFLICT (member_id, partner_id, payment_reference) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(buyer.member_id)
        .bind(partner)
        .bind(event.provider.as_str())
        .bind(&event.payment_reference)
        .bind(&plan.name)
        .bind(event.amount_cents.or(plan.amount_cents))
        .bind(event.partner_link_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some((subscription_id,)) => {
                let superseded =
                    Self::supersede_others(&mut tx, buyer.member_id, partner, subscription_id, now)
                        .await?;
                tx.commit()
                    .await
                    .map_err(|e| EngineError::Database(e.to_string()))?;

                tracing::info!(
                    subscription_id = %subscription_id,
                    member_id = %buyer.member_id,
                    partner_id = %partner,
                    superseded = superseded,
                    "Subscription created from payment event"
                );
                ReconcileOutcome::Created { subscription_id }
            }
            None => {
                let existing: (Uuid, String) = sqlx::query_as(
                    r#"
                    SELECT id, status FROM subscriptions
                    WHERE member_id = $1 AND partner_id = $2 AND payment_reference = $3
                    FOR UPDATE
                    "#,
                )
                .bind(buyer.member_id)
                .bind(partner)
                .bind(&event.payment_reference)
                .fetch_one(&mut *tx)
                .await?;

                let (subscription_id, status) = existing;
                if status == SubscriptionStatus::Initiated.as_str() {
                    sqlx::query(
                        r#"
                        UPDATE subscriptions
                        SET status = 'active', plan_name = $2, amount_cents = $3,
                            expires_at = $4, updated_at = $5
                        WHERE id = $1
                        "#,
                    )
                    .bind(subscription_id)
                    .bind(&plan.name)
                    .bind(event.amount_cents.or(plan.amount_cents))
                    .bind(expires_at)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                    let superseded = Self::supersede_others(
                        &mut tx,
                        buyer.member_id,
                        partner,
                        subscription_id,
                        now,
                    )
                    .await?;
                    tx.commit()
                        .await
                        .map_err(|e| EngineError::Database(e.to_string()))?;

                    tracing::info!(
                        subscription_id = %subscription_id,
                        member_id = %buyer.member_id,
                        partner_id = %partner,
                        superseded = superseded,
                        "Initiated checkout promoted to active subscription"
                    );
                    ReconcileOutcome::Promoted { subscription_id }
                } else {
                    // Redelivery; the expected idempotent response, not an
                    // error.
                    tx.commit()
                        .await
                        .map_err(|e| EngineError::Database(e.to_string()))?;
                    tracing::info!(
                        subscription_id = %subscription_id,
                        payment_reference = %event.payment_reference,
                        "Duplicate payment event, already reconciled"
                    );
                    ReconcileOutcome::AlreadyReconciled { subscription_id }
                }
            }
        };

        if let ReconcileOutcome::Created { subscription_id }
        | ReconcileOutcome::Promoted { subscription_id } = &outcome
        {
            if let Err(e) = self
                .event_logger
                .log_event(
                    EngineEventBuilder::new(*subscription_id, EngineEventType::SubscriptionActivated)
                        .actor_type(ActorType::Provider)
                        .provider_event(&event.event_id)
                        .payment_reference(&event.payment_reference)
                        .data(serde_json::json!({
                            "provider": event.provider.as_str(),
                            "plan": plan.name,
                            "expires_at": expires_at.to_string(),
                        })),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log subscription activated event");
            }
        }

        Ok(outcome)
    }

    /// Demote every other active subscription for the pair; a newer active
    /// subscription supersedes older ones.
    async fn supersede_others(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        member_id: Uuid,
        partner_id: Uuid,
        keep_subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> EngineResult<u64> {
        let superseded = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'inactive', updated_at = $4
            WHERE member_id = $1 AND partner_id = $2 AND status = 'active' AND id != $3
            "#,
        )
        .bind(member_id)
        .bind(partner_id)
        .bind(keep_subscription_id)
        .bind(now)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        Ok(superseded)
    }

    /// Handle a cancellation signal: demote the referenced subscription.
    async fn deactivate_by_reference(&self, event: &PaymentEvent) -> EngineResult<ReconcileOutcome> {
        let found: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM subscriptions
            WHERE payment_provider = $1 AND payment_reference = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(event.provider.as_str())
        .bind(&event.payment_reference)
        .fetch_optional(&self.pool)
        .await?;

        let (subscription_id, status) = found.ok_or_else(|| {
            EngineError::NotFound(format!(
                "no subscription for {} reference {}",
                event.provider, event.payment_reference
            ))
        })?;

        if status == SubscriptionStatus::Inactive.as_str() {
            // Cancellation redelivered; nothing left to demote.
            return Ok(ReconcileOutcome::AlreadyReconciled { subscription_id });
        }

        sqlx::query("UPDATE subscriptions SET status = 'inactive', updated_at = $2 WHERE id = $1")
            .bind(subscription_id)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                EngineEventBuilder::new(subscription_id, EngineEventType::SubscriptionDeactivated)
                    .actor_type(ActorType::Provider)
                    .provider_event(&event.event_id)
                    .payment_reference(&event.payment_reference)
                    .data(serde_json::json!({ "provider": event.provider.as_str() })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription deactivated event");
        }

        tracing::info!(
            subscription_id = %subscription_id,
            payment_reference = %event.payment_reference,
            "Subscription deactivated on provider cancellation"
        );

        Ok(ReconcileOutcome::Deactivated { subscription_id })
    }

    /// Administrative bulk link: replace a member's active set with the
    /// given assignments.
    ///
    /// Deactivations and creations are applied in one transaction, so no
    /// reader observes a window with zero or duplicate active partners
    /// from partial application.
    pub async fn batch_link_member(
        &self,
        member_id: Uuid,
        assignments: &[PartnerAssignment],
        admin_id: Uuid,
    ) -> EngineResult<Vec<SubscriptionRecord>> {
        let member_exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM members WHERE id = $1")
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await?;
        if member_exists.is_none() {
            return Err(EngineError::NotFound(format!("member {}", member_id)));
        }

        for assignment in assignments {
            self.identity
                .resolve_partner(Some(assignment.partner_id), None)
                .await?;
        }

        let now = OffsetDateTime::now_utc();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        let current_active: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "SELECT id, partner_id FROM subscriptions WHERE member_id = $1 AND status = 'active' FOR UPDATE",
        )
        .bind(member_id)
        .fetch_all(&mut *tx)
        .await?;

        let desired: Vec<Uuid> = assignments.iter().map(|a| a.partner_id).collect();
        let (to_deactivate, to_create) = partition_active_set(&current_active, &desired);

        if !to_deactivate.is_empty() {
            sqlx::query(
                "UPDATE subscriptions SET status = 'inactive', updated_at = $2 WHERE id = ANY($1)",
            )
            .bind(&to_deactivate)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let mut created = Vec::with_capacity(to_create.len());
        for partner_id in &to_create {
            let assignment = assignments
                .iter()
                .find(|a| a.partner_id == *partner_id)
                .ok_or_else(|| EngineError::Internal("assignment vanished".to_string()))?;

            let record: SubscriptionRecord = sqlx::query_as(
                r#"
                INSERT INTO subscriptions
                    (member_id, partner_id, status, payment_provider, payment_reference,
                     plan_name, created_at, updated_at, expires_at)
                VALUES ($1, $2, 'active', 'manual', $3, $4, $5, $5, $6)
                RETURNING *
                "#,
            )
            .bind(member_id)
            .bind(partner_id)
            .bind(format!("manual-{}", Uuid::new_v4()))
            .bind(&assignment.plan_code)
            .bind(now)
            .bind(assignment.interval.expires_from(now))
            .fetch_one(&mut *tx)
            .await?;

            created.push(record);
        }

        tx.commit()
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        if let Err(e) = self
            .event_logger
            .log_event(
                EngineEventBuilder::new(member_id, EngineEventType::BatchLinkApplied)
                    .actor(ActorType::Admin, admin_id.to_string())
                    .data(serde_json::json!({
                        "deactivated": to_deactivate.len(),
                        "created": created.iter().map(|s| s.id).collect::<Vec<_>>(),
                        "partners": desired,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log batch link event");
        }

        tracing::info!(
            member_id = %member_id,
            deactivated = to_deactivate.len(),
            created = created.len(),
            "Batch link applied"
        );

        Ok(created)
    }

    /// A member's entitlements with read-time expiration applied: active
    /// status alone is not enough, the deadline must still be ahead.
    pub async fn active_entitlements(
        &self,
        member_id: Uuid,
    ) -> EngineResult<Vec<SubscriptionRecord>> {
        let rows: Vec<SubscriptionRecord> = sqlx::query_as(
            "SELECT * FROM subscriptions WHERE member_id = $1 AND status = 'active' ORDER BY created_at DESC",
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;

        let now = OffsetDateTime::now_utc();
        Ok(rows
            .into_iter()
            .filter(|s| !s.expires_at.map(|at| is_expired(at, now)).unwrap_or(true))
            .collect())
    }

    /// Whether a member currently holds an unexpired active subscription
    /// with a partner.
    pub async fn is_entitled(&self, member_id: Uuid, partner_id: Uuid) -> EngineResult<bool> {
        let entitled = self
            .active_entitlements(member_id)
            .await?
            .iter()
            .any(|s| s.partner_id == partner_id);
        Ok(entitled)
    }

    /// Park an event for manual resolution. Parking must not lose the
    /// event: a failed insert is logged at error level for operator
    /// attention.
    async fn park_event(&self, event: &PaymentEvent, reason: &str) {
        let payload = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);

        let result = sqlx::query(
            r#"
            INSERT INTO parked_events (provider, payment_reference, reason, payload, parked_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.provider.as_str())
        .bind(&event.payment_reference)
        .bind(reason)
        .bind(&payload)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                provider = %event.provider,
                payment_reference = %event.payment_reference,
                reason = %reason,
                error = %e,
                "CRITICAL: failed to park unreconcilable payment event; \
                 event details survive only in this log line"
            );
        }
    }

    /// Unresolved parked events, oldest first.
    pub async fn list_parked(&self) -> EngineResult<Vec<ParkedEvent>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, provider, payment_reference, reason, parked_at, resolved_at
            FROM parked_events
            WHERE resolved_at IS NULL
            ORDER BY parked_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Purge `initiated` records that never completed within the TTL.
    pub async fn purge_stale_initiated(&self, ttl_hours: i64) -> EngineResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::hours(ttl_hours);
        let purged = sqlx::query(
            "DELETE FROM subscriptions WHERE status = 'initiated' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if purged > 0 {
            tracing::info!(purged = purged, ttl_hours = ttl_hours, "Purged stale initiated subscriptions");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clubpass_shared::IntervalUnit;
    use time::macros::datetime;

    fn confirmed_event(interval: Option<BillingInterval>, period_end: Option<OffsetDateTime>) -> PaymentEvent {
        PaymentEvent {
            provider: PaymentProvider::Stripe,
            event_id: "evt_1".to_string(),
            payment_reference: "pay_999".to_string(),
            signal: PaymentSignal::Confirmed,
            buyer: IdentityHint::from_document_id("member-1"),
            partner_id: Some(Uuid::new_v4()),
            partner_link_id: None,
            interval,
            period_end,
            amount_cents: Some(4900),
            plan_code: None,
            occurred_at: datetime!(2024-03-10 12:00 UTC),
        }
    }

    #[test]
    fn test_expiry_from_monthly_interval() {
        let event = confirmed_event(Some(BillingInterval::new(IntervalUnit::Month, 1)), None);
        assert_eq!(
            subscription_expiry(&event).unwrap(),
            datetime!(2024-04-10 12:00 UTC)
        );
    }

    #[test]
    fn test_expiry_falls_back_to_period_end() {
        let period_end = datetime!(2024-05-01 00:00 UTC);
        let event = confirmed_event(None, Some(period_end));
        assert_eq!(subscription_expiry(&event).unwrap(), period_end);
    }

    #[test]
    fn test_interval_takes_precedence_over_period_end() {
        let event = confirmed_event(
            Some(BillingInterval::new(IntervalUnit::Week, 2)),
            Some(datetime!(2030-01-01 00:00 UTC)),
        );
        assert_eq!(
            subscription_expiry(&event).unwrap(),
            datetime!(2024-03-24 12:00 UTC)
        );
    }

    #[test]
    fn test_expiry_without_interval_or_period_end_is_malformed() {
        let event = confirmed_event(None, None);
        assert!(matches!(
            subscription_expiry(&event),
            Err(EngineError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_partition_replaces_active_set() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let p3 = Uuid::new_v4();
        let sub3 = Uuid::new_v4();

        // Member previously active with P3; batch says [P1, P2]
        let current = vec![(sub3, p3)];
        let (deactivate, create) = partition_active_set(&current, &[p1, p2]);

        assert_eq!(deactivate, vec![sub3]);
        assert_eq!(create, vec![p1, p2]);
    }

    #[test]
    fn test_partition_keeps_overlapping_partner() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let sub1 = Uuid::new_v4();

        // P1 already active: kept, not duplicated
        let current = vec![(sub1, p1)];
        let (deactivate, create) = partition_active_set(&current, &[p1, p2]);

        assert!(deactivate.is_empty());
        assert_eq!(create, vec![p2]);
    }

    #[test]
    fn test_partition_empty_batch_clears_active_set() {
        let sub = Uuid::new_v4();
        let current = vec![(sub, Uuid::new_v4())];
        let (deactivate, create) = partition_active_set(&current, &[]);

        assert_eq!(deactivate, vec![sub]);
        assert!(create.is_empty());
    }

    #[test]
    fn test_partition_dedupes_requested_partners() {
        let p1 = Uuid::new_v4();
        let (deactivate, create) = partition_active_set(&[], &[p1, p1]);

        assert!(deactivate.is_empty());
        assert_eq!(create, vec![p1]);
    }
}
