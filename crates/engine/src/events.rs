//! Engine audit events
//!
//! Insert-only audit trail for voucher and subscription mutations. Logging
//! failures are warnings at call sites, never operation failures: the
//! business transaction has already committed by the time the event is
//! written.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EngineResult;

/// Who triggered a recorded mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ActorType {
    Member,
    Operator,
    Admin,
    Provider,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Member => "member",
            ActorType::Operator => "operator",
            ActorType::Admin => "admin",
            ActorType::Provider => "provider",
            ActorType::System => "system",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EngineEventType {
    VoucherGenerated,
    VoucherValidated,
    VoucherCheckedIn,
    VoucherExpired,
    SubscriptionInitiated,
    SubscriptionActivated,
    SubscriptionSuperseded,
    SubscriptionDeactivated,
    EventParked,
    BatchLinkApplied,
}

impl EngineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineEventType::VoucherGenerated => "voucher_generated",
            EngineEventType::VoucherValidated => "voucher_validated",
            EngineEventType::VoucherCheckedIn => "voucher_checked_in",
            EngineEventType::VoucherExpired => "voucher_expired",
            EngineEventType::SubscriptionInitiated => "subscription_initiated",
            EngineEventType::SubscriptionActivated => "subscription_activated",
            EngineEventType::SubscriptionSuperseded => "subscription_superseded",
            EngineEventType::SubscriptionDeactivated => "subscription_deactivated",
            EngineEventType::EventParked => "event_parked",
            EngineEventType::BatchLinkApplied => "batch_link_applied",
        }
    }
}

/// Builder for a single audit row.
#[derive(Debug, Clone)]
pub struct EngineEventBuilder {
    subject_id: Uuid,
    event_type: EngineEventType,
    actor_type: ActorType,
    actor_id: Option<String>,
    provider_event_id: Option<String>,
    payment_reference: Option<String>,
    data: serde_json::Value,
}

impl EngineEventBuilder {
    pub fn new(subject_id: Uuid, event_type: EngineEventType) -> Self {
        Self {
            subject_id,
            event_type,
            actor_type: ActorType::System,
            actor_id: None,
            provider_event_id: None,
            payment_reference: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.provider_event_id = Some(event_id.into());
        self
    }

    pub fn payment_reference(mut self, reference: impl Into<String>) -> Self {
        self.payment_reference = Some(reference.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Writer for the `engine_events` audit table.
#[derive(Clone)]
pub struct EngineEventLogger {
    pool: PgPool,
}

impl EngineEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, event: EngineEventBuilder) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_events
                (subject_id, event_type, actor_type, actor_id,
                 provider_event_id, payment_reference, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.subject_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(&event.actor_id)
        .bind(&event.provider_event_id)
        .bind(&event.payment_reference)
        .bind(&event.data)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_are_snake_case() {
        assert_eq!(
            EngineEventType::VoucherCheckedIn.as_str(),
            "voucher_checked_in"
        );
        assert_eq!(
            EngineEventType::SubscriptionSuperseded.as_str(),
            "subscription_superseded"
        );
    }

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let event = EngineEventBuilder::new(Uuid::new_v4(), EngineEventType::VoucherExpired);
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.actor_id.is_none());
    }
}
