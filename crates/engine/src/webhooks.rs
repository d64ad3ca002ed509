//! Provider webhook intake
//!
//! The boundary between raw provider deliveries and the canonical
//! `PaymentEvent` the reconciler consumes: signature verification, payload
//! parsing, and event-id-level idempotency.
//!
//! Signature verification is manual (`t=<unix>,v1=<hex hmac>` header,
//! HMAC-SHA256 over `"{t}.{payload}"`, five-minute tolerance) so it works
//! uniformly across providers. The idempotency claim uses
//! `INSERT … ON CONFLICT … RETURNING` to atomically take exclusive
//! processing rights, with recovery for events stuck in `processing`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

use clubpass_shared::{BillingInterval, PaymentProvider};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityHint;
use crate::reconcile::{PaymentEvent, PaymentSignal, ReconcileOutcome, ReconciliationService};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;
const PROCESSING_TIMEOUT_MINUTES: i32 = 15;

/// What the intake did with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed(ReconcileOutcome),
    /// The provider event id was already claimed or processed.
    Duplicate,
    /// Verified and parsed, but the event type carries no signal this
    /// engine acts on.
    Ignored { event_type: String },
}

/// Either a canonical event or a verified-but-irrelevant delivery.
#[derive(Debug, Clone)]
pub enum ParsedWebhook {
    Event(PaymentEvent),
    Ignored { event_type: String },
}

/// Verify a `t=<unix>,v1=<hex>` signature header against a payload.
pub fn verify_signature(secret: &str, payload: &str, header: &str) -> EngineResult<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    verify_signature_at(secret, payload, header, now)
}

fn verify_signature_at(
    secret: &str,
    payload: &str,
    header: &str,
    now_unix: i64,
) -> EngineResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in webhook signature header");
        EngineError::WebhookSignatureInvalid
    })?;
    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in webhook signature header");
        EngineError::WebhookSignatureInvalid
    })?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(EngineError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| EngineError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(EngineError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Parse a verified payload into a canonical event.
pub fn parse_event(
    provider: PaymentProvider,
    payload: &serde_json::Value,
) -> EngineResult<ParsedWebhook> {
    match provider {
        PaymentProvider::Stripe => parse_stripe_event(payload),
        PaymentProvider::MercadoPago => parse_mercado_pago_event(payload),
        PaymentProvider::Manual => Err(EngineError::MalformedEvent(
            "manual subscriptions do not deliver webhooks".to_string(),
        )),
    }
}

fn parse_stripe_event(payload: &serde_json::Value) -> EngineResult<ParsedWebhook> {
    let event_id = payload["id"]
        .as_str()
        .ok_or_else(|| EngineError::MalformedEvent("stripe event missing id".to_string()))?
        .to_string();
    let event_type = payload["type"]
        .as_str()
        .ok_or_else(|| EngineError::MalformedEvent("stripe event missing type".to_string()))?;

    let signal = match event_type {
        "checkout.session.completed" | "invoice.paid" => PaymentSignal::Confirmed,
        "customer.subscription.deleted" => PaymentSignal::Canceled,
        other => {
            return Ok(ParsedWebhook::Ignored {
                event_type: other.to_string(),
            })
        }
    };

    let object = &payload["data"]["object"];
    let metadata = &object["metadata"];

    let payment_reference = object["subscription"]
        .as_str()
        .or_else(|| object["id"].as_str())
        .ok_or_else(|| {
            EngineError::MalformedEvent("stripe event missing payment reference".to_string())
        })?
        .to_string();

    let buyer = IdentityHint {
        document_id: metadata["member_id"]
            .as_str()
            .or_else(|| object["client_reference_id"].as_str())
            .map(str::to_string),
        external_auth_id: None,
        email: object["customer_details"]["email"]
            .as_str()
            .or_else(|| object["customer_email"].as_str())
            .map(str::to_string),
    };

    let interval = parse_interval(
        metadata["interval_unit"].as_str(),
        metadata["interval_count"].as_u64(),
    );
    let period_end = object["current_period_end"]
        .as_i64()
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
    let occurred_at = payload["created"]
        .as_i64()
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    Ok(ParsedWebhook::Event(PaymentEvent {
        provider: PaymentProvider::Stripe,
        event_id,
        payment_reference,
        signal,
        buyer,
        partner_id: uuid_field(&metadata["partner_id"]),
        partner_link_id: uuid_field(&metadata["partner_link_id"]),
        interval,
        period_end,
        amount_cents: object["amount_total"].as_i64,
        plan_code: metadata["plan_code"].as_str().map(str::to_string),
        occurred_at,
    }))
}

fn parse_mercado_pago_event(payload: &serde_json::Value) -> EngineResult<ParsedWebhook> {
    let event_id = match &payload["id"] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => {
            return Err(EngineError::MalformedEvent(
                "mercadopago event missing id".to_string(),
            ))
        }
    };

    let data = &payload["data"];
    let status = data["status"].as_str().unwrap_or_default();
    let signal = match status {
        "approved" | "authorized" => PaymentSignal::Confirmed,
        "cancelled" => PaymentSignal::Canceled,
        other => {
            return Ok(ParsedWebhook::Ignored {
                event_type: format!("status:{}", other),
            })
        }
    };

    let payment_reference = data["external_reference"]
        .as_str()
        .map(str::to_string)
        .or_else(|| data["id"].as_i64().map(|n| n.to_string()))
        .ok_or_else(|| {
            EngineError::MalformedEvent("mercadopago event missing payment reference".to_string())
        })?;

    let metadata = &data["metadata"];
    let buyer = IdentityHint {
        document_id: metadata["member_id"].as_str().map(str::to_string),
        external_auth_id: None,
        email: data["payer"]["email"].as_str().map(str::to_string),
    };

    let recurring = &data["auto_recurring"];
    let interval = parse_interval(
        recurring["frequency_type"].as_str(),
        recurring["frequency"].as_u64(),
    );
    let period_end = recurring["end_date"]
        .as_str()
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());
    let occurred_at = payload["date_created"]
        .as_str()
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    let amount_cents = data["transaction_amount"]
        .as_f64()
        .map(|amount| (amount * 100.0).round() as i64);

    Ok(ParsedWebhook::Event(PaymentEvent {
        provider: PaymentProvider::MercadoPago,
        event_id,
        payment_reference,
        signal,
        buyer,
        partner_id: uuid_field(&metadata["partner_id"]),
        partner_link_id: uuid_field(&metadata["partner_link_id"]),
        interval,
        period_end,
        amount_cents,
        plan_code: metadata["plan_code"].as_str().map(str::to_string),
        occurred_at,
    }))
}

fn parse_interval(unit: Option<&str>, count: Option<u64>) -> Option<BillingInterval> {
    let unit = unit?.parse().ok()?;
    Some(BillingInterval::new(unit, count.unwrap_or(1) as u32))
}

fn uuid_field(value: &serde_json::Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

/// Webhook intake service.
#[derive(Clone)]
pub struct WebhookIntake {
    pool: PgPool,
    config: EngineConfig,
    reconciler: ReconciliationService,
}

impl WebhookIntake {
    pub fn new(pool: PgPool, config: EngineConfig) -> Self {
        let reconciler = ReconciliationService::new(pool.clone(), config.clone());
        Self {
            pool,
            config,
            reconciler,
        }
    }

    /// Verify, parse, claim and reconcile a raw delivery.
    pub async fn handle(
        &self,
        provider: PaymentProvider,
        payload: &str,
        signature_header: &str,
    ) -> EngineResult<WebhookOutcome> {
        let secret = self.config.webhook_secret(provider)?;
        verify_signature(secret, payload, signature_header)?;

        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| EngineError::MalformedEvent(e.to_string()))?;

        let event = match parse_event(provider, &value)? {
            ParsedWebhook::Event(event) => event,
            ParsedWebhook::Ignored { event_type } => {
                tracing::info!(
                    provider = %provider,
                    event_type = %event_type,
                    "Received unhandled provider event type"
                );
                return Ok(WebhookOutcome::Ignored { event_type });
            }
        };

        if !self.claim_event(&event).await? {
            tracing::info!(
                provider = %provider,
                event_id = %event.event_id,
                "Duplicate provider event, skipping"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let result = self.reconciler.reconcile(&event).await;
        self.record_result(&event.event_id, &result).await;

        result.map(WebhookOutcome::Processed)
    }

    pub fn reconciler(&self) -> &ReconciliationService {
        &self.reconciler
    }

    /// Atomically claim exclusive processing rights for a provider event.
    ///
    /// Returns false when another delivery already claimed it. An event
    /// stuck in `processing` past the timeout may be re-claimed, so a
    /// crashed worker cannot wedge a delivery forever.
    async fn claim_event(&self, event: &PaymentEvent) -> EngineResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO provider_webhook_events
                (provider_event_id, provider, signal, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = 'recovered from stuck processing'
            WHERE provider_webhook_events.processing_result = 'processing'
              AND provider_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event.event_id)
        .bind(event.provider.as_str())
        .bind(event.signal.as_str())
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    /// Record the processing result on the ledger row. The row matters for
    /// idempotency audits, so a failure is retried once before giving up
    /// loudly.
    async fn record_result(&self, event_id: &str, result: &EngineResult<ReconcileOutcome>) {
        let (processing_result, error_message) = match result {
            Ok(_) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        for attempt in 0..2 {
            let update = sqlx::query(
                r#"
                UPDATE provider_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE provider_event_id = $3
                "#,
            )
            .bind(processing_result)
            .bind(&error_message)
            .bind(event_id)
            .execute(&self.pool)
            .await;

            match update {
                Ok(_) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!(event_id = %event_id, error = %e,
                        "Failed to update webhook ledger, retrying");
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        processing_result = %processing_result,
                        error = %e,
                        "CRITICAL: failed to update webhook ledger after retry; \
                         event may appear stuck in processing"
                    );
                }
            }
        }
    }
}
