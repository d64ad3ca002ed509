//! Environment-driven engine configuration
//!
//! Webhook secrets and catalog endpoints are configured per provider.
//! Binaries call `dotenvy::dotenv().ok()` before `from_env()`.

use clubpass_shared::PaymentProvider;

use crate::error::{EngineError, EngineResult};

/// Per-provider endpoint configuration.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    /// Shared secret used to verify webhook signatures.
    pub webhook_secret: String,
    /// Base URL of the provider's plan catalog API, if available.
    pub catalog_url: Option<String>,
}

/// Engine configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stripe: ProviderEndpoint,
    pub mercado_pago: ProviderEndpoint,
    /// Hours an `initiated` subscription may linger before maintenance
    /// purges it.
    pub initiated_ttl_hours: i64,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Required: `STRIPE_WEBHOOK_SECRET`, `MERCADOPAGO_WEBHOOK_SECRET`.
    /// Optional: `STRIPE_CATALOG_URL`, `MERCADOPAGO_CATALOG_URL`,
    /// `INITIATED_SUBSCRIPTION_TTL_HOURS` (default 48).
    pub fn from_env() -> EngineResult<Self> {
        let stripe_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| EngineError::Config("STRIPE_WEBHOOK_SECRET must be set".to_string()))?;
        let mp_secret = std::env::var("MERCADOPAGO_WEBHOOK_SECRET").map_err(|_| {
            EngineError::Config("MERCADOPAGO_WEBHOOK_SECRET must be set".to_string())
        })?;

        let initiated_ttl_hours = std::env::var("INITIATED_SUBSCRIPTION_TTL_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(48);

        Ok(Self {
            stripe: ProviderEndpoint {
                webhook_secret: stripe_secret,
                catalog_url: std::env::var("STRIPE_CATALOG_URL").ok(),
            },
            mercado_pago: ProviderEndpoint {
                webhook_secret: mp_secret,
                catalog_url: std::env::var("MERCADOPAGO_CATALOG_URL").ok(),
            },
            initiated_ttl_hours,
        })
    }

    /// Webhook secret for a provider. `Manual` never signs webhooks.
    pub fn webhook_secret(&self, provider: PaymentProvider) -> EngineResult<&str> {
        match provider {
            PaymentProvider::Stripe => Ok(&self.stripe.webhook_secret),
            PaymentProvider::MercadoPago => Ok(&self.mercado_pago.webhook_secret),
            PaymentProvider::Manual => Err(EngineError::Config(
                "manual subscriptions do not deliver webhooks".to_string(),
            )),
        }
    }

    /// Catalog endpoint for a provider, if configured.
    pub fn catalog_url(&self, provider: PaymentProvider) -> Option<&str> {
        match provider {
            PaymentProvider::Stripe => self.stripe.catalog_url.as_deref(),
            PaymentProvider::MercadoPago => self.mercado_pago.catalog_url.as_deref(),
            PaymentProvider::Manual => None,
        }
    }
}
