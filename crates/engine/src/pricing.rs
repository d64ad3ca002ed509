//! Tiered plan resolution
//!
//! Payment events do not always carry a usable plan name or price, and the
//! local partner catalog is not always complete. Resolution follows a fixed
//! precedence chain instead of ad hoc branching: local catalog, then the
//! provider's catalog API, then a hard default. Every tier is best-effort;
//! the chain itself never fails.

use clubpass_shared::PaymentProvider;
use sqlx::PgPool;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

const DEFAULT_PLAN_NAME: &str = "membership";

/// Where a resolved plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PlanSource {
    LocalCatalog,
    ProviderCatalog,
    Default,
}

/// A plan name/price pair resolved for subscription enrichment.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedPlan {
    pub name: String,
    pub amount_cents: Option<i64>,
    pub source: PlanSource,
}

impl ResolvedPlan {
    fn fallback() -> Self {
        Self {
            name: DEFAULT_PLAN_NAME.to_string(),
            amount_cents: None,
            source: PlanSource::Default,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LocalPlanRow {
    name: String,
    amount_cents: i64,
}

#[derive(Debug, serde::Deserialize)]
struct ProviderPlanBody {
    name: String,
    amount_cents: Option<i64>,
}

/// Fetch a plan from a provider catalog endpoint.
///
/// Transport failures and 5xx responses are retried with bounded
/// exponential backoff; a 404 is a definitive miss, not an error.
pub async fn fetch_provider_plan(
    http: &reqwest::Client,
    catalog_base_url: &str,
    plan_code: &str,
) -> EngineResult<Option<ResolvedPlan>> {
    let url = format!(
        "{}/plans/{}",
        catalog_base_url.trim_end_matches('/'),
        plan_code
    );

    let strategy = ExponentialBackoff::from_millis(100)
        .max_delay(std::time::Duration::from_secs(2))
        .take(2);

    Retry::spawn(strategy, || async {
        let response = http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ProviderApi(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::ProviderApi(format!(
                "catalog returned {}",
                response.status()
            )));
        }

        let body: ProviderPlanBody = response
            .json()
            .await
            .map_err(|e| EngineError::ProviderApi(e.to_string()))?;

        Ok(Some(ResolvedPlan {
            name: body.name,
            amount_cents: body.amount_cents,
            source: PlanSource::ProviderCatalog,
        }))
    })
    .await
}

/// Resolver walking the catalog precedence chain.
#[derive(Clone)]
pub struct PlanResolver {
    pool: PgPool,
    http: reqwest::Client,
    config: EngineConfig,
}

impl PlanResolver {
    pub fn new(pool: PgPool, config: EngineConfig) -> Self {
        Self {
            pool,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Resolve a plan for enrichment. Never fails: a chain that exhausts
    /// itself lands on the hard default.
    pub async fn resolve(
        &self,
        partner_id: Uuid,
        provider: PaymentProvider,
        plan_code: Option<&str>,
    ) -> ResolvedPlan {
        let Some(code) = plan_code else {
            return ResolvedPlan::fallback();
        };

        match self.local_catalog(partner_id, code).await {
            Ok(Some(plan)) => return plan,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(partner_id = %partner_id, plan_code = %code, error = %e,
                    "Local plan catalog lookup failed");
            }
        }

        if let Some(base_url) = self.config.catalog_url(provider) {
            match fetch_provider_plan(&self.http, base_url, code).await {
                Ok(Some(plan)) => return plan,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(provider = %provider, plan_code = %code, error = %e,
                        "Provider plan catalog lookup failed");
                }
            }
        }

        ResolvedPlan::fallback()
    }

    async fn local_catalog(
        &self,
        partner_id: Uuid,
        plan_code: &str,
    ) -> EngineResult<Option<ResolvedPlan>> {
        let row: Option<LocalPlanRow> = sqlx::query_as(
            "SELECT name, amount_cents FROM partner_plans WHERE partner_id = $1 AND code = $2",
        )
        .bind(partner_id)
        .bind(plan_code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ResolvedPlan {
            name: r.name,
            amount_cents: Some(r.amount_cents),
            source: PlanSource::LocalCatalog,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provider_catalog_hit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/plans/gold-annual")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name": "Gold Annual", "amount_cents": 19900}"#)
            .create_async()
            .await;

        let http = reqwest::Client::new();
        let plan = fetch_provider_plan(&http, &server.url(), "gold-annual")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(plan.name, "Gold Annual");
        assert_eq!(plan.amount_cents, Some(19900));
        assert_eq!(plan.source, PlanSource::ProviderCatalog);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_provider_catalog_miss_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/plans/unknown")
            .with_status(404)
            .create_async()
            .await;

        let http = reqwest::Client::new();
        let plan = fetch_provider_plan(&http, &server.url(), "unknown")
            .await
            .unwrap();
        assert!(plan.is_none());
    }

    #[tokio::test]
    async fn test_provider_catalog_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        // Initial attempt plus two backoff retries, then the error surfaces
        let mock = server
            .mock("GET", "/plans/flaky")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let http = reqwest::Client::new();
        let result = fetch_provider_plan(&http, &server.url(), "flaky").await;

        assert!(matches!(result, Err(EngineError::ProviderApi(_))));
        mock.assert_async().await;
    }

    #[test]
    fn test_fallback_plan() {
        let plan = ResolvedPlan::fallback();
        assert_eq!(plan.name, DEFAULT_PLAN_NAME);
        assert_eq!(plan.amount_cents, None);
        assert_eq!(plan.source, PlanSource::Default);
    }
}
