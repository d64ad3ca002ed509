//! Identity resolution across inconsistent identifier schemes
//!
//! Three independent identifier spaces (store-assigned document id,
//! external auth id, email) were populated by different code paths over
//! time and are not always consistent. The resolver walks an ordered
//! strategy list and stops at the first hit, preferring an exact id match
//! over an email match. It never owns member data; the only write it makes
//! is the corrective `external_auth_id` repair, which is logged and never
//! affects the outcome of the resolution itself.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Fragmentary identity, as supplied by callers.
///
/// `document_id` is a string, not a uuid: upstream writers have
/// historically stored external auth ids in id slots, and the resolver has
/// to cope with whatever arrives.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IdentityHint {
    pub document_id: Option<String>,
    pub external_auth_id: Option<String>,
    pub email: Option<String>,
}

impl IdentityHint {
    pub fn from_document_id(id: impl Into<String>) -> Self {
        Self {
            document_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.external_auth_id.is_none() && self.email.is_none()
    }

    /// Ordered lookup plan for this hint. Pure; the resolver executes it
    /// top to bottom and stops at the first hit.
    ///
    /// When no explicit external auth id was supplied, the document id is
    /// reused verbatim for the auth-id query: callers historically pass
    /// auth ids in the id slot.
    pub fn lookup_plan(&self) -> Vec<LookupStrategy> {
        let mut plan = Vec::new();

        if let Some(doc_id) = &self.document_id {
            if let Ok(id) = Uuid::parse_str(doc_id) {
                plan.push(LookupStrategy::ById(id));
            }
        }

        match (&self.external_auth_id, &self.document_id) {
            (Some(auth_id), _) => plan.push(LookupStrategy::ByExternalAuthId(auth_id.clone())),
            (None, Some(doc_id)) => plan.push(LookupStrategy::ByExternalAuthId(doc_id.clone())),
            (None, None) => {}
        }

        if let Some(email) = &self.email {
            plan.push(LookupStrategy::ByEmail(email.clone()));
        }

        plan
    }
}

/// A single resolution strategy: one field, one equality lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupStrategy {
    ById(Uuid),
    ByExternalAuthId(String),
    ByEmail(String),
}

impl LookupStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LookupStrategy::ById(_) => "document_id",
            LookupStrategy::ByExternalAuthId(_) => "external_auth_id",
            LookupStrategy::ByEmail(_) => "email",
        }
    }
}

/// The canonical member record a hint resolved to, with the denormalized
/// display fields callers enrich responses with.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct CanonicalIdentity {
    pub member_id: Uuid,
    pub external_auth_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub photo_url: Option<String>,
}

/// Fallback-chain lookup over the members table.
#[derive(Clone)]
pub struct IdentityResolver {
    pool: PgPool,
}

impl IdentityResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve a member from a fragmentary hint.
    ///
    /// Walks the hint's lookup plan in order. If the hit came from a
    /// fallback strategy while a document-id hint was supplied, the
    /// supplied id is persisted as the record's canonical
    /// `external_auth_id` (self-healing for historical identifier drift).
    pub async fn resolve_member(&self, hint: &IdentityHint) -> EngineResult<CanonicalIdentity> {
        let plan = hint.lookup_plan();
        if plan.is_empty() {
            return Err(EngineError::IdentityUnresolvable(
                "empty identity hint".to_string(),
            ));
        }

        for strategy in &plan {
            if let Some(identity) = self.lookup(strategy).await? {
                tracing::debug!(
                    member_id = %identity.member_id,
                    strategy = strategy.name(),
                    "Resolved member identity"
                );
                self.repair_if_drifted(hint, strategy, &identity).await;
                return Ok(identity);
            }
        }

        Err(EngineError::IdentityUnresolvable(format!(
            "no member matched after {} lookup strategies",
            plan.len()
        )))
    }

    async fn lookup(&self, strategy: &LookupStrategy) -> EngineResult<Option<CanonicalIdentity>> {
        let row = match strategy {
            LookupStrategy::ById(id) => {
                sqlx::query_as::<_, CanonicalIdentity>(
                    r#"
                    SELECT id as member_id, external_auth_id, email, name, phone, photo_url
                    FROM members WHERE id = $1
                    "#,
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            LookupStrategy::ByExternalAuthId(auth_id) => {
                sqlx::query_as::<_, CanonicalIdentity>(
                    r#"
                    SELECT id as member_id, external_auth_id, email, name, phone, photo_url
                    FROM members WHERE external_auth_id = $1
                    "#,
                )
                .bind(auth_id)
                .fetch_optional(&self.pool)
                .await?
            }
            LookupStrategy::ByEmail(email) => {
                sqlx::query_as::<_, CanonicalIdentity>(
                    r#"
                    SELECT id as member_id, external_auth_id, email, name, phone, photo_url
                    FROM members WHERE email = $1
                    "#,
                )
                .bind(email)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row)
    }

    /// Corrective write for identifier drift: a record reached through the
    /// email fallback while the caller supplied a document id gets that id
    /// stamped as its `external_auth_id`.
    ///
    /// This is a side effect of resolution, not part of the business
    /// transaction: failures are logged and swallowed.
    async fn repair_if_drifted(
        &self,
        hint: &IdentityHint,
        matched_by: &LookupStrategy,
        identity: &CanonicalIdentity,
    ) {
        let Some(doc_id) = &hint.document_id else {
            return;
        };
        if !matches!(matched_by, LookupStrategy::ByEmail(_)) {
            return;
        }
        if identity.external_auth_id.as_deref() == Some(doc_id.as_str()) {
            return;
        }

        let result = sqlx::query(
            "UPDATE members SET external_auth_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(doc_id)
        .bind(identity.member_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::warn!(
                    member_id = %identity.member_id,
                    external_auth_id = %doc_id,
                    previous = ?identity.external_auth_id,
                    "Repaired drifted external_auth_id on member record"
                );
            }
            Err(e) => {
                tracing::warn!(
                    member_id = %identity.member_id,
                    error = %e,
                    "Failed to persist external_auth_id repair"
                );
            }
        }
    }

    /// Resolve the partner a payment event belongs to: directly by id, or
    /// by following an attribution link to its owning partner.
    pub async fn resolve_partner(
        &self,
        partner_id: Option<Uuid>,
        partner_link_id: Option<Uuid>,
    ) -> EngineResult<Uuid> {
        if let Some(id) = partner_id {
            let exists: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM partners WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            return exists
                .map(|(id,)| id)
                .ok_or_else(|| EngineError::NotFound(format!("partner {}", id)));
        }

        if let Some(link_id) = partner_link_id {
            let owner: Option<(Uuid,)> =
                sqlx::query_as("SELECT partner_id FROM partner_links WHERE id = $1")
                    .bind(link_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return owner
                .map(|(id,)| id)
                .ok_or_else(|| EngineError::NotFound(format!("partner link {}", link_id)));
        }

        Err(EngineError::IdentityUnresolvable(
            "event carried neither partner id nor attribution link".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_plan_prefers_id_over_email() {
        let id = Uuid::new_v4();
        let hint = IdentityHint {
            document_id: Some(id.to_string()),
            external_auth_id: None,
            email: Some("m@example.com".to_string()),
        };

        let plan = hint.lookup_plan();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], LookupStrategy::ById(id));
        assert_eq!(plan[1], LookupStrategy::ByExternalAuthId(id.to_string()));
        assert_eq!(
            plan[2],
            LookupStrategy::ByEmail("m@example.com".to_string())
        );
    }

    #[test]
    fn test_lookup_plan_non_uuid_document_id_skips_point_get() {
        // An auth id passed in the id slot cannot be point-looked-up, but
        // still feeds the auth-id query.
        let hint = IdentityHint::from_document_id("firebase-uid-123");
        let plan = hint.lookup_plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan[0],
            LookupStrategy::ByExternalAuthId("firebase-uid-123".to_string())
        );
    }

    #[test]
    fn test_lookup_plan_explicit_auth_id_wins_over_document_id() {
        let hint = IdentityHint {
            document_id: Some("doc-1".to_string()),
            external_auth_id: Some("auth-9".to_string()),
            email: None,
        };
        let plan = hint.lookup_plan();
        assert_eq!(
            plan,
            vec![LookupStrategy::ByExternalAuthId("auth-9".to_string())]
        );
    }

    #[test]
    fn test_lookup_plan_email_only() {
        let hint = IdentityHint {
            email: Some("solo@example.com".to_string()),
            ..Default::default()
        };
        let plan = hint.lookup_plan();
        assert_eq!(
            plan,
            vec![LookupStrategy::ByEmail("solo@example.com".to_string())]
        );
    }

    #[test]
    fn test_empty_hint_has_empty_plan() {
        let hint = IdentityHint::default();
        assert!(hint.is_empty());
        assert!(hint.lookup_plan().is_empty());
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(LookupStrategy::ById(Uuid::new_v4()).name(), "document_id");
        assert_eq!(
            LookupStrategy::ByExternalAuthId("x".into()).name(),
            "external_auth_id"
        );
        assert_eq!(LookupStrategy::ByEmail("x".into()).name(), "email");
    }
}
