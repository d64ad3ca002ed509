//! Engine error types

use time::OffsetDateTime;

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the voucher and reconciliation engine.
///
/// State-machine violations (`InvalidState`) and lookups against missing
/// records (`NotFound`) are surfaced verbatim to callers and never retried:
/// retrying does not change whether the precondition holds. `Throttled` is
/// not a failure, it is a scheduling signal carrying the next allowed
/// instant.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("voucher generation throttled until {next_available_at}")]
    Throttled { next_available_at: OffsetDateTime },

    #[error("identity unresolvable: {0}")]
    IdentityUnresolvable(String),

    /// Reconciliation could not resolve the buyer. The event is parked for
    /// manual follow-up before this is returned; money changed hands, so
    /// the failure must stay visible.
    #[error("payment event buyer could not be resolved")]
    BuyerUnresolvable,

    #[error("payment event partner could not be resolved")]
    PartnerUnresolvable,

    #[error("malformed payment event: {0}")]
    MalformedEvent(String),

    /// Internal marker for redelivered events; callers see the
    /// `AlreadyReconciled` outcome instead.
    #[error("duplicate payment event")]
    DuplicateEvent,

    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider API error: {0}")]
    ProviderApi(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl EngineError {
    /// Convenience constructor for state-machine rejections.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        EngineError::InvalidState {
            reason: reason.into(),
        }
    }
}
