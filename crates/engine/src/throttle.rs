//! Voucher generation throttling
//!
//! A member must wait out a per-establishment cooldown window between
//! successive voucher generations at the same establishment. The throttle
//! state is a projection over the vouchers table (latest `created_at` per
//! establishment+member pair), not a separate entity: creating the voucher
//! is what advances the window.
//!
//! Denial is not an error; it is a normal negative result the caller
//! surfaces as "please wait until <time>". The check-then-create sequence
//! is deliberately best-effort: a rare racing double-generation is a
//! cosmetic inconsistency, not a financial one, and does not warrant a
//! transaction.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// End of the cooldown window opened by a generation at `last_generated_at`.
pub fn window_end(last_generated_at: OffsetDateTime, cooldown_hours: i64) -> OffsetDateTime {
    last_generated_at + Duration::hours(cooldown_hours)
}

/// Whether a pair is still inside its cooldown window at `now`.
pub fn in_cooldown(
    last_generated_at: OffsetDateTime,
    cooldown_hours: i64,
    now: OffsetDateTime,
) -> bool {
    now < window_end(last_generated_at, cooldown_hours)
}

/// Gate deciding whether a new voucher may be generated for a
/// (establishment, member) pair.
#[derive(Clone)]
pub struct ThrottleGate {
    pool: PgPool,
}

impl ThrottleGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Instant at which the pair may generate again, or `None` if allowed
    /// right now.
    pub async fn next_available_at(
        &self,
        establishment_id: Uuid,
        member_ref: &str,
    ) -> EngineResult<Option<OffsetDateTime>> {
        let cooldown_hours: Option<(i32,)> =
            sqlx::query_as("SELECT cooldown_hours FROM establishments WHERE id = $1")
                .bind(establishment_id)
                .fetch_optional(&self.pool)
                .await?;

        let (cooldown_hours,) = cooldown_hours
            .ok_or_else(|| EngineError::NotFound(format!("establishment {}", establishment_id)))?;

        let last: Option<OffsetDateTime> = sqlx::query_scalar(
            r#"
            SELECT MAX(created_at) FROM vouchers
            WHERE establishment_id = $1 AND member_ref = $2
            "#,
        )
        .bind(establishment_id)
        .bind(member_ref)
        .fetch_one(&self.pool)
        .await?;

        let now = OffsetDateTime::now_utc();
        Ok(last
            .filter(|l| in_cooldown(*l, cooldown_hours as i64, now))
            .map(|l| window_end(l, cooldown_hours as i64)))
    }

    /// Whether a new voucher may be generated for the pair right now.
    /// A member with no prior generation at the establishment is always
    /// allowed.
    pub async fn can_generate(
        &self,
        establishment_id: Uuid,
        member_ref: &str,
    ) -> EngineResult<bool> {
        Ok(self
            .next_available_at(establishment_id, member_ref)
            .await?
            .is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_window_end() {
        let generated = datetime!(2024-05-01 10:00 UTC);
        assert_eq!(window_end(generated, 24), datetime!(2024-05-02 10:00 UTC));
        assert_eq!(window_end(generated, 6), datetime!(2024-05-01 16:00 UTC));
    }

    #[test]
    fn test_in_cooldown_within_window() {
        // Generated at T0, cooldown 24h, second attempt at T0+1h is denied
        let generated = datetime!(2024-05-01 10:00 UTC);
        assert!(in_cooldown(generated, 24, datetime!(2024-05-01 11:00 UTC)));
    }

    #[test]
    fn test_cooldown_releases_at_window_end() {
        let generated = datetime!(2024-05-01 10:00 UTC);
        let end = window_end(generated, 24);
        assert!(in_cooldown(generated, 24, end - Duration::seconds(1)));
        assert!(!in_cooldown(generated, 24, end));
        assert!(!in_cooldown(generated, 24, end + Duration::hours(1)));
    }

    #[test]
    fn test_zero_cooldown_never_throttles() {
        let generated = datetime!(2024-05-01 10:00 UTC);
        assert!(!in_cooldown(generated, 0, generated));
    }
}
