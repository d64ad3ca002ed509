//! Read-time expiration check
//!
//! There is no background sweeper. Expiration is evaluated whenever a
//! voucher or subscription is read on a path where its deadline matters,
//! and persisted lazily by the caller. A stored status may therefore lag
//! `expired` until next accessed; that is acceptable because expiration is
//! never a precondition for the correctness of other records.

use clubpass_shared::VoucherStatus;
use time::OffsetDateTime;

/// A deadline has passed once `now` reaches it.
pub fn is_expired(expires_at: OffsetDateTime, now: OffsetDateTime) -> bool {
    now >= expires_at
}

/// Whether a voucher in `status` with deadline `expires_at` should be
/// lazily transitioned to `expired` at read time.
///
/// `used` vouchers are terminal and immune; `expired` is already there.
pub fn should_expire(status: VoucherStatus, expires_at: OffsetDateTime, now: OffsetDateTime) -> bool {
    status.expirable() && is_expired(expires_at, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_deadline_is_inclusive() {
        let deadline = datetime!(2024-05-01 12:00 UTC);
        assert!(!is_expired(deadline, datetime!(2024-05-01 11:59:59 UTC)));
        assert!(is_expired(deadline, deadline));
        assert!(is_expired(deadline, datetime!(2024-05-01 12:00:01 UTC)));
    }

    #[test]
    fn test_should_expire_only_pending_and_verified() {
        let deadline = datetime!(2024-05-01 00:00 UTC);
        let after = datetime!(2024-05-02 00:00 UTC);

        assert!(should_expire(VoucherStatus::Pending, deadline, after));
        assert!(should_expire(VoucherStatus::Verified, deadline, after));
        assert!(!should_expire(VoucherStatus::Used, deadline, after));
        assert!(!should_expire(VoucherStatus::Expired, deadline, after));
    }

    #[test]
    fn test_should_expire_respects_deadline() {
        let deadline = datetime!(2024-05-01 00:00 UTC);
        let before = datetime!(2024-04-30 23:00 UTC);
        assert!(!should_expire(VoucherStatus::Pending, deadline, before));
    }
}
