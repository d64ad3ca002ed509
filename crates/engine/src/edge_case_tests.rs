// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Engine Core
//!
//! Exercises boundary conditions across:
//! - Voucher lifecycle (ENG-V01 to ENG-V05)
//! - Generation throttling (ENG-T01 to ENG-T03)
//! - Reconciliation (ENG-R01 to ENG-R04)
//! - Webhook intake (ENG-W01 to ENG-W02)

#[cfg(test)]
mod voucher_lifecycle_tests {
    use clubpass_shared::VoucherStatus;
    use time::macros::datetime;

    use crate::expiry::should_expire;

    // =========================================================================
    // ENG-V01: Full happy path is the only path to 'used'
    // =========================================================================
    #[test]
    fn test_only_path_to_used_runs_through_verified() {
        use VoucherStatus::*;

        // pending → verified → used is legal end to end
        assert!(Pending.can_transition(Verified));
        assert!(Verified.can_transition(Used));

        // there is no shortcut and no way back
        assert!(!Pending.can_transition(Used));
        assert!(!Used.can_transition(Verified));
        assert!(!Used.can_transition(Pending));
    }

    // =========================================================================
    // ENG-V02: Second check-in attempt finds a terminal state
    // =========================================================================
    #[test]
    fn test_used_voucher_rejects_every_transition() {
        use VoucherStatus::*;

        for target in [Pending, Verified, Used, Expired] {
            assert!(!Used.can_transition(target));
        }
    }

    // =========================================================================
    // ENG-V03: Validation exactly at the deadline expires the voucher
    // =========================================================================
    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let deadline = datetime!(2024-06-01 00:00 UTC);
        assert!(should_expire(VoucherStatus::Pending, deadline, deadline));
    }

    // =========================================================================
    // ENG-V04: Never-validated voucher expires from pending
    // =========================================================================
    #[test]
    fn test_pending_voucher_expires_after_window() {
        // expiresAt = T0+48h, validate attempt at T0+49h
        let t0 = datetime!(2024-06-01 10:00 UTC);
        let deadline = t0 + time::Duration::hours(48);
        let attempt = t0 + time::Duration::hours(49);

        assert!(should_expire(VoucherStatus::Pending, deadline, attempt));
        assert!(VoucherStatus::Pending.can_transition(VoucherStatus::Expired));
    }

    // =========================================================================
    // ENG-V05: Expiration after validation, before check-in
    // =========================================================================
    #[test]
    fn test_verified_voucher_can_still_expire() {
        let deadline = datetime!(2024-06-01 00:00 UTC);
        let late = datetime!(2024-06-01 08:00 UTC);

        assert!(should_expire(VoucherStatus::Verified, deadline, late));
        assert!(VoucherStatus::Verified.can_transition(VoucherStatus::Expired));
    }
}

#[cfg(test)]
mod throttle_tests {
    use time::macros::datetime;
    use time::Duration;

    use crate::throttle::{in_cooldown, window_end};

    // =========================================================================
    // ENG-T01: 24h cooldown denies a retry one hour later
    // =========================================================================
    #[test]
    fn test_retry_within_cooldown_is_denied_until_window_end() {
        let t0 = datetime!(2024-06-01 10:00 UTC);
        let retry = t0 + Duration::hours(1);

        assert!(in_cooldown(t0, 24, retry));
        assert_eq!(window_end(t0, 24), t0 + Duration::hours(24));
    }

    // =========================================================================
    // ENG-T02: Window end is the first allowed instant
    // =========================================================================
    #[test]
    fn test_generation_allowed_exactly_at_window_end() {
        let t0 = datetime!(2024-06-01 10:00 UTC);
        assert!(!in_cooldown(t0, 24, t0 + Duration::hours(24)));
    }

    // =========================================================================
    // ENG-T03: Per-establishment windows are independent durations
    // =========================================================================
    #[test]
    fn test_shorter_cooldown_releases_earlier() {
        let t0 = datetime!(2024-06-01 10:00 UTC);
        let check = t0 + Duration::hours(7);

        assert!(!in_cooldown(t0, 6, check));
        assert!(in_cooldown(t0, 24, check));
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use clubpass_shared::{BillingInterval, IntervalUnit, PaymentProvider};
    use time::macros::datetime;
    use uuid::Uuid;

    use crate::error::EngineError;
    use crate::identity::IdentityHint;
    use crate::reconcile::{
        partition_active_set, subscription_expiry, PaymentEvent, PaymentSignal,
    };

    fn event_with_interval(interval: Option<BillingInterval>) -> PaymentEvent {
        PaymentEvent {
            provider: PaymentProvider::Stripe,
            event_id: "evt_edge".to_string(),
            payment_reference: "pay_999".to_string(),
            signal: PaymentSignal::Confirmed,
            buyer: IdentityHint::from_document_id("member-9"),
            partner_id: Some(Uuid::new_v4()),
            partner_link_id: None,
            interval,
            period_end: None,
            amount_cents: None,
            plan_code: None,
            occurred_at: datetime!(2024-01-31 12:00 UTC),
        }
    }

    // =========================================================================
    // ENG-R01: month/1 event expires one calendar month after the event
    // =========================================================================
    #[test]
    fn test_monthly_event_expiry_is_calendar_correct() {
        let event = event_with_interval(Some(BillingInterval::new(IntervalUnit::Month, 1)));
        // Jan 31 + 1 month clamps to the end of February
        assert_eq!(
            subscription_expiry(&event).unwrap(),
            datetime!(2024-02-29 12:00 UTC)
        );
    }

    // =========================================================================
    // ENG-R02: event with no interval and no period end is never guessed at
    // =========================================================================
    #[test]
    fn test_interval_less_event_is_malformed_not_defaulted() {
        let event = event_with_interval(None);
        assert!(matches!(
            subscription_expiry(&event),
            Err(EngineError::MalformedEvent(_))
        ));
    }

    // =========================================================================
    // ENG-R03: batch link replaces the active set, exactly
    // =========================================================================
    #[test]
    fn test_batch_link_full_replace_semantics() {
        let (p1, p2, p3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let sub_p3 = Uuid::new_v4();

        let (deactivate, create) = partition_active_set(&[(sub_p3, p3)], &[p1, p2]);

        // P3 demoted, not deleted; active set becomes exactly {P1, P2}
        assert_eq!(deactivate, vec![sub_p3]);
        assert_eq!(create, vec![p1, p2]);
    }

    // =========================================================================
    // ENG-R04: batch link is idempotent over an unchanged set
    // =========================================================================
    #[test]
    fn test_batch_link_noop_when_set_unchanged() {
        let p1 = Uuid::new_v4();
        let sub_p1 = Uuid::new_v4();

        let (deactivate, create) = partition_active_set(&[(sub_p1, p1)], &[p1]);

        assert!(deactivate.is_empty());
        assert!(create.is_empty());
    }
}

#[cfg(test)]
mod webhook_tests {
    use clubpass_shared::PaymentProvider;

    use crate::error::EngineError;
    use crate::webhooks::{parse_event, ParsedWebhook};

    // =========================================================================
    // ENG-W01: empty payloads never reach the reconciler
    // =========================================================================
    #[test]
    fn test_empty_payload_is_malformed() {
        let payload = serde_json::json!({});
        assert!(matches!(
            parse_event(PaymentProvider::Stripe, &payload),
            Err(EngineError::MalformedEvent(_))
        ));
    }

    // =========================================================================
    // ENG-W02: unhandled event types are acknowledged, not errors
    // =========================================================================
    #[test]
    fn test_unknown_event_types_are_ignored_not_rejected() {
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "payment_method.attached",
            "data": { "object": {} }
        });

        let parsed = parse_event(PaymentProvider::Stripe, &payload).unwrap();
        assert!(matches!(parsed, ParsedWebhook::Ignored { .. }));
    }
}
