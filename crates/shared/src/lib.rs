// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clubpass Shared Types
//!
//! Domain enums and value types used across the workspace: voucher and
//! subscription statuses, payment provider tags, and billing interval
//! arithmetic. These types own the pure state-machine rules; persistence
//! and side effects live in `clubpass-engine`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};

/// Lifecycle state of a voucher.
///
/// Status only moves forward: `pending → verified → used`, with `expired`
/// reachable from `pending` or `verified`. A used voucher is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    Pending,
    Verified,
    Used,
    Expired,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherStatus::Pending => "pending",
            VoucherStatus::Verified => "verified",
            VoucherStatus::Used => "used",
            VoucherStatus::Expired => "expired",
        }
    }

    /// Whether the lazy expiration check applies to this status.
    ///
    /// `used` is immune: redemption already happened, the deadline no
    /// longer matters. `expired` is already there.
    pub fn expirable(&self) -> bool {
        matches!(self, VoucherStatus::Pending | VoucherStatus::Verified)
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition(&self, to: VoucherStatus) -> bool {
        matches!(
            (self, to),
            (VoucherStatus::Pending, VoucherStatus::Verified)
                | (VoucherStatus::Verified, VoucherStatus::Used)
                | (VoucherStatus::Pending, VoucherStatus::Expired)
                | (VoucherStatus::Verified, VoucherStatus::Expired)
        )
    }
}

impl fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VoucherStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VoucherStatus::Pending),
            "verified" => Ok(VoucherStatus::Verified),
            "used" => Ok(VoucherStatus::Used),
            "expired" => Ok(VoucherStatus::Expired),
            other => Err(format!("unknown voucher status '{}'", other)),
        }
    }
}

/// Lifecycle state of a subscription (entitlement record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Checkout began but the provider has not confirmed payment.
    /// Soft record; purged after a TTL if never completed.
    Initiated,
    Active,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Initiated => "initiated",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(SubscriptionStatus::Initiated),
            "active" => Ok(SubscriptionStatus::Active),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            other => Err(format!("unknown subscription status '{}'", other)),
        }
    }
}

/// Which external payment system produced a subscription.
///
/// `Manual` covers admin-initiated links that never touched a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    MercadoPago,
    Manual,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::MercadoPago => "mercadopago",
            PaymentProvider::Manual => "manual",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(PaymentProvider::Stripe),
            "mercadopago" | "mercado_pago" => Ok(PaymentProvider::MercadoPago),
            "manual" => Ok(PaymentProvider::Manual),
            other => Err(format!("unknown payment provider '{}'", other)),
        }
    }
}

/// Unit of a billing interval descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Year,
}

impl FromStr for IntervalUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Providers disagree on singular vs plural
        match s {
            "day" | "days" => Ok(IntervalUnit::Day),
            "week" | "weeks" => Ok(IntervalUnit::Week),
            "month" | "months" => Ok(IntervalUnit::Month),
            "year" | "years" => Ok(IntervalUnit::Year),
            other => Err(format!("unknown interval unit '{}'", other)),
        }
    }
}

/// A billing interval descriptor: `count × unit` (e.g. 1 month, 12 weeks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingInterval {
    pub unit: IntervalUnit,
    pub count: u32,
}

impl BillingInterval {
    pub fn new(unit: IntervalUnit, count: u32) -> Self {
        Self { unit, count }
    }

    /// Expiry timestamp for a subscription billed at this interval,
    /// starting from `now`.
    ///
    /// Day and week intervals are exact durations. Month and year intervals
    /// are calendar additions: the day-of-month is preserved, clamped to
    /// the target month's length (Jan 31 + 1 month = Feb 28/29).
    pub fn expires_from(&self, now: OffsetDateTime) -> OffsetDateTime {
        let count = self.count as i64;
        match self.unit {
            IntervalUnit::Day => now + Duration::days(count),
            IntervalUnit::Week => now + Duration::weeks(count),
            IntervalUnit::Month => add_months(now, self.count as i32),
            IntervalUnit::Year => add_months(now, self.count as i32 * 12),
        }
    }
}

/// Calendar-correct month addition with end-of-month clamping.
fn add_months(ts: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = ts.date();
    let zero_based = date.month() as i32 - 1 + months;
    let year = date.year() + zero_based.div_euclid(12);
    let month = Month::try_from((zero_based.rem_euclid(12) + 1) as u8).unwrap_or(date.month());
    let day = date.day().min(time::util::days_in_year_month(year, month));
    let new_date = Date::from_calendar_date(year, month, day).unwrap_or(date);
    ts.replace_date(new_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_voucher_status_roundtrip() {
        for status in [
            VoucherStatus::Pending,
            VoucherStatus::Verified,
            VoucherStatus::Used,
            VoucherStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<VoucherStatus>().unwrap(), status);
        }
        assert!("banana".parse::<VoucherStatus>().is_err());
    }

    #[test]
    fn test_voucher_transitions_forward_only() {
        use VoucherStatus::*;

        assert!(Pending.can_transition(Verified));
        assert!(Verified.can_transition(Used));
        assert!(Pending.can_transition(Expired));
        assert!(Verified.can_transition(Expired));

        // Never backward
        assert!(!Verified.can_transition(Pending));
        assert!(!Used.can_transition(Verified));
        assert!(!Expired.can_transition(Pending));

        // Never skip validation
        assert!(!Pending.can_transition(Used));
    }

    #[test]
    fn test_used_voucher_is_terminal() {
        use VoucherStatus::*;

        for to in [Pending, Verified, Used, Expired] {
            assert!(!Used.can_transition(to), "used must not move to {}", to);
        }
        assert!(!Used.expirable(), "used vouchers are immune to expiration");
    }

    #[test]
    fn test_expirable_states() {
        assert!(VoucherStatus::Pending.expirable());
        assert!(VoucherStatus::Verified.expirable());
        assert!(!VoucherStatus::Expired.expirable());
    }

    #[test]
    fn test_provider_parse_accepts_snake_case() {
        assert_eq!(
            "mercado_pago".parse::<PaymentProvider>().unwrap(),
            PaymentProvider::MercadoPago
        );
        assert_eq!(
            "stripe".parse::<PaymentProvider>().unwrap(),
            PaymentProvider::Stripe
        );
    }

    #[test]
    fn test_interval_unit_accepts_plural() {
        assert_eq!("month".parse::<IntervalUnit>().unwrap(), IntervalUnit::Month);
        assert_eq!("months".parse::<IntervalUnit>().unwrap(), IntervalUnit::Month);
        assert!("fortnight".parse::<IntervalUnit>().is_err());
    }

    #[test]
    fn test_day_and_week_intervals_are_exact() {
        let now = datetime!(2024-03-01 12:00 UTC);
        let day = BillingInterval::new(IntervalUnit::Day, 30);
        assert_eq!(day.expires_from(now), datetime!(2024-03-31 12:00 UTC));

        let week = BillingInterval::new(IntervalUnit::Week, 2);
        assert_eq!(week.expires_from(now), datetime!(2024-03-15 12:00 UTC));
    }

    #[test]
    fn test_one_month_interval() {
        let now = datetime!(2024-03-15 09:30 UTC);
        let interval = BillingInterval::new(IntervalUnit::Month, 1);
        assert_eq!(interval.expires_from(now), datetime!(2024-04-15 09:30 UTC));
    }

    #[test]
    fn test_month_end_clamping() {
        let interval = BillingInterval::new(IntervalUnit::Month, 1);

        // Jan 31 + 1 month clamps to Feb 29 (2024 is a leap year)
        let jan = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(interval.expires_from(jan), datetime!(2024-02-29 00:00 UTC));

        // Non-leap year clamps to Feb 28
        let jan_2025 = datetime!(2025-01-31 00:00 UTC);
        assert_eq!(interval.expires_from(jan_2025), datetime!(2025-02-28 00:00 UTC));
    }

    #[test]
    fn test_month_addition_crosses_year_boundary() {
        let nov = datetime!(2024-11-20 18:00 UTC);
        let interval = BillingInterval::new(IntervalUnit::Month, 3);
        assert_eq!(interval.expires_from(nov), datetime!(2025-02-20 18:00 UTC));
    }

    #[test]
    fn test_year_interval() {
        let now = datetime!(2024-06-01 00:00 UTC);
        let interval = BillingInterval::new(IntervalUnit::Year, 1);
        assert_eq!(interval.expires_from(now), datetime!(2025-06-01 00:00 UTC));

        // Feb 29 + 1 year clamps to Feb 28
        let leap = datetime!(2024-02-29 00:00 UTC);
        assert_eq!(interval.expires_from(leap), datetime!(2025-02-28 00:00 UTC));
    }
}
