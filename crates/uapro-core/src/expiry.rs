//! Contract expiry status.
//!
//! Maps a contract's `effectiveTo` timestamp and the current time onto one of
//! five ordered buckets:
//!
//! ```text
//!   Active | ActiveExpiredSoon | ExpiredGracePeriod | Expired
//! --------+-------------------+--------------------+-------------->  now
//!   effectiveTo - soon     effectiveTo     effectiveTo + grace
//! ```
//!
//! A contract without `effectiveTo` never expires and is reported as
//! [`ContractExpiryStatus::None`]. Resolution is pure: the same
//! `(effective_to, now)` pair always yields the same assessment.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Days before `effectiveTo` at which the contract counts as expiring soon.
pub const DEFAULT_SOON_WINDOW_DAYS: u32 = 20;

/// Days after `effectiveTo` during which entitlements keep working.
pub const DEFAULT_GRACE_PERIOD_DAYS: u32 = 14;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Discrete contract expiry state.
///
/// Variants are declared in time order so `Ord` follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContractExpiryStatus {
    /// No expiry recorded.
    None,
    /// More than the soon window remains.
    Active,
    /// Inside the soon window, not yet expired.
    #[serde(rename = "active-soon-to-expire")]
    ActiveExpiredSoon,
    /// Expired, still inside the grace period.
    #[serde(rename = "grace-period")]
    ExpiredGracePeriod,
    /// Expired and past the grace period.
    Expired,
}

impl ContractExpiryStatus {
    /// Stable string form, as used in status output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Active => "active",
            Self::ActiveExpiredSoon => "active-soon-to-expire",
            Self::ExpiredGracePeriod => "grace-period",
            Self::Expired => "expired",
        }
    }

    /// Whether the locally cached expiry should be re-checked with the
    /// contract server before acting on this status.
    #[must_use]
    pub const fn needs_refetch(self) -> bool {
        matches!(self, Self::ExpiredGracePeriod | Self::Expired)
    }
}

impl fmt::Display for ContractExpiryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of resolving an expiry timestamp.
///
/// The meaning of `days` depends on the status:
///
/// | status | `days` |
/// |---|---|
/// | `None` | 0 |
/// | `Active`, `ActiveExpiredSoon` | days left until `effectiveTo`, rounded up |
/// | `ExpiredGracePeriod` | days left in the grace period |
/// | `Expired` | whole days since the grace period ended |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryAssessment {
    /// Bucket the contract falls into.
    pub status: ContractExpiryStatus,
    /// Day count, see the type docs.
    pub days: i64,
}

/// Bucket boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    soon_window: TimeDelta,
    grace_period: TimeDelta,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::from_days(DEFAULT_SOON_WINDOW_DAYS, DEFAULT_GRACE_PERIOD_DAYS)
    }
}

impl ExpiryPolicy {
    /// Build a policy from whole-day windows.
    #[must_use]
    pub fn from_days(soon_window_days: u32, grace_period_days: u32) -> Self {
        Self {
            soon_window: TimeDelta::days(i64::from(soon_window_days)),
            grace_period: TimeDelta::days(i64::from(grace_period_days)),
        }
    }

    /// Length of the grace period in whole days.
    #[must_use]
    pub fn grace_period_days(&self) -> i64 {
        self.grace_period.num_days()
    }

    /// Length of the soon window in whole days.
    #[must_use]
    pub fn soon_window_days(&self) -> i64 {
        self.soon_window.num_days()
    }

    /// Resolve the expiry status of a contract at `now`.
    #[must_use]
    pub fn resolve(&self, effective_to: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ExpiryAssessment {
        let Some(effective_to) = effective_to else {
            return ExpiryAssessment {
                status: ContractExpiryStatus::None,
                days: 0,
            };
        };

        let remaining = effective_to.signed_duration_since(now);
        if remaining > self.soon_window {
            return ExpiryAssessment {
                status: ContractExpiryStatus::Active,
                days: ceil_days(remaining),
            };
        }
        if remaining > TimeDelta::zero() {
            return ExpiryAssessment {
                status: ContractExpiryStatus::ActiveExpiredSoon,
                days: ceil_days(remaining),
            };
        }

        let elapsed = -remaining;
        if elapsed < self.grace_period {
            return ExpiryAssessment {
                status: ContractExpiryStatus::ExpiredGracePeriod,
                days: self.grace_period_days() - floor_days(elapsed),
            };
        }

        ExpiryAssessment {
            status: ContractExpiryStatus::Expired,
            days: floor_days(elapsed - self.grace_period),
        }
    }
}

fn ceil_days(delta: TimeDelta) -> i64 {
    let millis = delta.num_milliseconds();
    millis.div_euclid(MILLIS_PER_DAY) + i64::from(millis.rem_euclid(MILLIS_PER_DAY) != 0)
}

fn floor_days(delta: TimeDelta) -> i64 {
    delta.num_milliseconds().div_euclid(MILLIS_PER_DAY)
}
