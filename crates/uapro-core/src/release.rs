//! Built-in release catalog.
//!
//! Release facts the client needs without network access: whether a release
//! is LTS, when its standard support ends, and which LTS a machine most
//! likely upgraded from.

use chrono::NaiveDate;

use crate::token::EntitlementKind;

/// One known release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// Codename.
    pub series: &'static str,
    /// Numeric version.
    pub version: &'static str,
    /// Long-term support release.
    pub lts: bool,
    eol: (i32, u32, u32),
}

impl Release {
    /// Last day of standard support.
    #[must_use]
    pub fn standard_support_end(&self) -> Option<NaiveDate> {
        let (y, m, d) = self.eol;
        NaiveDate::from_ymd_opt(y, m, d)
    }

    /// An LTS release past its standard support, now covered by ESM only.
    #[must_use]
    pub fn is_active_esm(&self, today: NaiveDate) -> bool {
        self.lts && self.standard_support_end().is_some_and(|end| today > end)
    }
}

const fn release(series: &'static str, version: &'static str, lts: bool, eol: (i32, u32, u32)) -> Release {
    Release {
        series,
        version,
        lts,
        eol,
    }
}

const RELEASES: &[Release] = &[
    release("trusty", "14.04", true, (2019, 4, 30)),
    release("xenial", "16.04", true, (2021, 4, 30)),
    release("bionic", "18.04", true, (2023, 5, 31)),
    release("focal", "20.04", true, (2025, 5, 29)),
    release("jammy", "22.04", true, (2027, 6, 1)),
    release("kinetic", "22.10", false, (2023, 7, 20)),
    release("lunar", "23.04", false, (2024, 1, 25)),
    release("mantic", "23.10", false, (2024, 7, 11)),
    release("noble", "24.04", true, (2029, 5, 31)),
    release("oracular", "24.10", false, (2025, 7, 10)),
    release("plucky", "25.04", false, (2026, 1, 15)),
];

/// Release a machine on `series` was most likely upgraded from. Only LTS
/// anchors are listed: interim releases map to the LTS they follow.
const PAST_RELEASES: &[(&str, &str)] = &[
    ("xenial", "trusty"),
    ("bionic", "xenial"),
    ("focal", "bionic"),
    ("jammy", "focal"),
    ("kinetic", "jammy"),
    ("lunar", "jammy"),
    ("mantic", "jammy"),
    ("noble", "jammy"),
    ("oracular", "noble"),
    ("plucky", "noble"),
];

/// Look up a release by codename.
#[must_use]
pub fn lookup(series: &str) -> Option<&'static Release> {
    RELEASES.iter().find(|r| r.series == series)
}

/// Predecessor used when migrating entitlements after a release upgrade.
#[must_use]
pub fn past_release(series: &str) -> Option<&'static str> {
    PAST_RELEASES
        .iter()
        .find(|(current, _)| *current == series)
        .map(|(_, past)| *past)
}

/// Service whose held-back updates the expired-contract message reports:
/// `esm-infra` once an LTS is past standard support, `esm-apps` on a
/// supported LTS, nothing otherwise.
#[must_use]
pub fn base_service(series: &str, today: NaiveDate) -> Option<EntitlementKind> {
    let release = lookup(series)?;
    if release.is_active_esm(today) {
        Some(EntitlementKind::EsmInfra)
    } else if release.lts {
        Some(EntitlementKind::EsmApps)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_past_release_table() {
        assert_eq!(past_release("xenial"), Some("trusty"));
        assert_eq!(past_release("jammy"), Some("focal"));
        assert_eq!(past_release("kinetic"), Some("jammy"));
        assert_eq!(past_release("noble"), Some("jammy"));
        assert_eq!(past_release("trusty"), None);
        assert_eq!(past_release("unknown"), None);
    }

    #[test]
    fn test_every_predecessor_is_a_known_lts() {
        for (current, past) in PAST_RELEASES {
            assert!(lookup(current).is_some(), "{current} missing from catalog");
            assert!(lookup(past).is_some_and(|r| r.lts), "{past} is not a known LTS");
        }
    }

    #[test]
    fn test_catalog_dates_are_valid() {
        for r in RELEASES {
            assert!(r.standard_support_end().is_some(), "{} has an invalid date", r.series);
        }
    }

    #[test]
    fn test_base_service_selection() {
        let today = day(2026, 10, 17);
        assert_eq!(base_service("xenial", today), Some(EntitlementKind::EsmInfra));
        assert_eq!(base_service("focal", today), Some(EntitlementKind::EsmInfra));
        assert_eq!(base_service("jammy", today), Some(EntitlementKind::EsmApps));
        assert_eq!(base_service("plucky", today), None);
        assert_eq!(base_service("unknown", today), None);
    }

    #[test]
    fn test_active_esm_starts_the_day_after_support_ends() {
        let jammy = lookup("jammy").unwrap();
        assert!(!jammy.is_active_esm(day(2027, 6, 1)));
        assert!(jammy.is_active_esm(day(2027, 6, 2)));
    }
}
