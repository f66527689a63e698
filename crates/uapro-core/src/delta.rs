//! Entitlement delta resolution.
//!
//! Compares two entitlement snapshots service by service and applies the
//! difference through an [`EntitlementBackend`]:
//!
//! | past | new | action |
//! |---|---|---|
//! | absent or not entitled | entitled | `Enable` |
//! | entitled | absent or not entitled | `Disable` |
//! | entitled | entitled, other directives | `Reconfigure` |
//! | anything else | | `Noop` |
//!
//! Services are visited in snapshot order: every service of the past
//! snapshot first, then the services that only appear in the new one. A
//! failure on one service is logged and recorded, and the batch carries on.

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::entitlements::EntitlementBackend;
use crate::token::{EntitlementRecord, EntitlementSet};

/// Change required for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaAction {
    /// Nothing to do.
    Noop,
    /// Newly entitled.
    Enable,
    /// No longer entitled.
    Disable,
    /// Still entitled, configuration changed.
    Reconfigure,
}

impl fmt::Display for DeltaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Noop => "noop",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Reconfigure => "reconfigure",
        })
    }
}

/// What happened when an action was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DeltaOutcome {
    /// `Noop`; the backend was not called.
    Unchanged,
    /// The backend call succeeded.
    Applied,
    /// `Enable` while enabling is not allowed.
    Skipped,
    /// The backend call failed.
    Failed {
        /// Error text.
        reason: String,
    },
}

/// Resolution for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDelta {
    /// Service name.
    pub service: String,
    /// Required change.
    pub action: DeltaAction,
    /// Result of applying it.
    pub outcome: DeltaOutcome,
}

/// Diffs snapshots for one release and applies the result.
pub struct EntitlementDeltaResolver<'a> {
    backend: &'a dyn EntitlementBackend,
    series: &'a str,
}

impl fmt::Debug for EntitlementDeltaResolver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitlementDeltaResolver")
            .field("series", &self.series)
            .finish_non_exhaustive()
    }
}

impl<'a> EntitlementDeltaResolver<'a> {
    /// Resolver applying changes through `backend` on `series`.
    #[must_use]
    pub fn new(backend: &'a dyn EntitlementBackend, series: &'a str) -> Self {
        Self { backend, series }
    }

    /// Action turning `past` into `new` for one service.
    #[must_use]
    pub fn diff_action(past: Option<&EntitlementRecord>, new: Option<&EntitlementRecord>) -> DeltaAction {
        let was = past.is_some_and(|r| r.entitled);
        let is = new.is_some_and(|r| r.entitled);
        match (was, is) {
            (false, true) => DeltaAction::Enable,
            (true, false) => DeltaAction::Disable,
            (true, true) => match (past, new) {
                (Some(p), Some(n)) if p.directives != n.directives || p.overrides != n.overrides => {
                    DeltaAction::Reconfigure
                },
                _ => DeltaAction::Noop,
            },
            (false, false) => DeltaAction::Noop,
        }
    }

    /// Compute the per-service actions and apply them.
    ///
    /// With `series_overrides`, both snapshots are first resolved for this
    /// resolver's series. `Enable` actions are only applied when
    /// `allow_enable` is set and are reported as skipped otherwise.
    pub fn compute_and_apply(
        &self,
        past: &EntitlementSet,
        new: &EntitlementSet,
        allow_enable: bool,
        series_overrides: bool,
    ) -> Vec<ServiceDelta> {
        let (past, new) = if series_overrides {
            (past.for_series(self.series), new.for_series(self.series))
        } else {
            (past.clone(), new.clone())
        };

        let services = past
            .iter()
            .map(|r| r.service.as_str())
            .chain(
                new.iter()
                    .map(|r| r.service.as_str())
                    .filter(|s| past.get(s).is_none()),
            );

        let mut deltas = Vec::new();
        for service in services {
            let past_record = past.get(service);
            let new_record = new.get(service);
            let action = Self::diff_action(past_record, new_record);
            let outcome = self.apply(service, action, past_record, new_record, allow_enable);
            deltas.push(ServiceDelta {
                service: service.to_string(),
                action,
                outcome,
            });
        }
        deltas
    }

    fn apply(
        &self,
        service: &str,
        action: DeltaAction,
        past: Option<&EntitlementRecord>,
        new: Option<&EntitlementRecord>,
        allow_enable: bool,
    ) -> DeltaOutcome {
        let result = match (action, past, new) {
            (DeltaAction::Noop, _, _) => return DeltaOutcome::Unchanged,
            (DeltaAction::Enable, _, _) if !allow_enable => {
                info!(service, "newly entitled service left disabled");
                return DeltaOutcome::Skipped;
            },
            (DeltaAction::Enable, _, Some(record)) => self.backend.enable(record),
            (DeltaAction::Disable, Some(record), _) => self.backend.disable(record),
            (DeltaAction::Reconfigure, _, Some(record)) => self.backend.reconfigure(record),
            _ => return DeltaOutcome::Unchanged,
        };
        match result {
            Ok(()) => {
                info!(service, %action, series = self.series, "applied entitlement change");
                DeltaOutcome::Applied
            },
            Err(err) => {
                warn!(service, %action, err = %err, "failed to apply entitlement change");
                DeltaOutcome::Failed {
                    reason: err.to_string(),
                }
            },
        }
    }
}

/// `(service, action)` pairs of `deltas`, dropping no-ops. Used for the
/// summary logged after a batch is applied.
#[must_use]
pub fn changes(deltas: &[ServiceDelta]) -> Vec<(&str, DeltaAction)> {
    deltas
        .iter()
        .filter(|d| d.action != DeltaAction::Noop)
        .map(|d| (d.service.as_str(), d.action))
        .collect()
}
