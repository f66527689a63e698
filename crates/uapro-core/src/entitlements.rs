//! Service enable/disable backends.
//!
//! Repository-type services are delivered through one deb822 sources file
//! each:
//!
//! ```text
//! <sources_dir>/uapro-<service>.sources
//!
//! Types: deb
//! URIs: <aptURL>
//! Suites: <suites>
//! Components: main
//! Signed-By: /usr/share/keyrings/<aptKey | uapro-<service>.gpg>
//! ```
//!
//! A service counts as enabled while its sources file exists.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::system::{SystemError, SystemFacade};
use crate::token::{EntitlementKind, EntitlementRecord};

const KEYRING_DIR: &str = "/usr/share/keyrings";

/// Errors from entitlement backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The backend cannot perform this operation for the service.
    #[error("{operation} is not supported for {service}")]
    Unsupported {
        /// Service name.
        service: String,
        /// Attempted operation.
        operation: &'static str,
    },

    /// A directive the operation needs is missing.
    #[error("{service} has no {directive} directive")]
    MissingDirective {
        /// Service name.
        service: String,
        /// Missing directive name.
        directive: &'static str,
    },

    /// Host interaction failed.
    #[error(transparent)]
    System(#[from] SystemError),

    /// The operation failed for another reason.
    #[error("{service}: {reason}")]
    Failed {
        /// Service name.
        service: String,
        /// Failure description.
        reason: String,
    },
}

/// Whether a service is active on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    /// The service is active.
    Enabled,
    /// The service is not active.
    Disabled,
}

/// Operations on a service.
pub trait EntitlementBackend: Send + Sync {
    /// Current status of `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be determined.
    fn status(&self, service: &str) -> Result<ApplicationStatus, BackendError>;

    /// Number of package updates available from `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if the package manager cannot be queried.
    fn pending_updates(&self, service: &str) -> Result<u64, BackendError>;

    /// Activate the service described by `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if activation fails.
    fn enable(&self, record: &EntitlementRecord) -> Result<(), BackendError>;

    /// Deactivate the service described by `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if deactivation fails.
    fn disable(&self, record: &EntitlementRecord) -> Result<(), BackendError>;

    /// Re-apply the service with the directives of `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new configuration cannot be applied.
    fn reconfigure(&self, record: &EntitlementRecord) -> Result<(), BackendError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Apt
// ─────────────────────────────────────────────────────────────────────────────

/// Backend managing apt sources files.
pub struct AptEntitlementBackend {
    system: Arc<dyn SystemFacade>,
    sources_dir: PathBuf,
}

impl std::fmt::Debug for AptEntitlementBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AptEntitlementBackend")
            .field("sources_dir", &self.sources_dir)
            .finish_non_exhaustive()
    }
}

impl AptEntitlementBackend {
    /// Backend writing sources files into `sources_dir`.
    #[must_use]
    pub fn new(system: Arc<dyn SystemFacade>, sources_dir: impl Into<PathBuf>) -> Self {
        Self {
            system,
            sources_dir: sources_dir.into(),
        }
    }

    /// Sources file for `service`.
    #[must_use]
    pub fn sources_path(&self, service: &str) -> PathBuf {
        self.sources_dir.join(format!("uapro-{service}.sources"))
    }

    fn require_repository(service: &str, operation: &'static str) -> Result<EntitlementKind, BackendError> {
        let kind = EntitlementKind::from_name(service);
        if kind.is_repository() {
            Ok(kind)
        } else {
            Err(BackendError::Unsupported {
                service: service.to_string(),
                operation,
            })
        }
    }

    fn write_sources(&self, record: &EntitlementRecord, operation: &'static str) -> Result<(), BackendError> {
        Self::require_repository(&record.service, operation)?;
        let content = render_sources(record)?;
        let path = self.sources_path(&record.service);
        self.system.write_file(&path, content.as_bytes(), 0o644)?;
        info!(service = %record.service, path = %path.display(), operation, "wrote apt sources");
        Ok(())
    }
}

/// deb822 stanza for a repository entitlement.
///
/// # Errors
///
/// Returns [`BackendError::MissingDirective`] without `aptURL` or `suites`.
pub fn render_sources(record: &EntitlementRecord) -> Result<String, BackendError> {
    let directive = |name: &'static str| {
        record
            .directives
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BackendError::MissingDirective {
                service: record.service.clone(),
                directive: name,
            })
    };
    let uri = directive("aptURL")?;
    let suites: Vec<&str> = directive("suites")?
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();
    let keyring = record
        .directives
        .get("aptKey")
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map_or_else(|| format!("uapro-{}.gpg", record.service), str::to_string);

    Ok(format!(
        "Types: deb\nURIs: {uri}\nSuites: {}\nComponents: main\nSigned-By: {}\n",
        suites.join(" "),
        Path::new(KEYRING_DIR).join(keyring).display()
    ))
}

/// Count `apt list --upgradable` entries whose suite contains `marker`.
///
/// Entries look like `name/suite[,suite] version arch [upgradable from: x]`.
#[must_use]
pub fn count_upgradable(apt_list_output: &str, marker: &str) -> u64 {
    let matching = apt_list_output
        .lines()
        .filter_map(|line| line.split_once('/'))
        .filter_map(|(_, rest)| rest.split_whitespace().next())
        .filter(|suites| suites.split(',').any(|s| s.contains(marker)))
        .count();
    u64::try_from(matching).unwrap_or(u64::MAX)
}

impl EntitlementBackend for AptEntitlementBackend {
    fn status(&self, service: &str) -> Result<ApplicationStatus, BackendError> {
        Self::require_repository(service, "status")?;
        Ok(if self.system.path_exists(&self.sources_path(service)) {
            ApplicationStatus::Enabled
        } else {
            ApplicationStatus::Disabled
        })
    }

    fn pending_updates(&self, service: &str) -> Result<u64, BackendError> {
        let marker = EntitlementKind::from_name(service)
            .pocket_marker()
            .ok_or_else(|| BackendError::Unsupported {
                service: service.to_string(),
                operation: "pending updates",
            })?;
        let output = self
            .system
            .run("apt", &["list", "--upgradable"])?
            .ensure_exit_in("apt", &[0])?;
        let count = count_upgradable(&output.stdout, marker);
        debug!(service, count, "counted pending updates");
        Ok(count)
    }

    fn enable(&self, record: &EntitlementRecord) -> Result<(), BackendError> {
        self.write_sources(record, "enable")
    }

    fn disable(&self, record: &EntitlementRecord) -> Result<(), BackendError> {
        Self::require_repository(&record.service, "disable")?;
        let path = self.sources_path(&record.service);
        let removed = self.system.remove_file_if_exists(&path)?;
        info!(service = %record.service, path = %path.display(), removed, "removed apt sources");
        Ok(())
    }

    fn reconfigure(&self, record: &EntitlementRecord) -> Result<(), BackendError> {
        self.write_sources(record, "reconfigure")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// Mutating call received by [`MemoryEntitlementBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `enable(service)`.
    Enable(String),
    /// `disable(service)`.
    Disable(String),
    /// `reconfigure(service)`.
    Reconfigure(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    statuses: BTreeMap<String, ApplicationStatus>,
    pending: BTreeMap<String, u64>,
    failing: BTreeSet<String>,
    calls: Vec<BackendCall>,
}

/// Backend that keeps statuses in memory and records calls.
///
/// Unknown services are `Disabled` with no pending updates.
#[derive(Debug, Default)]
pub struct MemoryEntitlementBackend {
    state: Mutex<MemoryState>,
}

impl MemoryEntitlementBackend {
    /// Empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the status of `service`.
    pub fn set_status(&self, service: &str, status: ApplicationStatus) {
        self.state().statuses.insert(service.to_string(), status);
    }

    /// Set the pending update count of `service`.
    pub fn set_pending_updates(&self, service: &str, count: u64) {
        self.state().pending.insert(service.to_string(), count);
    }

    /// Make every operation on `service` fail.
    pub fn fail_service(&self, service: &str) {
        self.state().failing.insert(service.to_string());
    }

    /// Mutating calls so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    fn check(state: &MemoryState, service: &str) -> Result<(), BackendError> {
        if state.failing.contains(service) {
            Err(BackendError::Failed {
                service: service.to_string(),
                reason: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

impl EntitlementBackend for MemoryEntitlementBackend {
    fn status(&self, service: &str) -> Result<ApplicationStatus, BackendError> {
        let state = self.state();
        Self::check(&state, service)?;
        Ok(state
            .statuses
            .get(service)
            .copied()
            .unwrap_or(ApplicationStatus::Disabled))
    }

    fn pending_updates(&self, service: &str) -> Result<u64, BackendError> {
        let state = self.state();
        Self::check(&state, service)?;
        Ok(state.pending.get(service).copied().unwrap_or(0))
    }

    fn enable(&self, record: &EntitlementRecord) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::Enable(record.service.clone()));
        Self::check(&state, &record.service)?;
        state
            .statuses
            .insert(record.service.clone(), ApplicationStatus::Enabled);
        Ok(())
    }

    fn disable(&self, record: &EntitlementRecord) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::Disable(record.service.clone()));
        Self::check(&state, &record.service)?;
        state
            .statuses
            .insert(record.service.clone(), ApplicationStatus::Disabled);
        Ok(())
    }

    fn reconfigure(&self, record: &EntitlementRecord) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::Reconfigure(record.service.clone()));
        Self::check(&state, &record.service)
    }
}
