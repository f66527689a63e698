//! # uapro-core
//!
//! Contract-status and entitlement reconciliation for the uapro client.
//!
//! A machine attached to a subscription keeps a persisted *machine token*
//! describing its contract and the services it is entitled to. This crate
//! keeps that token in step with the contract server and turns contract state
//! into host-visible effects:
//!
//! - [`expiry`]: derives a [`ContractExpiryStatus`] from the contract's
//!   `effectiveTo` timestamp and the current time
//! - [`messaging`]: projects the expiry status into the MOTD contract-status
//!   message file, refetching expiry from the server when it looks stale
//! - [`refresh`]: the `refresh` operation (config, contract, motd targets)
//! - [`delta`]: diffs two entitlement snapshots and applies the
//!   enable/disable/reconfigure actions per service
//! - [`upgrade`]: the post release-upgrade flow that waits out the apt lock
//!   and migrates entitlements from the previous LTS
//! - [`lock`]: the host-wide operation lock
//!
//! ## Collaborators
//!
//! All host interaction goes through traits so every flow can be driven
//! in-memory:
//!
//! ```text
//! UaContext
//!     |
//!     +-- SystemFacade        (commands, files, os-release, euid)
//!     +-- Clock               (now, sleep)
//!     +-- TokenStore          (machine-token document)
//!     +-- ContractClient      (contract server)
//!     +-- EntitlementBackend  (service status, enable/disable)
//! ```
//!
//! Each trait ships with a production implementation and an in-memory one
//! used by the test suites.

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod context;
pub mod contract;
pub mod delta;
pub mod entitlements;
pub mod error;
pub mod expiry;
pub mod fs_safe;
pub mod lock;
pub mod messages;
pub mod messaging;
pub mod refresh;
pub mod release;
pub mod system;
pub mod token;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, UaConfig};
pub use context::UaContext;
pub use contract::{ContractClient, ContractError, HttpContractClient, MockContractClient};
pub use delta::{DeltaAction, DeltaOutcome, EntitlementDeltaResolver, ServiceDelta};
pub use entitlements::{
    AptEntitlementBackend, ApplicationStatus, BackendError, EntitlementBackend,
    MemoryEntitlementBackend,
};
pub use error::UaError;
pub use expiry::{ContractExpiryStatus, ExpiryAssessment, ExpiryPolicy};
pub use lock::{HostLock, LockError, LockManager, LockRecord};
pub use refresh::{RefreshTarget, refresh};
pub use system::{CommandOutput, HostSystem, RecordingSystem, ReleaseInfo, SystemError, SystemFacade};
pub use token::{
    EntitlementKind, EntitlementRecord, EntitlementSet, FileTokenStore, MemoryTokenStore,
    TokenDocument, TokenStore, TokenStoreError,
};
pub use upgrade::{UpgradeError, UpgradeReport, process_contract_delta_after_apt_lock};
