//! Entitlement migration after a release upgrade.
//!
//! After `do-release-upgrade` the machine token still describes services as
//! they were resolved for the previous release. This module waits until apt
//! releases its lists lock, then diffs the token resolved for the
//! predecessor LTS against the token resolved for the running release and
//! applies the difference, enabling newly entitled services.

use std::io::{self, Write};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::UaContext;
use crate::delta::{self, EntitlementDeltaResolver, ServiceDelta};
use crate::lock::LockError;
use crate::messages;
use crate::release;
use crate::system::SystemError;
use crate::token::TokenStoreError;

/// Operation name recorded in the host lock.
pub const UPGRADE_OPERATION: &str = "uapro upgrade-lts-contract";

/// Release-upgrade processing failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpgradeError {
    /// The running release has no known predecessor.
    #[error("Could not find past release for: {series}")]
    UnknownRelease {
        /// Running release codename.
        series: String,
    },

    /// Another operation holds the host lock, or the lock file failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The machine token could not be read.
    #[error(transparent)]
    Token(#[from] TokenStoreError),

    /// `lsof` or os-release could not be used.
    #[error(transparent)]
    System(#[from] SystemError),

    /// Writing progress output failed.
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Predecessor release the token was compared against.
    pub past_series: String,
    /// Running release.
    pub current_series: String,
    /// Number of apt lock polls after the first.
    pub retries: u32,
    /// Per-service resolution.
    pub deltas: Vec<ServiceDelta>,
}

/// Apply entitlement changes between the previous LTS and the running
/// release once apt is idle.
///
/// Progress lines are written to `out`. Returns `Ok(None)` without doing
/// anything on an unattached machine.
///
/// The host lock is held from before the first apt poll until the changes
/// are applied. The apt lock is polled every `upgrade.retry_interval` with
/// no upper bound.
///
/// # Errors
///
/// - [`UpgradeError::Lock`] if another operation holds the host lock.
/// - [`UpgradeError::UnknownRelease`] if the running release is not in the
///   predecessor table; no entitlement is touched.
/// - [`UpgradeError::System`] if `lsof` cannot run or os-release is
///   unreadable.
/// - [`UpgradeError::Token`] if the token cannot be read.
pub fn process_contract_delta_after_apt_lock(
    ctx: &UaContext,
    out: &mut dyn Write,
) -> Result<Option<UpgradeReport>, UpgradeError> {
    let Some(document) = ctx.attached_document()? else {
        debug!("machine is unattached, skipping upgrade-lts-contract");
        return Ok(None);
    };
    let _lock = ctx.lock_manager().acquire(UPGRADE_OPERATION)?;

    let interval = ctx.config.upgrade.retry_interval;
    let mut held = apt_lock_held(ctx)?;
    if held {
        writeln!(
            out,
            "{}{}",
            messages::UPGRADE_STARTING,
            messages::upgrade_waiting_on_apt(interval)
        )?;
    } else {
        writeln!(out, "{}", messages::UPGRADE_STARTING)?;
    }

    let current = ctx.system.release_info()?.series;
    let Some(past) = release::past_release(&current) else {
        let msg = messages::upgrade_unknown_release(&current);
        writeln!(out, "{msg}")?;
        warn!(series = %current, "{msg}");
        return Err(UpgradeError::UnknownRelease { series: current });
    };

    let past_entitlements = document.entitlements_for_series(past);
    let current_entitlements = document.entitlements_for_series(&current);

    let mut retries: u32 = 0;
    while held {
        ctx.clock.sleep(interval);
        held = apt_lock_held(ctx)?;
        retries = retries.saturating_add(1);
        debug!(retries, held, "polled apt lock");
    }

    writeln!(out, "{}", messages::upgrade_contract_deltas(past, &current))?;
    let resolver = EntitlementDeltaResolver::new(ctx.entitlements.as_ref(), &current);
    let deltas = resolver.compute_and_apply(&past_entitlements, &current_entitlements, true, false);

    writeln!(out, "{}", messages::upgrade_succeeded(retries))?;
    info!(
        past,
        current = %current,
        retries,
        changes = ?delta::changes(&deltas),
        "upgrade-lts-contract finished"
    );

    Ok(Some(UpgradeReport {
        past_series: past.to_string(),
        current_series: current,
        retries,
        deltas,
    }))
}

/// Whether some process holds the apt lists lock.
fn apt_lock_held(ctx: &UaContext) -> Result<bool, SystemError> {
    let lock = ctx.config.upgrade.apt_lock_path.to_string_lossy();
    let output = ctx.system.run("lsof", &[lock.as_ref()])?.ensure_exit_in("lsof", &[0, 1])?;
    Ok(!output.stdout.trim().is_empty())
}

/// Remove the private ESM apt cache left over from the previous release.
///
/// Returns whether the directory existed.
///
/// # Errors
///
/// Returns an error if the directory cannot be removed.
pub fn remove_private_esm_apt_cache(ctx: &UaContext) -> Result<bool, SystemError> {
    let dir = ctx.config.esm_cache_dir();
    let removed = ctx.system.remove_dir_if_exists(&dir)?;
    if removed {
        info!(path = %dir.display(), "removed private ESM apt cache");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::clock::Clock;
    use crate::lock::LockManager;
    use crate::delta::{self, DeltaAction, DeltaOutcome};
    use crate::entitlements::BackendCall;
    use crate::system::{CommandOutput, RecordingSystem};
    use crate::test_support::{NOW, TestHost, ts};
    use crate::token::{EntitlementRecord, TokenDocument};

    const LSOF_HELD: &str = "COMMAND PID USER FD TYPE\napt-get 4242 root 3uW REG\n";

    fn upgrade_token() -> TokenDocument {
        TokenDocument::new("tok", "cid")
            .with_entitlement(EntitlementRecord::new("esm-infra", true).with_override(
                "jammy",
                Some(false),
                &[],
            ))
            .with_entitlement(EntitlementRecord::new("esm-apps", false).with_override(
                "jammy",
                Some(true),
                &[],
            ))
    }

    fn run(ctx: &UaContext) -> (Result<Option<UpgradeReport>, UpgradeError>, String) {
        let mut out = Vec::new();
        let result = process_contract_delta_after_apt_lock(ctx, &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    fn lsof_free(system: &RecordingSystem) {
        system.script("lsof", CommandOutput::exited(1, "", ""));
    }

    /// Clock that tries to take the host lock on every sleep, as a second
    /// `uapro` process would while this one waits on apt.
    #[derive(Debug)]
    struct ContendingClock {
        lock: LockManager,
        acquired: Mutex<Vec<bool>>,
    }

    impl Clock for ContendingClock {
        fn now(&self) -> DateTime<Utc> {
            ts(NOW)
        }

        fn sleep(&self, _duration: Duration) {
            let acquired = self.lock.acquire("uapro refresh").is_ok();
            self.acquired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(acquired);
        }
    }

    #[test]
    fn test_unattached_is_a_noop() {
        let host = TestHost::new();
        let (result, out) = run(&host.context());
        assert_eq!(result.unwrap(), None);
        assert!(out.is_empty());
        assert!(host.system.invocations_of("lsof").is_empty());
    }

    #[test]
    fn test_migrates_entitlements_from_previous_lts() {
        let host = TestHost::attached(upgrade_token());
        lsof_free(&host.system);

        let (result, out) = run(&host.context());
        let report = result.unwrap().unwrap();
        assert_eq!(report.past_series, "focal");
        assert_eq!(report.current_series, "jammy");
        assert_eq!(report.retries, 0);
        assert_eq!(
            delta::changes(&report.deltas),
            [("esm-infra", DeltaAction::Disable), ("esm-apps", DeltaAction::Enable)]
        );
        assert!(report.deltas.iter().all(|d| d.outcome == DeltaOutcome::Applied));
        assert_eq!(
            host.backend.calls(),
            [
                BackendCall::Disable("esm-infra".to_string()),
                BackendCall::Enable("esm-apps".to_string()),
            ]
        );
        assert_eq!(
            out,
            "Starting upgrade-lts-contract.\n\
             upgrade-lts-contract processing contract deltas: focal -> jammy\n\
             upgrade-lts-contract succeeded after 0 retries\n"
        );
    }

    #[test]
    fn test_waits_for_apt_lock() {
        let host = TestHost::attached(upgrade_token());
        host.system.script("lsof", CommandOutput::success(LSOF_HELD));
        host.system.script("lsof", CommandOutput::success(LSOF_HELD));
        host.system.script("lsof", CommandOutput::success(LSOF_HELD));
        lsof_free(&host.system);

        let (result, out) = run(&host.context());
        assert_eq!(result.unwrap().unwrap().retries, 3);
        assert_eq!(host.clock.sleeps(), vec![Duration::from_secs(10); 3]);
        assert_eq!(host.system.invocations_of("lsof").len(), 4);
        assert_eq!(
            host.system.invocations_of("lsof")[0],
            ["lsof", "/var/lib/apt/lists/lock"]
        );
        assert!(out.starts_with(
            "Starting upgrade-lts-contract. Retrying every 10s waiting on released apt lock\n"
        ));
        assert!(out.ends_with("succeeded after 3 retries\n"));
    }

    #[test]
    fn test_apt_wait_message_uses_configured_interval() {
        let host = TestHost::attached(upgrade_token());
        host.system.script("lsof", CommandOutput::success(LSOF_HELD));
        lsof_free(&host.system);
        let mut ctx = host.context();
        ctx.config.upgrade.retry_interval = Duration::from_secs(30);

        let (result, out) = run(&ctx);
        assert_eq!(result.unwrap().unwrap().retries, 1);
        assert_eq!(host.clock.sleeps(), [Duration::from_secs(30)]);
        assert!(out.starts_with(
            "Starting upgrade-lts-contract. Retrying every 30s waiting on released apt lock\n"
        ));
    }

    #[test]
    fn test_host_lock_is_held_while_waiting_on_apt() {
        let host = TestHost::attached(upgrade_token());
        host.system.script("lsof", CommandOutput::success(LSOF_HELD));
        host.system.script("lsof", CommandOutput::success(LSOF_HELD));
        lsof_free(&host.system);
        let mut ctx = host.context();
        let clock = Arc::new(ContendingClock {
            lock: ctx.lock_manager(),
            acquired: Mutex::new(Vec::new()),
        });
        ctx.clock = clock.clone();

        let (result, _) = run(&ctx);
        assert_eq!(result.unwrap().unwrap().retries, 2);
        assert_eq!(*clock.acquired.lock().unwrap(), [false, false]);
        assert!(!ctx.config.lock_path().exists());
        assert!(ctx.lock_manager().acquire("uapro refresh").is_ok());
    }

    #[test]
    fn test_refused_while_other_operation_holds_lock() {
        let host = TestHost::attached(upgrade_token());
        let ctx = host.context();
        fs::write(
            ctx.config.lock_path(),
            format!("{}:uapro refresh", std::process::id()),
        )
        .unwrap();

        let (result, out) = run(&ctx);
        match result {
            Err(UpgradeError::Lock(LockError::Held { msg, .. })) => assert_eq!(
                msg,
                format!(
                    "Unable to perform: uapro upgrade-lts-contract.\nOperation in progress: uapro refresh (pid:{})",
                    std::process::id()
                )
            ),
            other => panic!("expected a held lock, got {other:?}"),
        }
        assert!(out.is_empty());
        assert!(host.system.invocations_of("lsof").is_empty());
        assert!(host.backend.calls().is_empty());
    }

    #[test]
    fn test_unknown_release_changes_nothing() {
        let host = TestHost::attached(upgrade_token());
        let ctx = {
            let mut ctx = host.context();
            ctx.system = Arc::new(RecordingSystem::new().with_release("trusty", "14.04"));
            ctx
        };

        let (result, out) = run(&ctx);
        assert!(matches!(
            result,
            Err(UpgradeError::UnknownRelease { ref series }) if series == "trusty"
        ));
        assert!(out.ends_with("Could not find past release for: trusty\n"));
        assert!(host.backend.calls().is_empty());
    }

    #[test]
    fn test_lsof_failure_is_an_error() {
        let host = TestHost::attached(upgrade_token());
        host.system
            .script("lsof", CommandOutput::exited(2, "", "lsof: bad option"));

        let (result, _) = run(&host.context());
        assert!(matches!(result, Err(UpgradeError::System(_))));
        assert!(host.backend.calls().is_empty());
    }

    #[test]
    fn test_backend_failure_does_not_abort() {
        let host = TestHost::attached(upgrade_token());
        lsof_free(&host.system);
        host.backend.fail_service("esm-infra");

        let (result, _) = run(&host.context());
        let report = result.unwrap().unwrap();
        assert!(matches!(report.deltas[0].outcome, DeltaOutcome::Failed { .. }));
        assert_eq!(report.deltas[1].outcome, DeltaOutcome::Applied);
    }

    #[test]
    fn test_remove_private_esm_apt_cache() {
        let host = TestHost::new();
        let ctx = host.context();
        host.system.add_dir(ctx.config.esm_cache_dir());

        assert!(remove_private_esm_apt_cache(&ctx).unwrap());
        assert!(!remove_private_esm_apt_cache(&ctx).unwrap());
    }
}
