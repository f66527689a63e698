//! User-facing message text.
//!
//! Fixed strings are constants; parameterised messages are functions that
//! pick the singular or plural template for their count.

use std::time::Duration;

/// Printed after a successful contract refresh.
pub const REFRESH_CONTRACT_SUCCESS: &str = "Successfully refreshed your subscription.";
/// Surfaced when the contract server cannot be reached or rejects the request.
pub const REFRESH_CONTRACT_FAILURE: &str = "Unable to refresh your subscription";
/// Printed after the configuration was reprocessed.
pub const REFRESH_CONFIG_SUCCESS: &str = "Successfully processed your uapro configuration.";
/// Surfaced when reprocessing the configuration fails.
pub const REFRESH_CONFIG_FAILURE: &str = "Unable to process uapro.toml";
/// Printed after the MOTD messages were regenerated.
pub const REFRESH_MOTD_SUCCESS: &str = "Successfully updated MOTD messages.";
/// Surfaced when regenerating the MOTD messages fails.
pub const REFRESH_MOTD_FAILURE: &str = "Unable to update MOTD messages";

/// Surfaced to non-root callers of privileged operations.
pub const NONROOT_USER: &str = "This command must be run as root (try using sudo).";
/// Surfaced when an operation needs an attached machine.
pub const UNATTACHED: &str = "This machine is not attached to a subscription.\nSee https://ubuntu.com/pro";

/// Contract-expired MOTD text when no updates are being held back.
pub const CONTRACT_EXPIRED: &str = "*Your subscription has EXPIRED*\n\
Renew your subscription to keep receiving security updates.";

/// Surfaced when a command the MOTD target depends on is missing.
#[must_use]
pub fn update_motd_no_required_cmd(cmd: &str) -> String {
    format!("Required command to update MOTD messages not found: {cmd}.")
}

/// Refusal message for an operation blocked by the host lock.
#[must_use]
pub fn lock_held(verb: &str, holder_operation: &str, holder_pid: u32) -> String {
    format!("Unable to perform: {verb}.\nOperation in progress: {holder_operation} (pid:{holder_pid})")
}

/// MOTD text for a contract inside the expiry warning window.
#[must_use]
pub fn contract_expires_soon(remaining_days: i64) -> String {
    format!(
        "CAUTION: Your subscription will expire in {remaining_days} {}.\n\
Renew your subscription to ensure continued security coverage for your applications.",
        days(remaining_days)
    )
}

/// MOTD text for an expired contract still inside its grace period.
#[must_use]
pub fn contract_expired_grace_period(expired_date: &str, elapsed_days: i64, remaining_days: i64) -> String {
    format!(
        "CAUTION: Your subscription expired on {expired_date}, {elapsed_days} {} ago.\n\
Renew your subscription to ensure continued security coverage for your applications.\n\
Your grace period will expire in {remaining_days} {}.",
        days(elapsed_days),
        days(remaining_days)
    )
}

/// MOTD text for an expired contract with updates held back.
#[must_use]
pub fn contract_expired_with_pkgs(pkg_num: u64, service: &str) -> String {
    let (updates, require) = if pkg_num == 1 {
        ("update", "requires")
    } else {
        ("updates", "require")
    };
    format!(
        "*Your subscription has EXPIRED*\n\
{pkg_num} additional security {updates} {require} {service}.\n\
Renew your subscription to receive these updates."
    )
}

/// Deltas applied during release-upgrade processing.
#[must_use]
pub fn upgrade_contract_deltas(past: &str, current: &str) -> String {
    format!("upgrade-lts-contract processing contract deltas: {past} -> {current}")
}

/// Final line of a successful release-upgrade processing run.
#[must_use]
pub fn upgrade_succeeded(retries: u32) -> String {
    format!("upgrade-lts-contract succeeded after {retries} retries")
}

/// Release-upgrade processing refuses releases without a known predecessor.
#[must_use]
pub fn upgrade_unknown_release(series: &str) -> String {
    format!("Could not find past release for: {series}")
}

/// Printed when release-upgrade processing starts.
pub const UPGRADE_STARTING: &str = "Starting upgrade-lts-contract.";
/// Appended to [`UPGRADE_STARTING`] while apt holds its lock.
#[must_use]
pub fn upgrade_waiting_on_apt(interval: Duration) -> String {
    format!(
        " Retrying every {} waiting on released apt lock",
        humantime::format_duration(interval)
    )
}

const fn days(n: i64) -> &'static str {
    if n == 1 { "day" } else { "days" }
}
