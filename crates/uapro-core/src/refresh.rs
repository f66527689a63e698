//! The `refresh` operation.
//!
//! Brings local state back in line with its sources. Each target can run on
//! its own; without a target all three run in order and the first failure
//! stops the rest:
//!
//! 1. `config`: reload and apply the configuration file
//! 2. `contract`: fetch the contract and apply entitlement changes
//! 3. `motd`: regenerate the MOTD messages
//!
//! The whole invocation holds the host lock.

use std::fmt;
use std::io::Write;

use tracing::{error, info, warn};

use crate::config;
use crate::context::UaContext;
use crate::delta::{self, EntitlementDeltaResolver, ServiceDelta};
use crate::error::UaError;
use crate::messages;
use crate::messaging;

/// Operation name recorded in the host lock.
pub const REFRESH_OPERATION: &str = "uapro refresh";

/// What to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTarget {
    /// Contract and entitlements.
    Contract,
    /// Configuration file.
    Config,
    /// MOTD messages.
    Motd,
}

impl fmt::Display for RefreshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Contract => "contract",
            Self::Config => "config",
            Self::Motd => "motd",
        })
    }
}

fn includes(target: Option<RefreshTarget>, step: RefreshTarget) -> bool {
    target.is_none_or(|t| t == step)
}

/// Run `refresh` for `target` (all targets when `None`), printing one
/// success line per completed step to `out`.
///
/// Returns the process exit code, which is 0 on success.
///
/// # Errors
///
/// - [`UaError::NonRootUser`] unless running as root.
/// - [`UaError::Unattached`] for the `contract` and default targets on an
///   unattached machine.
/// - [`UaError::LockHeld`] if another operation holds the host lock.
/// - [`UaError::UserFacing`] with the step's failure message when a step
///   fails.
pub fn refresh(ctx: &mut UaContext, target: Option<RefreshTarget>, out: &mut dyn Write) -> Result<i32, UaError> {
    if !ctx.system.is_root() {
        return Err(UaError::NonRootUser);
    }
    if includes(target, RefreshTarget::Contract) && !ctx.is_attached()? {
        return Err(UaError::Unattached);
    }

    let _lock = ctx.lock_manager().acquire(REFRESH_OPERATION)?;
    info!(refresh_target = ?target, "refresh started");

    if includes(target, RefreshTarget::Config) {
        refresh_config(ctx, out)?;
    }
    if includes(target, RefreshTarget::Contract) {
        refresh_contract(ctx, out)?;
    }
    if includes(target, RefreshTarget::Motd) {
        refresh_motd(ctx, out)?;
    }
    Ok(0)
}

fn refresh_config(ctx: &mut UaContext, out: &mut dyn Write) -> Result<(), UaError> {
    if let Err(err) = config::process_config(ctx) {
        error!(err = %err, "failed to process configuration");
        return Err(UaError::user_facing(messages::REFRESH_CONFIG_FAILURE));
    }
    writeln!(out, "{}", messages::REFRESH_CONFIG_SUCCESS)?;
    Ok(())
}

fn refresh_contract(ctx: &UaContext, out: &mut dyn Write) -> Result<(), UaError> {
    match request_updated_contract(ctx) {
        Ok(_) => {},
        Err(UaError::Url(err)) => {
            error!(err = %err, "failed to refresh contract");
            return Err(UaError::user_facing(messages::REFRESH_CONTRACT_FAILURE));
        },
        Err(err) => return Err(err),
    }
    writeln!(out, "{}", messages::REFRESH_CONTRACT_SUCCESS)?;
    Ok(())
}

fn refresh_motd(ctx: &UaContext, out: &mut dyn Write) -> Result<(), UaError> {
    if let Err(err) = messaging::update_motd_messages(ctx) {
        error!(err = %err, "failed to update MOTD messages");
        return Err(UaError::user_facing(messages::REFRESH_MOTD_FAILURE));
    }
    let required = &ctx.config.motd.required_command;
    if !ctx.system.command_exists(required) {
        return Err(UaError::user_facing(messages::update_motd_no_required_cmd(required)));
    }
    messaging::refresh_motd(ctx);
    writeln!(out, "{}", messages::REFRESH_MOTD_SUCCESS)?;
    Ok(())
}

/// Fetch the machine's contract, persist it, and apply entitlement changes
/// between the previous and the fetched document.
///
/// Newly entitled services are not enabled here; changes are resolved for
/// the running release. Per-service failures are logged and returned in the
/// deltas.
///
/// # Errors
///
/// - [`UaError::Unattached`] if there is no machine token.
/// - [`UaError::Url`] if the contract server call fails.
/// - [`UaError::Token`] if the token cannot be read or written.
pub fn request_updated_contract(ctx: &UaContext) -> Result<Vec<ServiceDelta>, UaError> {
    let previous = ctx.attached_document()?.ok_or(UaError::Unattached)?;
    let fetched = ctx
        .contract
        .get_contract_machine(&previous.machine_token, previous.contract_id())?;
    ctx.tokens.write(&fetched)?;
    info!(contract_id = fetched.contract_id(), "machine token updated");

    let release = match ctx.system.release_info() {
        Ok(release) => release,
        Err(err) => {
            warn!(err = %err, "cannot determine release, entitlement changes not applied");
            return Ok(Vec::new());
        },
    };
    let resolver = EntitlementDeltaResolver::new(ctx.entitlements.as_ref(), &release.series);
    let deltas = resolver.compute_and_apply(&previous.entitlements(), &fetched.entitlements(), false, true);
    info!(series = %release.series, changes = ?delta::changes(&deltas), "contract entitlement changes resolved");
    Ok(deltas)
}
