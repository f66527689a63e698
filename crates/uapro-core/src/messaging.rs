//! MOTD contract-status message.
//!
//! Projects the contract expiry status onto a single message file
//! (`<data_dir>/messages/motd-contract-status`) that the login banner
//! scripts print verbatim:
//!
//! | status | file |
//! |---|---|
//! | none, active | removed |
//! | active, soon to expire | days left |
//! | grace period | expiry date, days since expiry, grace days left |
//! | expired | expired notice, with held-back updates of the base service |
//!
//! Before acting on an expired status the expiry is refetched from the
//! contract server, since the contract may have been renewed. A failed
//! refetch is logged and the local status is used.
//!
//! The file content is a pure function of the status, day counts, expiry
//! date and held-back update count, so repeated runs produce identical
//! bytes.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::UaContext;
use crate::contract::ContractError;
use crate::entitlements::ApplicationStatus;
use crate::expiry::{ContractExpiryStatus, ExpiryAssessment};
use crate::messages;
use crate::release;
use crate::system::SystemError;
use crate::token::{TokenDocument, TokenStoreError};

/// Errors that abort the projection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MessagingError {
    /// The machine token could not be read.
    #[error(transparent)]
    Token(#[from] TokenStoreError),

    /// The message file could not be written or removed.
    #[error(transparent)]
    System(#[from] SystemError),
}

/// Errors from refetching the contract expiry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExpiryRefetchError {
    /// The contract server call failed.
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// The updated token could not be persisted.
    #[error(transparent)]
    Token(#[from] TokenStoreError),
}

/// Updates of the base service held back by an expired contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldBack {
    /// Service name.
    pub service: String,
    /// Pending update count.
    pub count: u64,
}

/// Refetch `effectiveTo` from the contract server and persist it if it
/// changed.
///
/// Returns the document to use from here on: `document` itself when the
/// server reports no expiry or the same expiry, otherwise a copy carrying
/// the new expiry. Only `effectiveTo` is taken from the server response.
///
/// # Errors
///
/// Returns an error if the server call fails or the token cannot be
/// written.
pub fn update_contract_expiry(ctx: &UaContext, document: &TokenDocument) -> Result<TokenDocument, ExpiryRefetchError> {
    let fetched = ctx
        .contract
        .get_contract_machine(&document.machine_token, document.contract_id())?;

    match fetched.effective_to() {
        Some(effective_to) if Some(effective_to) != document.effective_to() => {
            let mut updated = document.clone();
            updated.set_effective_to(Some(effective_to));
            ctx.tokens.write(&updated)?;
            info!(
                previous = ?document.effective_to(),
                %effective_to,
                "contract expiry changed on server"
            );
            Ok(updated)
        },
        _ => {
            debug!("contract expiry unchanged on server");
            Ok(document.clone())
        },
    }
}

/// Text of the MOTD file at `now`, or `None` when no file should exist.
#[must_use]
pub fn contract_status_message(
    assessment: ExpiryAssessment,
    effective_to: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    held_back: Option<&HeldBack>,
) -> Option<String> {
    let body = match assessment.status {
        ContractExpiryStatus::None | ContractExpiryStatus::Active => return None,
        ContractExpiryStatus::ActiveExpiredSoon => messages::contract_expires_soon(assessment.days),
        ContractExpiryStatus::ExpiredGracePeriod => {
            let expired_on = effective_to.map_or_else(
                || "Unknown".to_string(),
                |at| at.format("%d %b %Y").to_string(),
            );
            let elapsed = effective_to.map_or(0, |at| (now - at).num_days());
            messages::contract_expired_grace_period(&expired_on, elapsed, assessment.days)
        },
        ContractExpiryStatus::Expired => match held_back {
            Some(held) if held.count > 0 => messages::contract_expired_with_pkgs(held.count, &held.service),
            _ => messages::CONTRACT_EXPIRED.to_string(),
        },
    };
    Some(format!("{body}\n\n"))
}

/// Regenerate the MOTD contract-status file.
///
/// Returns `false` without touching anything when the machine is not
/// attached.
///
/// # Errors
///
/// Returns an error if the token cannot be read or the message file cannot
/// be written or removed.
pub fn update_motd_messages(ctx: &UaContext) -> Result<bool, MessagingError> {
    let Some(mut document) = ctx.attached_document()? else {
        debug!("machine not attached, skipping MOTD messages");
        return Ok(false);
    };
    info!("updating MOTD contract-status message");

    let mut assessment = ctx.assess_expiry(&document);
    if assessment.status.needs_refetch() {
        match update_contract_expiry(ctx, &document) {
            Ok(updated) => {
                document = updated;
                assessment = ctx.assess_expiry(&document);
            },
            Err(err) => {
                warn!(status = %assessment.status, err = %err, "could not refetch contract expiry, using local status");
            },
        }
    }

    let held_back = if assessment.status == ContractExpiryStatus::Expired {
        held_back_updates(ctx)
    } else {
        None
    };

    let path = ctx.config.motd_message_path();
    match contract_status_message(assessment, document.effective_to(), ctx.now(), held_back.as_ref()) {
        Some(content) => {
            ctx.system.write_file(&path, content.as_bytes(), 0o644)?;
            debug!(path = %path.display(), status = %assessment.status, days = assessment.days, "wrote MOTD message");
        },
        None => {
            if ctx.system.remove_file_if_exists(&path)? {
                debug!(path = %path.display(), "removed MOTD message");
            }
        },
    }
    Ok(true)
}

/// Held-back updates for the release's base service. Lookup failures are
/// logged and reported as nothing held back.
fn held_back_updates(ctx: &UaContext) -> Option<HeldBack> {
    let release = ctx
        .system
        .release_info()
        .inspect_err(|err| warn!(err = %err, "cannot determine release for held-back updates"))
        .ok()?;
    let kind = release::base_service(&release.series, ctx.now().date_naive())?;
    let service = kind.name()?;

    let status = ctx
        .entitlements
        .status(service)
        .inspect_err(|err| warn!(service, err = %err, "cannot determine service status"))
        .ok()?;
    if status != ApplicationStatus::Enabled {
        return None;
    }
    let count = ctx
        .entitlements
        .pending_updates(service)
        .inspect_err(|err| warn!(service, err = %err, "cannot count pending updates"))
        .unwrap_or(0);
    Some(HeldBack {
        service: service.to_string(),
        count,
    })
}

/// Ask update-notifier to regenerate its package-update MOTD section.
///
/// The helper is optional; a missing helper is skipped and a failing one is
/// only logged.
pub fn refresh_motd(ctx: &UaContext) {
    let script = &ctx.config.motd.update_notifier_script;
    if !ctx.system.helper_present(script) {
        debug!(path = %script.display(), "update-notifier helper not installed");
        return;
    }
    let program = script.to_string_lossy();
    match ctx
        .system
        .run(&program, &["--force"])
        .and_then(|out| out.ensure_exit_in(&program, &[0]))
    {
        Ok(_) => debug!(path = %script.display(), "update-notifier MOTD refreshed"),
        Err(err) => warn!(path = %script.display(), err = %err, "update-notifier MOTD refresh failed"),
    }
}
