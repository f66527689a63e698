//! `uapro upgrade-lts-contract`.

use std::io;

use tracing::{error, warn};
use uapro_core::upgrade::remove_private_esm_apt_cache;
use uapro_core::{LockError, UaContext, UpgradeError, process_contract_delta_after_apt_lock};

use super::{exit_codes, fail};

/// Migrate entitlements after a release upgrade, then drop the private ESM
/// apt cache.
pub fn run(ctx: &UaContext) -> u8 {
    let mut stdout = io::stdout().lock();
    match process_contract_delta_after_apt_lock(ctx, &mut stdout) {
        Ok(_) => {},
        // Already printed to stdout.
        Err(UpgradeError::UnknownRelease { .. }) => return exit_codes::ERROR,
        Err(UpgradeError::Lock(LockError::Held { msg, .. })) => return fail(&msg),
        Err(err) => {
            error!(err = %err, "upgrade-lts-contract failed");
            return fail(&err);
        },
    }
    if let Err(err) = remove_private_esm_apt_cache(ctx) {
        warn!(err = %err, "failed to remove private ESM apt cache");
    }
    exit_codes::SUCCESS
}
