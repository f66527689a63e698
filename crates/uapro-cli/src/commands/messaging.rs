//! `uapro update-messaging`.

use tracing::{debug, error};
use uapro_core::UaContext;
use uapro_core::messaging::update_motd_messages;

use super::{exit_codes, fail};

/// Regenerate the MOTD contract-status file.
pub fn run(ctx: &UaContext) -> u8 {
    match update_motd_messages(ctx) {
        Ok(updated) => {
            debug!(updated, "MOTD messages processed");
            exit_codes::SUCCESS
        },
        Err(err) => {
            error!(err = %err, "failed to update MOTD messages");
            fail(&err)
        },
    }
}
