//! `uapro refresh`.

use std::io;

use tracing::error;
use uapro_core::{RefreshTarget, UaContext, refresh};

use super::{exit_codes, fail};

/// Run `refresh` and print its progress to stdout.
pub fn run(ctx: &mut UaContext, target: Option<RefreshTarget>) -> u8 {
    let mut stdout = io::stdout().lock();
    match refresh(ctx, target, &mut stdout) {
        Ok(code) => u8::try_from(code).unwrap_or(exit_codes::ERROR),
        Err(err) => {
            error!(err = %err, "refresh failed");
            fail(&err)
        },
    }
}
