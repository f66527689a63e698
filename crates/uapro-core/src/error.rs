//! User-facing failures.
//!
//! Module errors are converted into [`UaError`] at the operation boundary.
//! The CLI prints the `Display` text verbatim and exits with status 1.

use std::io;

use thiserror::Error;

use crate::contract::ContractError;
use crate::lock::LockError;
use crate::messages;
use crate::token::TokenStoreError;

/// Failure of a top-level operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UaError {
    /// The operation needs root.
    #[error("{}", messages::NONROOT_USER)]
    NonRootUser,

    /// The operation needs an attached machine.
    #[error("{}", messages::UNATTACHED)]
    Unattached,

    /// Another operation holds the host lock.
    #[error("{msg}")]
    LockHeld {
        /// Message naming the holder.
        msg: String,
    },

    /// A failure with a fixed message; details were logged.
    #[error("{msg}")]
    UserFacing {
        /// Message shown to the user.
        msg: String,
    },

    /// Contract server failure surfaced as-is.
    #[error(transparent)]
    Url(#[from] ContractError),

    /// Host lock I/O failure.
    #[error(transparent)]
    Lock(LockError),

    /// Machine token could not be read or written.
    #[error(transparent)]
    Token(#[from] TokenStoreError),

    /// Writing operation output failed.
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl UaError {
    /// Wrap a fixed user-facing message.
    #[must_use]
    pub fn user_facing(msg: impl Into<String>) -> Self {
        Self::UserFacing { msg: msg.into() }
    }
}

impl From<LockError> for UaError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { msg, .. } => Self::LockHeld { msg },
            other => Self::Lock(other),
        }
    }
}
