//! Operation context.
//!
//! One [`UaContext`] is built per CLI invocation and passed by reference to
//! every operation. It owns the configuration and the collaborators; nothing
//! in the crate reaches for global state.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::UaConfig;
use crate::contract::ContractClient;
use crate::entitlements::EntitlementBackend;
use crate::expiry::ExpiryAssessment;
use crate::lock::LockManager;
use crate::system::SystemFacade;
use crate::token::{TokenDocument, TokenStore, TokenStoreError};

/// Configuration plus collaborators for one invocation.
pub struct UaContext {
    /// Active configuration.
    pub config: UaConfig,
    /// File `refresh config` reloads; `None` keeps the in-memory
    /// configuration.
    pub config_path: Option<PathBuf>,
    /// Host interaction.
    pub system: Arc<dyn SystemFacade>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Machine token persistence.
    pub tokens: Arc<dyn TokenStore>,
    /// Contract server.
    pub contract: Arc<dyn ContractClient>,
    /// Service operations.
    pub entitlements: Arc<dyn EntitlementBackend>,
}

impl fmt::Debug for UaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UaContext")
            .field("config", &self.config)
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl UaContext {
    /// Build a context.
    #[must_use]
    pub fn new(
        config: UaConfig,
        system: Arc<dyn SystemFacade>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenStore>,
        contract: Arc<dyn ContractClient>,
        entitlements: Arc<dyn EntitlementBackend>,
    ) -> Self {
        Self {
            config,
            config_path: None,
            system,
            clock,
            tokens,
            contract,
            entitlements,
        }
    }

    /// Reload configuration from `path` on `refresh config`.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// The machine token of an attached machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the token store cannot be read.
    pub fn attached_document(&self) -> Result<Option<TokenDocument>, TokenStoreError> {
        Ok(self.tokens.read()?.filter(TokenDocument::is_attached))
    }

    /// Whether the machine is attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the token store cannot be read.
    pub fn is_attached(&self) -> Result<bool, TokenStoreError> {
        Ok(self.attached_document()?.is_some())
    }

    /// Host lock for this data directory.
    #[must_use]
    pub fn lock_manager(&self) -> LockManager {
        LockManager::new(self.config.lock_path())
    }

    /// Current time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Expiry of `document` at the current time.
    #[must_use]
    pub fn assess_expiry(&self, document: &TokenDocument) -> ExpiryAssessment {
        self.config
            .contract_expiry
            .policy()
            .resolve(document.effective_to(), self.now())
    }
}
