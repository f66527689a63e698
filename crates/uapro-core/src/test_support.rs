//! Fully in-memory [`UaContext`] for unit tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::clock::ManualClock;
use crate::config::UaConfig;
use crate::context::UaContext;
use crate::contract::MockContractClient;
use crate::entitlements::MemoryEntitlementBackend;
use crate::system::RecordingSystem;
use crate::token::{MemoryTokenStore, TokenDocument};

pub(crate) const NOW: &str = "2026-10-17T12:00:00Z";

pub(crate) fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// Fakes behind a test context. The data directory is a real temporary
/// directory because the host lock lives on disk.
pub(crate) struct TestHost {
    pub dir: TempDir,
    pub system: Arc<RecordingSystem>,
    pub clock: Arc<ManualClock>,
    pub tokens: Arc<MemoryTokenStore>,
    pub contract: Arc<MockContractClient>,
    pub backend: Arc<MemoryEntitlementBackend>,
}

impl TestHost {
    /// Unattached jammy machine at [`NOW`].
    pub fn new() -> Self {
        Self::with_token(None)
    }

    /// Attached jammy machine.
    pub fn attached(document: TokenDocument) -> Self {
        Self::with_token(Some(document))
    }

    fn with_token(document: Option<TokenDocument>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            system: Arc::new(RecordingSystem::new().with_release("jammy", "22.04")),
            clock: Arc::new(ManualClock::new(ts(NOW))),
            tokens: Arc::new(MemoryTokenStore::new(document)),
            contract: Arc::new(MockContractClient::new()),
            backend: Arc::new(MemoryEntitlementBackend::new()),
        }
    }

    pub fn context(&self) -> UaContext {
        let mut config = UaConfig::default();
        config.client.data_dir = self.dir.path().to_path_buf();
        UaContext::new(
            config,
            self.system.clone(),
            self.clock.clone(),
            self.tokens.clone(),
            self.contract.clone(),
            self.backend.clone(),
        )
    }
}
