//! Shared harness for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use uapro_core::{
    ManualClock, MemoryEntitlementBackend, MemoryTokenStore, MockContractClient, RecordingSystem,
    TokenDocument, UaConfig, UaContext,
};

pub const NOW: &str = "2026-10-17T12:00:00Z";

pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(NOW).unwrap().with_timezone(&Utc)
}

/// In-memory collaborators around a temporary data directory.
pub struct Harness {
    pub dir: TempDir,
    pub system: Arc<RecordingSystem>,
    pub clock: Arc<ManualClock>,
    pub tokens: Arc<MemoryTokenStore>,
    pub contract: Arc<MockContractClient>,
    pub backend: Arc<MemoryEntitlementBackend>,
}

impl Harness {
    pub fn new(series: &str, version_id: &str, token: Option<TokenDocument>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            system: Arc::new(RecordingSystem::new().with_release(series, version_id)),
            clock: Arc::new(ManualClock::new(now())),
            tokens: Arc::new(MemoryTokenStore::new(token)),
            contract: Arc::new(MockContractClient::new()),
            backend: Arc::new(MemoryEntitlementBackend::new()),
        }
    }

    pub fn jammy(token: Option<TokenDocument>) -> Self {
        Self::new("jammy", "22.04", token)
    }

    pub fn config(&self) -> UaConfig {
        let mut config = UaConfig::default();
        config.client.data_dir = self.dir.path().to_path_buf();
        config
    }

    pub fn context(&self) -> UaContext {
        self.context_with(self.config())
    }

    pub fn context_with(&self, config: UaConfig) -> UaContext {
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
