//! Subcommand implementations.
//!
//! Each command returns its process exit code.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use uapro_core::{
    AptEntitlementBackend, ContractClient, ContractError, FileTokenStore, HostSystem,
    HttpContractClient, SystemClock, TokenDocument, TokenStore, UaConfig, UaContext,
};

pub mod messaging;
pub mod refresh;
pub mod status;
pub mod upgrade;

/// Exit codes shared by all subcommands.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// General error exit code.
    pub const ERROR: u8 = 1;
}

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Wire the production collaborators.
pub fn build_context(config: UaConfig, config_path: &Path) -> UaContext {
    let system = Arc::new(HostSystem::new());
    let tokens = Arc::new(FileTokenStore::new(config.token_path()));
    let stored = tokens.read().ok().flatten();
    let contract = contract_client(&config, stored.as_ref());
    let entitlements = Arc::new(AptEntitlementBackend::new(system.clone(), config.apt.sources_dir.clone()));

    UaContext::new(
        config,
        system,
        Arc::new(SystemClock),
        tokens,
        contract,
        entitlements,
    )
    .with_config_path(config_path)
}

fn contract_client(config: &UaConfig, stored: Option<&TokenDocument>) -> Arc<dyn ContractClient> {
    let machine_id = stored
        .and_then(TokenDocument::machine_id)
        .map(str::to_string)
        .or_else(|| {
            fs::read_to_string(MACHINE_ID_PATH)
                .ok()
                .map(|id| id.trim().to_string())
        })
        .unwrap_or_default();

    match HttpContractClient::new(config.client.contract_url.clone(), machine_id) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            debug!(err = %err, "contract client unavailable");
            Arc::new(UnavailableContract(err))
        },
    }
}

/// Stands in when the HTTP client cannot be built; every call fails with
/// the construction error.
struct UnavailableContract(ContractError);

impl ContractClient for UnavailableContract {
    fn get_contract_machine(&self, _machine_token: &str, _contract_id: &str) -> Result<TokenDocument, ContractError> {
        Err(self.0.clone())
    }
}

/// Print `err` to stderr and return the error exit code.
pub fn fail(err: &dyn std::fmt::Display) -> u8 {
    eprintln!("{err}");
    exit_codes::ERROR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_contract_returns_construction_error() {
        let err = ContractError::InvalidInput {
            field: "machine_id".to_string(),
            reason: "must not be empty".to_string(),
        };
        let client = UnavailableContract(err.clone());
        assert_eq!(client.get_contract_machine("tok", "cid").unwrap_err().to_string(), err.to_string());
    }

    #[test]
    fn test_build_context_uses_config_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = UaConfig::default();
        config.client.data_dir = dir.path().to_path_buf();
        let ctx = build_context(config, Path::new("/etc/uapro/uapro.toml"));
        assert_eq!(ctx.config_path.as_deref(), Some(Path::new("/etc/uapro/uapro.toml")));
        assert!(!ctx.is_attached().unwrap());
    }
}
