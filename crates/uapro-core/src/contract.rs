//! Contract server client.
//!
//! The only call the reconciliation flows make is "give me this machine's
//! current view of its contract", which returns a full [`TokenDocument`].

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::token::TokenDocument;

/// Errors from the contract server.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ContractError {
    /// The request did not reach the server or the connection failed.
    #[error("contract server unreachable: {message}")]
    Transport {
        /// Underlying error text.
        message: String,
    },

    /// The server answered with a non-success status.
    #[error("contract server returned HTTP {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The response body is not a valid contract document.
    #[error("invalid contract server response: {message}")]
    Decode {
        /// Parse error text.
        message: String,
    },

    /// The request could not be built.
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        /// Offending input.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Contract server collaborator.
pub trait ContractClient: Send + Sync {
    /// Fetch the server's current machine-token document for this machine.
    ///
    /// # Errors
    ///
    /// Returns a [`ContractError`] if the server cannot be reached, rejects
    /// the request, or answers with an invalid document.
    fn get_contract_machine(&self, machine_token: &str, contract_id: &str) -> Result<TokenDocument, ContractError>;
}

/// Production client using a blocking `reqwest` client.
#[derive(Debug)]
pub struct HttpContractClient {
    base_url: String,
    machine_id: String,
    http_client: reqwest::blocking::Client,
}

impl HttpContractClient {
    /// Client for the server at `base_url`, identifying as `machine_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::InvalidInput`] for an empty URL or machine
    /// id, or [`ContractError::Transport`] if the HTTP client cannot be
    /// initialized.
    pub fn new(base_url: impl Into<String>, machine_id: impl Into<String>) -> Result<Self, ContractError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(ContractError::InvalidInput {
                field: "contract_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let machine_id = machine_id.into();
        if machine_id.trim().is_empty() {
            return Err(ContractError::InvalidInput {
                field: "machine_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let http_client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("uapro/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| ContractError::Transport {
                message: error.to_string(),
            })?;

        Ok(Self {
            base_url,
            machine_id: machine_id.trim().to_string(),
            http_client,
        })
    }

    fn endpoint(&self, contract_id: &str) -> String {
        format!(
            "{}/v1/contracts/{}/context/machines/{}",
            self.base_url.trim_end_matches('/'),
            contract_id,
            self.machine_id
        )
    }
}

impl ContractClient for HttpContractClient {
    fn get_contract_machine(&self, machine_token: &str, contract_id: &str) -> Result<TokenDocument, ContractError> {
        if contract_id.trim().is_empty() {
            return Err(ContractError::InvalidInput {
                field: "contract_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let endpoint = self.endpoint(contract_id);
        debug!(%endpoint, "fetching contract machine document");

        let response = self
            .http_client
            .get(&endpoint)
            .header("Accept", "application/json")
            .bearer_auth(machine_token)
            .send()
            .map_err(|error| ContractError::Transport {
                message: error.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(ContractError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let mut document: TokenDocument = response.json().map_err(|error| ContractError::Decode {
            message: error.to_string(),
        })?;
        if document.machine_token.is_empty() {
            document.machine_token = machine_token.to_string();
        }
        Ok(document)
    }
}

/// Scripted client for tests.
///
/// Responses are returned in the order they were queued; with the queue
/// empty every call fails with a transport error.
#[derive(Debug, Default)]
pub struct MockContractClient {
    responses: Mutex<VecDeque<Result<TokenDocument, ContractError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockContractClient {
    /// Client with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn push_response(&self, document: TokenDocument) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(document));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: ContractError) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    /// `(machine_token, contract_id)` of every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ContractClient for MockContractClient {
    fn get_contract_machine(&self, machine_token: &str, contract_id: &str) -> Result<TokenDocument, ContractError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((machine_token.to_string(), contract_id.to_string()));
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(ContractError::Transport {
                    message: "no response queued".to_string(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_client_rejects_empty_inputs() {
        assert!(matches!(
            HttpContractClient::new("", "m-1"),
            Err(ContractError::InvalidInput { field, .. }) if field == "contract_url"
        ));
        assert!(matches!(
            HttpContractClient::new("https://contracts.example.com", " "),
            Err(ContractError::InvalidInput { field, .. }) if field == "machine_id"
        ));
    }

    #[test]
    fn test_http_client_endpoint() {
        let client = HttpContractClient::new("https://contracts.example.com/", "m-1").unwrap();
        assert_eq!(
            client.endpoint("cid"),
            "https://contracts.example.com/v1/contracts/cid/context/machines/m-1"
        );
    }

    #[test]
    fn test_mock_client_replays_queue_and_records_calls() {
        let client = MockContractClient::new();
        client.push_response(TokenDocument::new("tok", "cid"));
        client.push_error(ContractError::Http {
            status: 503,
            message: "maintenance".to_string(),
        });

        assert_eq!(client.get_contract_machine("tok", "cid").unwrap().contract_id(), "cid");
        assert!(matches!(
            client.get_contract_machine("tok", "cid"),
            Err(ContractError::Http { status: 503, .. })
        ));
        assert!(matches!(
            client.get_contract_machine("tok", "cid"),
            Err(ContractError::Transport { .. })
        ));
        assert_eq!(client.calls().len(), 3);
        assert_eq!(client.calls()[0], ("tok".to_string(), "cid".to_string()));
    }
}
