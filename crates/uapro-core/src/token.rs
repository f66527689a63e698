//! Machine token document and its persistence.
//!
//! The machine token is the server-issued description of the machine's
//! contract: the token used to authenticate, the contract id, the
//! `effectiveTo` expiry, and the resource entitlements. It is stored as JSON
//! and only ever rewritten as a whole.
//!
//! Fields this client does not interpret are carried through `extra` maps so
//! rewriting a document (for example after refetching `effectiveTo`) does
//! not drop server data.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fs_safe;

/// Errors from the token store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenStoreError {
    /// Reading or writing the token file failed.
    #[error("machine token I/O error on {path}: {source}")]
    Io {
        /// Token file path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The document could not be serialized.
    #[error("failed to serialize machine token: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The store refused the write.
    #[error("machine token store is read-only")]
    ReadOnly,
}

// ─────────────────────────────────────────────────────────────────────────────
// Entitlements
// ─────────────────────────────────────────────────────────────────────────────

/// Services this client knows how to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntitlementKind {
    /// Expanded security maintenance for main/restricted.
    EsmInfra,
    /// Expanded security maintenance for universe/multiverse.
    EsmApps,
    /// FIPS certified packages.
    Fips,
    /// FIPS packages with security updates.
    FipsUpdates,
    /// Real-time kernel.
    RealtimeKernel,
    /// Security compliance tooling.
    Usg,
    /// Kernel livepatching.
    Livepatch,
    /// Anything else the server sends.
    Other,
}

impl EntitlementKind {
    /// Map a wire service name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "esm-infra" => Self::EsmInfra,
            "esm-apps" => Self::EsmApps,
            "fips" => Self::Fips,
            "fips-updates" => Self::FipsUpdates,
            "realtime-kernel" => Self::RealtimeKernel,
            "usg" => Self::Usg,
            "livepatch" => Self::Livepatch,
            _ => Self::Other,
        }
    }

    /// Wire name of a known service.
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        match self {
            Self::EsmInfra => Some("esm-infra"),
            Self::EsmApps => Some("esm-apps"),
            Self::Fips => Some("fips"),
            Self::FipsUpdates => Some("fips-updates"),
            Self::RealtimeKernel => Some("realtime-kernel"),
            Self::Usg => Some("usg"),
            Self::Livepatch => Some("livepatch"),
            Self::Other => None,
        }
    }

    /// Delivered through an apt repository.
    #[must_use]
    pub const fn is_repository(self) -> bool {
        !matches!(self, Self::Livepatch | Self::Other)
    }

    /// Fragment identifying this service's apt pocket in `apt list` output.
    #[must_use]
    pub const fn pocket_marker(self) -> Option<&'static str> {
        match self {
            Self::EsmInfra => Some("-infra-"),
            Self::EsmApps => Some("-apps-"),
            _ => None,
        }
    }
}

impl fmt::Display for EntitlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().unwrap_or("other"))
    }
}

/// Selector of an override rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSelector {
    /// Release codename the override applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
}

/// Per-series adjustment of an entitlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRule {
    /// Which machines the rule applies to.
    #[serde(default)]
    pub selector: OverrideSelector,
    /// Directives merged over the base directives.
    #[serde(default)]
    pub directives: BTreeMap<String, String>,
    /// Replacement entitlement flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entitled: Option<bool>,
}

/// One service entitlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    /// Service name, e.g. `"esm-infra"`.
    #[serde(rename = "type")]
    pub service: String,
    /// Whether the contract grants the service.
    #[serde(default)]
    pub entitled: bool,
    /// Service configuration (repository URL, suites, key...).
    #[serde(default)]
    pub directives: BTreeMap<String, String>,
    /// Series-specific adjustments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<OverrideRule>,
    /// Fields not interpreted by this client (affordances, obligations...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl EntitlementRecord {
    /// A record without directives or overrides.
    #[must_use]
    pub fn new(service: impl Into<String>, entitled: bool) -> Self {
        Self {
            service: service.into(),
            entitled,
            directives: BTreeMap::new(),
            overrides: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Add a directive.
    #[must_use]
    pub fn with_directive(mut self, key: &str, value: &str) -> Self {
        self.directives.insert(key.to_string(), value.to_string());
        self
    }

    /// Add an override for `series`.
    #[must_use]
    pub fn with_override(mut self, series: &str, entitled: Option<bool>, directives: &[(&str, &str)]) -> Self {
        self.overrides.push(OverrideRule {
            selector: OverrideSelector {
                series: Some(series.to_string()),
            },
            directives: directives
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            entitled,
        });
        self
    }

    /// Known-service classification.
    #[must_use]
    pub fn kind(&self) -> EntitlementKind {
        EntitlementKind::from_name(&self.service)
    }

    /// The record as seen on `series`: every matching override is merged in
    /// declaration order and the override list is dropped.
    #[must_use]
    pub fn with_series_overrides(&self, series: &str) -> Self {
        let mut resolved = Self {
            service: self.service.clone(),
            entitled: self.entitled,
            directives: self.directives.clone(),
            overrides: Vec::new(),
            extra: self.extra.clone(),
        };
        for rule in self
            .overrides
            .iter()
            .filter(|r| r.selector.series.as_deref() == Some(series))
        {
            resolved
                .directives
                .extend(rule.directives.iter().map(|(k, v)| (k.clone(), v.clone())));
            if let Some(entitled) = rule.entitled {
                resolved.entitled = entitled;
            }
        }
        resolved
    }
}

/// Ordered snapshot of entitlements, unique by service name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitlementSet {
    records: Vec<EntitlementRecord>,
}

impl EntitlementSet {
    /// Build a set; a later record for an already present service replaces
    /// the earlier one in place.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = EntitlementRecord>) -> Self {
        let mut set = Self::default();
        for record in records {
            set.insert(record);
        }
        set
    }

    /// Insert or replace a record.
    pub fn insert(&mut self, record: EntitlementRecord) {
        if let Some(existing) = self.records.iter_mut().find(|r| r.service == record.service) {
            *existing = record;
        } else {
            self.records.push(record);
        }
    }

    /// Record for `service`.
    #[must_use]
    pub fn get(&self, service: &str) -> Option<&EntitlementRecord> {
        self.records.iter().find(|r| r.service == service)
    }

    /// Records in order.
    pub fn iter(&self) -> impl Iterator<Item = &EntitlementRecord> {
        self.records.iter()
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record resolved for `series`.
    #[must_use]
    pub fn for_series(&self, series: &str) -> Self {
        Self {
            records: self
                .records
                .iter()
                .map(|r| r.with_series_overrides(series))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a EntitlementSet {
    type Item = &'a EntitlementRecord;
    type IntoIter = std::slice::Iter<'a, EntitlementRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Document
// ─────────────────────────────────────────────────────────────────────────────

/// `machineTokenInfo.contractInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInfo {
    /// Contract id.
    pub id: String,
    /// Human-readable contract name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Contract expiry; absent for contracts that never expire.
    #[serde(default)]
    pub effective_to: Option<DateTime<Utc>>,
    /// Entitlements granted by the contract.
    #[serde(default)]
    pub resource_entitlements: Vec<EntitlementRecord>,
    /// Fields not interpreted by this client.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// `machineTokenInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTokenInfo {
    /// Machine id the contract server knows this machine by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Contract description.
    pub contract_info: ContractInfo,
    /// Fields not interpreted by this client.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The persisted machine token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDocument {
    /// Bearer token for contract-server requests.
    #[serde(default)]
    pub machine_token: String,
    /// Contract metadata.
    pub machine_token_info: MachineTokenInfo,
    /// Fields not interpreted by this client.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TokenDocument {
    /// A minimal document for `contract_id`.
    #[must_use]
    pub fn new(machine_token: impl Into<String>, contract_id: impl Into<String>) -> Self {
        Self {
            machine_token: machine_token.into(),
            machine_token_info: MachineTokenInfo {
                machine_id: None,
                contract_info: ContractInfo {
                    id: contract_id.into(),
                    name: None,
                    effective_to: None,
                    resource_entitlements: Vec::new(),
                    extra: BTreeMap::new(),
                },
                extra: BTreeMap::new(),
            },
            extra: BTreeMap::new(),
        }
    }

    /// Set the contract expiry.
    #[must_use]
    pub fn with_effective_to(mut self, effective_to: Option<DateTime<Utc>>) -> Self {
        self.machine_token_info.contract_info.effective_to = effective_to;
        self
    }

    /// Set the machine id.
    #[must_use]
    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_token_info.machine_id = Some(machine_id.into());
        self
    }

    /// Append an entitlement.
    #[must_use]
    pub fn with_entitlement(mut self, record: EntitlementRecord) -> Self {
        self.machine_token_info
            .contract_info
            .resource_entitlements
            .push(record);
        self
    }

    /// Contract id.
    #[must_use]
    pub fn contract_id(&self) -> &str {
        &self.machine_token_info.contract_info.id
    }

    /// Machine id, if the server recorded one.
    #[must_use]
    pub fn machine_id(&self) -> Option<&str> {
        self.machine_token_info.machine_id.as_deref()
    }

    /// Contract expiry.
    #[must_use]
    pub const fn effective_to(&self) -> Option<DateTime<Utc>> {
        self.machine_token_info.contract_info.effective_to
    }

    /// Replace the contract expiry.
    pub fn set_effective_to(&mut self, effective_to: Option<DateTime<Utc>>) {
        self.machine_token_info.contract_info.effective_to = effective_to;
    }

    /// Whether the document represents an attached machine.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.machine_token.is_empty()
    }

    /// Raw entitlements, overrides not applied.
    #[must_use]
    pub fn entitlements(&self) -> EntitlementSet {
        EntitlementSet::from_records(
            self.machine_token_info
                .contract_info
                .resource_entitlements
                .iter()
                .cloned(),
        )
    }

    /// Entitlements as they apply on `series`.
    #[must_use]
    pub fn entitlements_for_series(&self, series: &str) -> EntitlementSet {
        self.entitlements().for_series(series)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stores
// ─────────────────────────────────────────────────────────────────────────────

/// Persistence for the machine token.
pub trait TokenStore: Send + Sync {
    /// Current document. Missing or malformed content reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn read(&self) -> Result<Option<TokenDocument>, TokenStoreError>;

    /// Replace the document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be persisted.
    fn write(&self, document: &TokenDocument) -> Result<(), TokenStoreError>;
}

/// JSON file store, written with mode 0600.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Store at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Token file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn read(&self) -> Result<Option<TokenDocument>, TokenStoreError> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(TokenStoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            },
        };
        match serde_json::from_slice(&content) {
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                warn!(path = %self.path.display(), err = %e, "ignoring malformed machine token");
                Ok(None)
            },
        }
    }

    fn write(&self, document: &TokenDocument) -> Result<(), TokenStoreError> {
        let data = serde_json::to_vec_pretty(document)?;
        fs_safe::atomic_write(&self.path, &data, 0o600).map_err(|source| TokenStoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "wrote machine token");
        Ok(())
    }
}

/// In-memory store that counts writes.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    document: Mutex<Option<TokenDocument>>,
    writes: Mutex<usize>,
    read_only: Mutex<bool>,
}

impl MemoryTokenStore {
    /// Store holding `document`.
    #[must_use]
    pub fn new(document: Option<TokenDocument>) -> Self {
        Self {
            document: Mutex::new(document),
            ..Self::default()
        }
    }

    /// Current document, bypassing the trait.
    #[must_use]
    pub fn current(&self) -> Option<TokenDocument> {
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make further writes fail with [`TokenStoreError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        *self.read_only.lock().unwrap_or_else(PoisonError::into_inner) = read_only;
    }
}

impl TokenStore for MemoryTokenStore {
    fn read(&self) -> Result<Option<TokenDocument>, TokenStoreError> {
        Ok(self.current())
    }

    fn write(&self, document: &TokenDocument) -> Result<(), TokenStoreError> {
        if *self.read_only.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(TokenStoreError::ReadOnly);
        }
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = Some(document.clone());
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "machineToken": "tok",
        "availableResources": [{"name": "esm-infra"}],
        "machineTokenInfo": {
            "machineId": "m-1",
            "accountInfo": {"name": "acct"},
            "contractInfo": {
                "id": "cid",
                "name": "contract",
                "effectiveTo": "2026-12-31T00:00:00Z",
                "products": ["uai-essential-virtual"],
                "resourceEntitlements": [
                    {
                        "type": "esm-infra",
                        "entitled": true,
                        "directives": {"aptURL": "https://esm.example.com/infra", "suites": "jammy-infra-security"},
                        "affordances": {"series": ["jammy"]},
                        "overrides": [
                            {"selector": {"series": "focal"}, "directives": {"suites": "focal-infra-security"}}
                        ]
                    },
                    {"type": "livepatch", "entitled": false}
                ]
            }
        }
    }"#;

    #[test]
    fn test_parse_document() {
        let doc: TokenDocument = serde_json::from_str(SAMPLE).unwrap();
        assert!(doc.is_attached());
        assert_eq!(doc.contract_id(), "cid");
        assert_eq!(doc.machine_id(), Some("m-1"));
        assert_eq!(
            doc.effective_to().unwrap().to_rfc3339(),
            "2026-12-31T00:00:00+00:00"
        );

        let ents = doc.entitlements();
        assert_eq!(ents.len(), 2);
        assert_eq!(ents.get("esm-infra").unwrap().kind(), EntitlementKind::EsmInfra);
        assert_eq!(ents.get("livepatch").unwrap().kind(), EntitlementKind::Livepatch);
    }

    #[test]
    fn test_unknown_fields_survive_rewrite() {
        let doc: TokenDocument = serde_json::from_str(SAMPLE).unwrap();
        let rewritten: serde_json::Value = serde_json::to_value(&doc).unwrap();

        assert_eq!(rewritten["availableResources"][0]["name"], "esm-infra");
        assert_eq!(rewritten["machineTokenInfo"]["accountInfo"]["name"], "acct");
        assert_eq!(
            rewritten["machineTokenInfo"]["contractInfo"]["resourceEntitlements"][0]["affordances"]["series"][0],
            "jammy"
        );
        assert_eq!(
            rewritten["machineTokenInfo"]["contractInfo"]["products"][0],
            "uai-essential-virtual"
        );
    }

    #[test]
    fn test_series_overrides_merge_directives() {
        let doc: TokenDocument = serde_json::from_str(SAMPLE).unwrap();

        let focal = doc.entitlements_for_series("focal");
        let infra = focal.get("esm-infra").unwrap();
        assert_eq!(infra.directives["suites"], "focal-infra-security");
        assert_eq!(infra.directives["aptURL"], "https://esm.example.com/infra");
        assert!(infra.overrides.is_empty());

        let jammy = doc.entitlements_for_series("jammy");
        assert_eq!(jammy.get("esm-infra").unwrap().directives["suites"], "jammy-infra-security");
    }

    #[test]
    fn test_series_override_can_revoke_entitlement() {
        let record = EntitlementRecord::new("esm-apps", true).with_override("xenial", Some(false), &[]);
        assert!(!record.with_series_overrides("xenial").entitled);
        assert!(record.with_series_overrides("jammy").entitled);
    }

    #[test]
    fn test_entitlement_set_keeps_first_position_for_duplicates() {
        let set = EntitlementSet::from_records([
            EntitlementRecord::new("esm-infra", false),
            EntitlementRecord::new("esm-apps", true),
            EntitlementRecord::new("esm-infra", true),
        ]);
        let services: Vec<_> = set.iter().map(|r| r.service.as_str()).collect();
        assert_eq!(services, ["esm-infra", "esm-apps"]);
        assert!(set.get("esm-infra").unwrap().entitled);
    }

    #[test]
    fn test_file_store_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("private").join("machine-token.json"));
        assert!(store.read().unwrap().is_none());

        let doc = TokenDocument::new("tok", "cid").with_entitlement(EntitlementRecord::new("esm-apps", true));
        store.write(&doc).unwrap();
        assert_eq!(store.read().unwrap(), Some(doc));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn test_file_store_treats_malformed_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-token.json");
        std::fs::write(&path, "{\"machineToken\": ").unwrap();
        assert!(FileTokenStore::new(path).read().unwrap().is_none());
    }

    #[test]
    fn test_memory_store_counts_writes() {
        let store = MemoryTokenStore::new(None);
        store.write(&TokenDocument::new("tok", "cid")).unwrap();
        assert_eq!(store.write_count(), 1);

        store.set_read_only(true);
        assert!(matches!(
            store.write(&TokenDocument::new("tok", "cid")),
            Err(TokenStoreError::ReadOnly)
        ));
        assert_eq!(store.write_count(), 1);
    }
}
