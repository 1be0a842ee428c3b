//! Domain types for the credential broker.
//!
//! A [`ResourceMapping`] names a credential by an opaque identifier. The
//! caller-specific instantiation of that credential is its concrete
//! resource name, and an active lease on it is a [`CheckoutRecord`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InvalidInput;

/// Opaque external identifier of a resource mapping.
pub type MappingId = String;

/// Container runtime identifier of a lease holder.
pub type ContainerId = String;

/// Longest identifier accepted from clients or the mapping feed.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Longest canonical resource name accepted from the mapping feed.
pub const MAX_RESOURCE_NAME_LEN: usize = 255;

// ── Credential type ───────────────────────────────────────────────

/// Category of artifact a mapping hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// Kerberos principal keytab.
    Principal,
    /// Keytab for a scaled build worker, one per scale index.
    Worker,
    /// TLS certificate signed by the service CA.
    Cert,
    /// Private key matching a `Cert` of the same name.
    Key,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Principal => "principal",
            Self::Worker => "worker",
            Self::Cert => "cert",
            Self::Key => "key",
        }
    }

    /// File extension of the artifact served for this type.
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Principal | Self::Worker => "keytab",
            Self::Cert => "crt",
            Self::Key => "key",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialType {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "principal" => Ok(Self::Principal),
            "worker" => Ok(Self::Worker),
            "cert" => Ok(Self::Cert),
            "key" => Ok(Self::Key),
            other => Err(InvalidInput::new(
                "type",
                other,
                "must be one of: principal, worker, cert, key",
            )),
        }
    }
}

// ── Mapping ───────────────────────────────────────────────────────

/// Identifier → credential binding loaded from the mapping feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceMapping {
    pub id: MappingId,
    pub credential_type: CredentialType,
    pub canonical_name: String,
    #[serde(default)]
    pub description: String,
}

impl ResourceMapping {
    /// Derive the caller-specific resource name.
    ///
    /// Worker mappings append `-<scale_index>` to the canonical name and
    /// yield `None` when the caller has no scale index. Every other type
    /// ignores the index.
    pub fn concrete_name(&self, scale_index: Option<u32>) -> Option<String> {
        match self.credential_type {
            CredentialType::Worker => {
                scale_index.map(|index| format!("{}-{index}", self.canonical_name))
            }
            _ => Some(self.canonical_name.clone()),
        }
    }
}

// ── Checkout ledger ───────────────────────────────────────────────

/// An active lease of a concrete resource by a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutRecord {
    pub mapping_id: MappingId,
    pub concrete_name: String,
    pub holder_container_id: ContainerId,
    pub holder_ip: String,
    /// Unix timestamp (seconds) of the claim.
    pub checked_out_at: u64,
    pub credential_type: CredentialType,
    pub scale_index: Option<u32>,
}

impl CheckoutRecord {
    /// Build the composite key for the checkout ledger.
    pub fn table_key(&self) -> String {
        ledger_key(&self.mapping_id, &self.concrete_name)
    }
}

/// Composite ledger key `{mapping_id}:{concrete_name}`.
///
/// Identifiers never contain `:`, so a `{mapping_id}:` prefix scan only
/// matches leases of that mapping.
pub fn ledger_key(mapping_id: &str, concrete_name: &str) -> String {
    format!("{mapping_id}:{concrete_name}")
}

// ── Containers ────────────────────────────────────────────────────

/// Read-only view of a runtime container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub status: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
    /// Network name → address on that network.
    pub networks: BTreeMap<String, String>,
    /// `KEY=VALUE` environment entries, when the backend reports them.
    #[serde(default)]
    pub env: Vec<String>,
}

impl ContainerInfo {
    /// Look up an environment variable by name.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

// ── Validation ────────────────────────────────────────────────────

/// Check an externally supplied resource identifier.
pub fn validate_identifier(id: &str) -> Result<(), InvalidInput> {
    if id.is_empty() {
        return Err(InvalidInput::new("id", id, "identifier is required"));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(InvalidInput::new(
            "id",
            id,
            format!("identifier too long (max {MAX_IDENTIFIER_LEN} characters)"),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(InvalidInput::new(
            "id",
            id,
            "identifier may only contain letters, digits, '-', '_' and '.'",
        ));
    }
    Ok(())
}

/// Check a canonical resource name from the mapping feed.
pub fn validate_resource_name(name: &str) -> Result<(), InvalidInput> {
    if name.is_empty() {
        return Err(InvalidInput::new("resource", name, "resource name is required"));
    }
    if name.len() > MAX_RESOURCE_NAME_LEN {
        return Err(InvalidInput::new(
            "resource",
            name,
            format!("resource name too long (max {MAX_RESOURCE_NAME_LEN} characters)"),
        ));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(InvalidInput::new(
            "resource",
            name,
            "resource name may not contain whitespace",
        ));
    }
    Ok(())
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(credential_type: CredentialType, name: &str) -> ResourceMapping {
        ResourceMapping {
            id: "m-1".to_string(),
            credential_type,
            canonical_name: name.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn worker_concrete_name_appends_scale_index() {
        let m = mapping(CredentialType::Worker, "koji-worker");
        assert_eq!(m.concrete_name(Some(3)).as_deref(), Some("koji-worker-3"));
        assert_eq!(m.concrete_name(Some(0)).as_deref(), Some("koji-worker-0"));
    }

    #[test]
    fn worker_concrete_name_requires_scale_index() {
        let m = mapping(CredentialType::Worker, "koji-worker");
        assert_eq!(m.concrete_name(None), None);
    }

    #[test]
    fn non_worker_concrete_name_ignores_scale_index() {
        let cert = mapping(CredentialType::Cert, "hub-cert");
        assert_eq!(cert.concrete_name(Some(3)).as_deref(), Some("hub-cert"));
        assert_eq!(cert.concrete_name(None).as_deref(), Some("hub-cert"));

        let principal = mapping(CredentialType::Principal, "kojiadmin@KOJI.BOX");
        assert_eq!(
            principal.concrete_name(Some(7)).as_deref(),
            Some("kojiadmin@KOJI.BOX")
        );
    }

    #[test]
    fn credential_type_parse_and_extension() {
        assert_eq!("worker".parse::<CredentialType>().unwrap(), CredentialType::Worker);
        assert_eq!(CredentialType::Principal.file_extension(), "keytab");
        assert_eq!(CredentialType::Cert.file_extension(), "crt");
        assert_eq!(CredentialType::Key.file_extension(), "key");
        let err = "keytab".parse::<CredentialType>().unwrap_err();
        assert_eq!(err.field, "type");
    }

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("5f0c1a7e-9a4b-4c1e-8d2a-0b1c2d3e4f50").is_ok());
        assert!(validate_identifier("hub_cert.v2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a:b").is_err());
        assert!(validate_identifier("../etc").is_err());
        assert!(validate_identifier(&"x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn env_var_lookup() {
        let info = ContainerInfo {
            env: vec!["PATH=/usr/bin".to_string(), "SCALE_INDEX=4".to_string()],
            ..Default::default()
        };
        assert_eq!(info.env_var("SCALE_INDEX"), Some("4"));
        assert_eq!(info.env_var("HOME"), None);
    }

    #[test]
    fn ledger_key_format() {
        assert_eq!(ledger_key("abc", "koji-worker-1"), "abc:koji-worker-1");
    }
}
