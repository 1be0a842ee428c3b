//! Mapping feed loader.
//!
//! The fleet configurator emits a YAML document keyed by identifier:
//!
//! ```yaml
//! 5f0c1a7e-9a4b-4c1e-8d2a-0b1c2d3e4f50:
//!   type: worker
//!   resource: koji-worker
//!   description: Build worker keytab
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::{CredentialType, ResourceMapping, validate_identifier, validate_resource_name};

#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(rename = "type")]
    credential_type: String,
    resource: String,
    #[serde(default)]
    description: Option<String>,
}

/// Read and validate the mapping feed at `path`.
pub fn load_mapping_feed(path: &Path) -> Result<Vec<ResourceMapping>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_mapping_feed(&content).map_err(|e| match e {
        ConfigError::Parse { message, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })
}

/// Parse a YAML mapping feed. Entries come back ordered by identifier.
pub fn parse_mapping_feed(yaml: &str) -> Result<Vec<ResourceMapping>, ConfigError> {
    let entries: Option<BTreeMap<String, FeedEntry>> =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: "<feed>".into(),
            message: e.to_string(),
        })?;

    entries
        .unwrap_or_default()
        .into_iter()
        .map(|(id, entry)| {
            let invalid = |e: crate::error::InvalidInput| ConfigError::Mapping {
                id: id.clone(),
                message: e.to_string(),
            };
            validate_identifier(&id).map_err(invalid)?;
            validate_resource_name(&entry.resource).map_err(invalid)?;
            let credential_type: CredentialType =
                entry.credential_type.parse().map_err(invalid)?;
            Ok(ResourceMapping {
                id,
                credential_type,
                canonical_name: entry.resource,
                description: entry.description.unwrap_or_default(),
            })
        })
        .collect()
}
