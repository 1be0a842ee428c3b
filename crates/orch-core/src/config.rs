//! orch.toml configuration parser.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub kerberos: KerberosConfig,
    pub hosts: HostsConfig,
    pub certificates: CertificateConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the database and every credential artifact.
    pub data_dir: PathBuf,
    /// YAML mapping feed loaded at startup.
    pub mapping_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/mnt/data"),
            mapping_file: PathBuf::from("/app/resource_mapping.yaml"),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("orch.redb")
    }

    pub fn keytabs_dir(&self) -> PathBuf {
        self.data_dir.join("keytabs")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.data_dir.join("ca")
    }
}

/// Which container engine backs identity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeBackend {
    Docker,
    Podman,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: RuntimeBackend,
    /// Engine API socket (Docker backend).
    pub socket: PathBuf,
    /// CLI binary (Podman backend).
    pub podman_bin: PathBuf,
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::Docker,
            socket: PathBuf::from("/var/run/docker.sock"),
            podman_bin: PathBuf::from("podman"),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KerberosConfig {
    pub realm: String,
    pub kadmin_bin: PathBuf,
    pub admin_principal: String,
    pub admin_password: String,
    pub timeout_secs: u64,
}

impl Default for KerberosConfig {
    fn default() -> Self {
        Self {
            realm: "KOJI.BOX".to_string(),
            kadmin_bin: PathBuf::from("kadmin"),
            admin_principal: "admin/admin@KOJI.BOX".to_string(),
            admin_password: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    /// Script that registers a worker with the build coordinator.
    pub script: PathBuf,
    pub arch: Option<String>,
    pub timeout_secs: u64,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("/app/manage-koji-host.sh"),
            arch: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
    pub root_common_name: String,
    pub root_email: String,
    /// Validity of issued leaf certificates.
    pub leaf_days: u32,
    /// Validity of the root certificate.
    pub root_days: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            country: "US".to_string(),
            state: "NC".to_string(),
            locality: "Raleigh".to_string(),
            organization: "Koji Box".to_string(),
            organizational_unit: "Certificate Authority".to_string(),
            root_common_name: "koji-box-ca".to_string(),
            root_email: "admin@koji.box".to_string(),
            leaf_days: 365,
            root_days: 3650,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl OrchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Overlay values that are usually injected through the environment.
    ///
    /// `KRB5_REALM`, `KADMIN_PRINC` and `KADMIN_PASS` win over the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(realm) = lookup("KRB5_REALM") {
            self.kerberos.realm = realm;
        }
        if let Some(principal) = lookup("KADMIN_PRINC") {
            self.kerberos.admin_principal = principal;
        }
        if let Some(password) = lookup("KADMIN_PASS") {
            self.kerberos.admin_password = password;
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: OrchConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.listen.port(), 5000);
        assert_eq!(config.runtime.backend, RuntimeBackend::Docker);
        assert_eq!(config.certificates.leaf_days, 365);
        assert_eq!(config.sweep.interval_secs, 60);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[storage]
data_dir = "/srv/orch"

[runtime]
backend = "podman"

[certificates]
organization = "Example"
leaf_days = 30
"#;
        let config: OrchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.db_path(), PathBuf::from("/srv/orch/orch.redb"));
        assert_eq!(config.storage.ca_dir(), PathBuf::from("/srv/orch/ca"));
        assert_eq!(config.runtime.backend, RuntimeBackend::Podman);
        assert_eq!(config.certificates.organization, "Example");
        assert_eq!(config.certificates.leaf_days, 30);
        assert_eq!(config.certificates.root_days, 3650);
    }

    #[test]
    fn env_overrides_kerberos_secrets() {
        let mut config = OrchConfig::default();
        config.apply_env(|key| match key {
            "KADMIN_PASS" => Some("s3cret".to_string()),
            "KRB5_REALM" => Some("EXAMPLE.ORG".to_string()),
            _ => None,
        });
        assert_eq!(config.kerberos.admin_password, "s3cret");
        assert_eq!(config.kerberos.realm, "EXAMPLE.ORG");
        assert_eq!(config.kerberos.admin_principal, "admin/admin@KOJI.BOX");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = OrchConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("[kerberos]"));
        let parsed: OrchConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.kerberos.realm, "KOJI.BOX");
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = OrchConfig::from_file(Path::new("/nonexistent/orch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
