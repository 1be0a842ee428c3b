//! Kerberos administration through the `kadmin` client.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use orch_core::config::KerberosConfig;

use crate::command::{CommandOutput, run_bounded};
use crate::error::{AuthorityError, AuthorityResult};

/// Marker kadmin prints when `getprinc` misses.
const PRINCIPAL_MISSING: &str = "Principal does not exist";

/// Principal lifecycle operations against a Kerberos realm.
#[async_trait]
pub trait CredentialAuthority: Send + Sync {
    /// Realm appended to unqualified principal names.
    fn realm(&self) -> &str;

    async fn principal_exists(&self, principal: &str) -> AuthorityResult<bool>;

    /// Create `principal` with a random key.
    async fn create_principal(&self, principal: &str) -> AuthorityResult<()>;

    /// Write the keys of `principal` to a keytab at `path`.
    async fn export_keytab(&self, principal: &str, path: &Path) -> AuthorityResult<()>;
}

pub struct KadminAuthority {
    bin: PathBuf,
    admin_principal: String,
    admin_password: String,
    realm: String,
    timeout: Duration,
}

impl KadminAuthority {
    pub fn new(config: &KerberosConfig) -> Self {
        Self {
            bin: config.kadmin_bin.clone(),
            admin_principal: config.admin_principal.clone(),
            admin_password: config.admin_password.clone(),
            realm: config.realm.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn query(&self, query: &str) -> AuthorityResult<(String, CommandOutput)> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p")
            .arg(&self.admin_principal)
            .arg("-w")
            .arg(&self.admin_password)
            .arg("-q")
            .arg(query);
        let display = format!(
            "{} -p {} -w *** -q \"{query}\"",
            self.bin.display(),
            self.admin_principal
        );
        let output = run_bounded(cmd, &display, self.timeout).await?;
        Ok((display, output))
    }
}

#[async_trait]
impl CredentialAuthority for KadminAuthority {
    fn realm(&self) -> &str {
        &self.realm
    }

    async fn principal_exists(&self, principal: &str) -> AuthorityResult<bool> {
        let (display, output) = self.query(&format!("getprinc {principal}")).await?;
        if output.stderr.contains(PRINCIPAL_MISSING) {
            debug!(%principal, "principal absent");
            return Ok(false);
        }
        output.check(&display)?;
        Ok(true)
    }

    async fn create_principal(&self, principal: &str) -> AuthorityResult<()> {
        let (display, output) = self.query(&format!("addprinc -randkey {principal}")).await?;
        output.check(&display)?;
        info!(%principal, "created kerberos principal");
        Ok(())
    }

    async fn export_keytab(&self, principal: &str, path: &Path) -> AuthorityResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(AuthorityError::io(parent))?;
        }
        let (display, output) = self
            .query(&format!("ktadd -k {} {principal}", path.display()))
            .await?;
        output.check(&display)?;
        if !path.is_file() {
            return Err(AuthorityError::Command {
                command: display,
                status: "0".to_string(),
                stderr: format!("no keytab written to {}", path.display()),
            });
        }
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
            .map_err(AuthorityError::io(path))?;
        info!(%principal, path = %path.display(), "exported keytab");
        Ok(())
    }
}
