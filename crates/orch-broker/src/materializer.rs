//! Credential materialization.
//!
//! Artifacts are cached on disk: a second request for the same name returns
//! the existing file without touching the issuing authority. Requests for
//! the same artifact are serialized so two callers never race an issuance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use orch_authority::{
    AuthorityResult, CredentialAuthority, HostRegistrar, SigningAuthority, encode_file_stem,
    normalize_principal, worker_principal,
};
use orch_core::CredentialType;

use crate::error::{BrokerError, BrokerResult};

pub struct CredentialMaterializer {
    kerberos: Arc<dyn CredentialAuthority>,
    hosts: Arc<dyn HostRegistrar>,
    signing: Arc<dyn SigningAuthority>,
    keytabs_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialMaterializer {
    pub fn new(
        kerberos: Arc<dyn CredentialAuthority>,
        hosts: Arc<dyn HostRegistrar>,
        signing: Arc<dyn SigningAuthority>,
        keytabs_dir: PathBuf,
    ) -> Self {
        Self {
            kerberos,
            hosts,
            signing,
            keytabs_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn signing(&self) -> &Arc<dyn SigningAuthority> {
        &self.signing
    }

    /// Ensure the credential exists and return the path of the artifact.
    pub async fn materialize(
        &self,
        credential_type: CredentialType,
        concrete_name: &str,
    ) -> BrokerResult<PathBuf> {
        let lock_key = match credential_type {
            CredentialType::Principal | CredentialType::Worker => {
                format!("keytab:{}", self.principal_for(credential_type, concrete_name))
            }
            CredentialType::Cert | CredentialType::Key => format!("tls:{concrete_name}"),
        };
        let lock = self.lock_for(&lock_key);
        let _guard = lock.lock().await;

        let result = match credential_type {
            CredentialType::Principal => self.keytab(credential_type, concrete_name).await,
            CredentialType::Worker => self.worker_keytab(concrete_name).await,
            CredentialType::Cert => self.signing.issue(concrete_name).await.map(|i| i.cert_path),
            CredentialType::Key => self.signing.issue(concrete_name).await.map(|i| i.key_path),
        };
        result.map_err(|e| BrokerError::CreationFailed {
            credential_type,
            name: concrete_name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Keytab location for a principal or worker name.
    pub fn keytab_path(&self, credential_type: CredentialType, concrete_name: &str) -> PathBuf {
        let principal = self.principal_for(credential_type, concrete_name);
        self.keytabs_dir
            .join(format!("{}.keytab", encode_file_stem(&principal)))
    }

    fn principal_for(&self, credential_type: CredentialType, concrete_name: &str) -> String {
        let realm = self.kerberos.realm();
        match credential_type {
            CredentialType::Worker => worker_principal(concrete_name, realm),
            _ => normalize_principal(concrete_name, realm),
        }
    }

    async fn keytab(
        &self,
        credential_type: CredentialType,
        concrete_name: &str,
    ) -> AuthorityResult<PathBuf> {
        let principal = self.principal_for(credential_type, concrete_name);
        let path = self.keytab_path(credential_type, concrete_name);
        if path.is_file() {
            debug!(%principal, path = %path.display(), "keytab already exported");
            return Ok(path);
        }
        if !self.kerberos.principal_exists(&principal).await? {
            self.kerberos.create_principal(&principal).await?;
        }
        self.kerberos.export_keytab(&principal, &path).await?;
        info!(%principal, path = %path.display(), "keytab materialized");
        Ok(path)
    }

    async fn worker_keytab(&self, concrete_name: &str) -> AuthorityResult<PathBuf> {
        let path = self.keytab(CredentialType::Worker, concrete_name).await?;
        let principal = self.principal_for(CredentialType::Worker, concrete_name);
        self.hosts.register(concrete_name, &principal).await?;
        Ok(path)
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn principal_keytab_is_created_once() {
        let fx = Fixture::new();
        let m = fx.materializer();

        let first = m
            .materialize(CredentialType::Principal, "kojiadmin")
            .await
            .unwrap();
        let second = m
            .materialize(CredentialType::Principal, "kojiadmin")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, fx.dir.path().join("keytabs/kojiadmin%40KOJI.BOX.keytab"));
        assert_eq!(fx.kerberos.created(), vec!["kojiadmin@KOJI.BOX".to_string()]);
        assert_eq!(fx.kerberos.exports(), 1);
    }

    #[tokio::test]
    async fn existing_principal_is_not_recreated() {
        let fx = Fixture::new();
        fx.kerberos.preexisting("HTTP/koji-hub@KOJI.BOX");

        fx.materializer()
            .materialize(CredentialType::Principal, "HTTP/koji-hub")
            .await
            .unwrap();
        assert!(fx.kerberos.created().is_empty());
        assert_eq!(fx.kerberos.exports(), 1);
    }

    #[tokio::test]
    async fn worker_keytab_registers_host() {
        let fx = Fixture::new();
        let path = fx
            .materializer()
            .materialize(CredentialType::Worker, "koji-worker-3")
            .await
            .unwrap();

        assert_eq!(
            path,
            fx.dir.path().join("keytabs/worker%2Fkoji-worker-3%40KOJI.BOX.keytab")
        );
        assert_eq!(
            fx.hosts.registered(),
            vec![(
                "koji-worker-3".to_string(),
                "worker/koji-worker-3@KOJI.BOX".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn host_registration_failure_fails_materialization() {
        let fx = Fixture::new();
        fx.hosts.fail(true);
        let err = fx
            .materializer()
            .materialize(CredentialType::Worker, "koji-worker-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::CreationFailed { credential_type: CredentialType::Worker, .. }
        ));
    }

    #[tokio::test]
    async fn cert_and_key_share_one_signing() {
        let fx = Fixture::new();
        let m = fx.materializer();

        let cert = m.materialize(CredentialType::Cert, "koji-hub").await.unwrap();
        let key = m.materialize(CredentialType::Key, "koji-hub").await.unwrap();
        let again = m.materialize(CredentialType::Cert, "koji-hub").await.unwrap();

        assert_eq!(cert, again);
        assert!(cert.ends_with("koji-hub.crt"));
        assert!(key.ends_with("koji-hub.key"));
        assert_eq!(fx.signing.signed(), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_issue_once() {
        let fx = Fixture::new();
        let m = Arc::new(fx.materializer());

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let m = m.clone();
                tokio::spawn(async move { m.materialize(CredentialType::Principal, "svc").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(fx.kerberos.exports(), 1);
    }

    #[tokio::test]
    async fn authority_failure_is_creation_failed() {
        let fx = Fixture::new();
        fx.kerberos.fail(true);
        let err = fx
            .materializer()
            .materialize(CredentialType::Principal, "svc")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RESOURCE_CREATION_FAILED");
    }
}
