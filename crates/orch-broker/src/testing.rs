//! Fakes shared by the broker tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use orch_authority::{
    AuthorityError, AuthorityResult, CaInfo, CaStatus, CredentialAuthority, HostRegistrar,
    IssuedCertificate, SigningAuthority, encode_file_stem,
};
use orch_core::{CredentialType, ResourceMapping};
use orch_runtime::{IdentityResolver, InMemoryRuntime};
use orch_state::StateStore;

use crate::broker::CheckoutBroker;
use crate::materializer::CredentialMaterializer;

fn refused(what: &str) -> AuthorityError {
    AuthorityError::Command {
        command: what.to_string(),
        status: "exit status: 1".to_string(),
        stderr: "refused".to_string(),
    }
}

#[derive(Default)]
pub struct FakeKerberos {
    principals: Mutex<HashSet<String>>,
    created: Mutex<Vec<String>>,
    exports: AtomicUsize,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl FakeKerberos {
    pub fn preexisting(&self, principal: &str) {
        self.principals.lock().unwrap().insert(principal.to_string());
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make `create_principal` never complete.
    pub fn hang(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialAuthority for FakeKerberos {
    fn realm(&self) -> &str {
        "KOJI.BOX"
    }

    async fn principal_exists(&self, principal: &str) -> AuthorityResult<bool> {
        Ok(self.principals.lock().unwrap().contains(principal))
    }

    async fn create_principal(&self, principal: &str) -> AuthorityResult<()> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(refused("addprinc"));
        }
        self.principals.lock().unwrap().insert(principal.to_string());
        self.created.lock().unwrap().push(principal.to_string());
        Ok(())
    }

    async fn export_keytab(&self, principal: &str, path: &Path) -> AuthorityResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(refused("ktadd"));
        }
        // Yield so concurrent callers get a chance to interleave.
        tokio::task::yield_now().await;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("keytab:{principal}")).unwrap();
        self.exports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeHosts {
    registered: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl FakeHosts {
    pub fn registered(&self) -> Vec<(String, String)> {
        self.registered.lock().unwrap().clone()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostRegistrar for FakeHosts {
    async fn register(&self, worker_name: &str, principal: &str) -> AuthorityResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(refused("manage-koji-host.sh"));
        }
        self.registered
            .lock()
            .unwrap()
            .push((worker_name.to_string(), principal.to_string()));
        Ok(())
    }
}

pub struct FakeSigning {
    certs_dir: PathBuf,
    signed: AtomicUsize,
}

impl FakeSigning {
    pub fn signed(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SigningAuthority for FakeSigning {
    async fn bootstrap(&self) -> AuthorityResult<bool> {
        Ok(false)
    }

    async fn issue(&self, name: &str) -> AuthorityResult<IssuedCertificate> {
        let stem = encode_file_stem(name);
        let issued = IssuedCertificate {
            cert_path: self.certs_dir.join(format!("{stem}.crt")),
            key_path: self.certs_dir.join(format!("{stem}.key")),
        };
        if !issued.cert_path.is_file() {
            std::fs::create_dir_all(&self.certs_dir).unwrap();
            std::fs::write(&issued.cert_path, format!("cert:{name}")).unwrap();
            std::fs::write(&issued.key_path, format!("key:{name}")).unwrap();
            self.signed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(issued)
    }

    fn root_certificate_path(&self) -> PathBuf {
        self.certs_dir.join("ca.crt")
    }

    fn status(&self) -> CaStatus {
        CaStatus {
            initialized: true,
            ca_dir: self.certs_dir.clone(),
            certs_dir: self.certs_dir.clone(),
            root_certificate: self.root_certificate_path(),
            next_serial: None,
            issued: self.signed(),
        }
    }

    fn root_info(&self) -> AuthorityResult<Option<CaInfo>> {
        Ok(None)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: StateStore,
    pub runtime: Arc<InMemoryRuntime>,
    pub kerberos: Arc<FakeKerberos>,
    pub hosts: Arc<FakeHosts>,
    pub signing: Arc<FakeSigning>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let signing = Arc::new(FakeSigning {
            certs_dir: dir.path().join("certs"),
            signed: AtomicUsize::new(0),
        });
        Self {
            store: StateStore::open_in_memory().unwrap(),
            runtime: Arc::new(InMemoryRuntime::new()),
            kerberos: Arc::new(FakeKerberos::default()),
            hosts: Arc::new(FakeHosts::default()),
            signing,
            dir,
        }
    }

    pub fn materializer(&self) -> CredentialMaterializer {
        CredentialMaterializer::new(
            self.kerberos.clone(),
            self.hosts.clone(),
            self.signing.clone(),
            self.dir.path().join("keytabs"),
        )
    }

    pub fn broker(&self) -> CheckoutBroker {
        let resolver = IdentityResolver::new(self.runtime.clone()).unwrap();
        CheckoutBroker::new(
            self.store.clone(),
            Arc::new(resolver),
            Arc::new(self.materializer()),
        )
    }

    pub fn mapping(&self, id: &str, credential_type: CredentialType, name: &str) {
        self.store
            .load_mappings(&[ResourceMapping {
                id: id.to_string(),
                credential_type,
                canonical_name: name.to_string(),
                description: String::new(),
            }])
            .unwrap();
    }

    pub fn container(&self, id: &str, name: &str, ip: &str) {
        self.runtime.insert(InMemoryRuntime::container(id, name, ip));
    }
}
