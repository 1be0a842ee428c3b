//! Local certificate authority.
//!
//! Directory layout, OpenSSL-compatible so the files can be inspected
//! with the usual tools:
//!
//! ```text
//! ca/ca.key      root private key (0600)
//! ca/ca.crt      self-signed root certificate
//! ca/serial      next serial number, hex
//! ca/index.txt   one line per issued certificate
//! certs/<name>.crt, certs/<name>.key
//! ```
//!
//! Leaves go through a real signing request: a key is generated, a CSR is
//! written to `certs/<name>.csr`, read back, signed by the root and then
//! deleted.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use orch_core::config::CertificateConfig;

use crate::error::{AuthorityError, AuthorityResult};
use crate::naming::encode_file_stem;

/// First serial handed out by a fresh signing database.
pub const INITIAL_SERIAL: u64 = 0x1000;

/// OID of the PKCS#9 `emailAddress` attribute.
const EMAIL_ADDRESS_OID: [u64; 7] = [1, 2, 840, 113549, 1, 9, 1];

/// Paths of one issued certificate and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaStatus {
    pub initialized: bool,
    pub ca_dir: PathBuf,
    pub certs_dir: PathBuf,
    pub root_certificate: PathBuf,
    pub next_serial: Option<String>,
    pub issued: usize,
}

/// Parsed details of the root certificate.
#[derive(Debug, Clone, Serialize)]
pub struct CaInfo {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub subject: String,
    pub issuer: String,
    /// Colon-separated hex, as `openssl x509 -serial` prints it.
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
    pub is_ca: bool,
}

/// Root bootstrap and leaf signing.
#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Create the root key, root certificate and signing database if absent.
    ///
    /// Returns `true` when a new root was generated.
    async fn bootstrap(&self) -> AuthorityResult<bool>;

    /// Return the certificate and key for `name`, signing them on first use.
    async fn issue(&self, name: &str) -> AuthorityResult<IssuedCertificate>;

    fn root_certificate_path(&self) -> PathBuf;

    fn status(&self) -> CaStatus;

    /// Details of the root certificate, `None` before bootstrap.
    fn root_info(&self) -> AuthorityResult<Option<CaInfo>>;
}

pub struct CaChainManager {
    ca_dir: PathBuf,
    certs_dir: PathBuf,
    config: CertificateConfig,
    // Serializes root creation and serial allocation.
    lock: Mutex<()>,
}

impl CaChainManager {
    pub fn new(ca_dir: PathBuf, certs_dir: PathBuf, config: CertificateConfig) -> Self {
        Self {
            ca_dir,
            certs_dir,
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.ca_dir.join("ca.key")
    }

    pub fn serial_path(&self) -> PathBuf {
        self.ca_dir.join("serial")
    }

    pub fn index_path(&self) -> PathBuf {
        self.ca_dir.join("index.txt")
    }

    /// `(cert, key, csr)` paths for a leaf.
    pub fn leaf_paths(&self, name: &str) -> (PathBuf, PathBuf, PathBuf) {
        let stem = encode_file_stem(name);
        (
            self.certs_dir.join(format!("{stem}.crt")),
            self.certs_dir.join(format!("{stem}.key")),
            self.certs_dir.join(format!("{stem}.csr")),
        )
    }

    fn root_exists(&self) -> bool {
        self.root_key_path().is_file() && self.root_certificate_path().is_file()
    }

    fn bootstrap_locked(&self) -> AuthorityResult<bool> {
        fs::create_dir_all(&self.ca_dir).map_err(AuthorityError::io(&self.ca_dir))?;
        fs::create_dir_all(&self.certs_dir).map_err(AuthorityError::io(&self.certs_dir))?;

        let created = if self.root_exists() {
            debug!(ca_dir = %self.ca_dir.display(), "root CA already present");
            false
        } else {
            self.generate_root()?;
            true
        };
        self.ensure_database()?;
        Ok(created)
    }

    fn generate_root(&self) -> AuthorityResult<()> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut dn = self.subject(&self.config.root_common_name);
        dn.push(
            DnType::CustomDnType(EMAIL_ADDRESS_OID.to_vec()),
            DnValue::Ia5String(Ia5String::try_from(self.config.root_email.as_str())?),
        );
        params.distinguished_name = dn;
        let now = Utc::now();
        let (y, m, d) = ymd(now);
        params.not_before = rcgen::date_time_ymd(y, m, d);
        let (y, m, d) = ymd(add_days(now, self.config.root_days)?);
        params.not_after = rcgen::date_time_ymd(y, m, d);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        write_file(&self.root_key_path(), key.serialize_pem().as_bytes(), 0o600)?;
        write_file(&self.root_certificate_path(), cert.pem().as_bytes(), 0o644)?;
        info!(
            common_name = %self.config.root_common_name,
            days = self.config.root_days,
            "generated root CA"
        );
        Ok(())
    }

    /// Recreate a missing index or an unreadable serial file.
    fn ensure_database(&self) -> AuthorityResult<()> {
        let index = self.index_path();
        if !index.is_file() {
            warn!(path = %index.display(), "signing index missing, initializing");
            write_file(&index, b"", 0o644)?;
        }
        if self.read_serial().is_none() {
            warn!(path = %self.serial_path().display(), "serial file missing or invalid, initializing");
            self.write_serial(INITIAL_SERIAL)?;
        }
        Ok(())
    }

    fn read_serial(&self) -> Option<u64> {
        let raw = fs::read_to_string(self.serial_path()).ok()?;
        u64::from_str_radix(raw.trim(), 16).ok()
    }

    fn write_serial(&self, serial: u64) -> AuthorityResult<()> {
        write_file(&self.serial_path(), format!("{serial:04X}\n").as_bytes(), 0o644)
    }

    fn subject(&self, common_name: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, self.config.country.as_str());
        dn.push(DnType::StateOrProvinceName, self.config.state.as_str());
        dn.push(DnType::LocalityName, self.config.locality.as_str());
        dn.push(DnType::OrganizationName, self.config.organization.as_str());
        dn.push(
            DnType::OrganizationalUnitName,
            self.config.organizational_unit.as_str(),
        );
        dn.push(DnType::CommonName, common_name);
        dn
    }

    fn load_root(&self) -> AuthorityResult<(rcgen::Certificate, KeyPair)> {
        let key_path = self.root_key_path();
        let cert_path = self.root_certificate_path();
        let key_pem = fs::read_to_string(&key_path).map_err(AuthorityError::io(&key_path))?;
        let cert_pem = fs::read_to_string(&cert_path).map_err(AuthorityError::io(&cert_path))?;

        let key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let cert = params.self_signed(&key)?;
        Ok((cert, key))
    }

    fn issue_locked(&self, name: &str) -> AuthorityResult<IssuedCertificate> {
        let (cert_path, key_path, csr_path) = self.leaf_paths(name);
        if cert_path.is_file() && key_path.is_file() {
            debug!(%name, "certificate already issued");
            return Ok(IssuedCertificate { cert_path, key_path });
        }

        self.bootstrap_locked()?;
        let (root_cert, root_key) = self.load_root()?;

        let key = KeyPair::generate()?;
        let mut request = CertificateParams::default();
        request.distinguished_name = self.subject(name);
        if is_dns_name(name) {
            request
                .subject_alt_names
                .push(SanType::DnsName(Ia5String::try_from(name)?));
        }
        let csr_pem = request.serialize_request(&key)?.pem()?;
        write_file(&csr_path, csr_pem.as_bytes(), 0o644)?;

        let signed = self.sign_request(&csr_path, &root_cert, &root_key, name);
        if let Err(e) = fs::remove_file(&csr_path) {
            warn!(path = %csr_path.display(), error = %e, "failed to remove signing request");
        }
        let (cert, serial, not_after) = signed?;

        write_file(&key_path, key.serialize_pem().as_bytes(), 0o600)?;
        write_file(&cert_path, cert.pem().as_bytes(), 0o644)?;
        self.record_issued(serial, not_after, name)?;

        info!(%name, serial = format!("{serial:04X}"), days = self.config.leaf_days, "issued certificate");
        Ok(IssuedCertificate { cert_path, key_path })
    }

    fn sign_request(
        &self,
        csr_path: &Path,
        root_cert: &rcgen::Certificate,
        root_key: &KeyPair,
        name: &str,
    ) -> AuthorityResult<(rcgen::Certificate, u64, DateTime<Utc>)> {
        let csr_pem = fs::read_to_string(csr_path).map_err(AuthorityError::io(csr_path))?;
        let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem)?;

        let serial = self.read_serial().unwrap_or(INITIAL_SERIAL);
        let now = Utc::now();
        let not_after = add_days(now, self.config.leaf_days)?;

        csr.params.serial_number = Some(SerialNumber::from(serial));
        let (y, m, d) = ymd(now);
        csr.params.not_before = rcgen::date_time_ymd(y, m, d);
        let (y, m, d) = ymd(not_after);
        csr.params.not_after = rcgen::date_time_ymd(y, m, d);
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        csr.params.use_authority_key_identifier_extension = true;

        let cert = csr.signed_by(root_cert, root_key)?;
        self.write_serial(serial + 1)?;
        debug!(%name, serial = format!("{serial:04X}"), "signed request");
        Ok((cert, serial, not_after))
    }

    fn record_issued(&self, serial: u64, not_after: DateTime<Utc>, name: &str) -> AuthorityResult<()> {
        let index = self.index_path();
        let line = format!(
            "V\t{}\t\t{serial:04X}\tunknown\t/CN={name}\n",
            not_after.format("%y%m%d000000Z")
        );
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .map_err(AuthorityError::io(&index))?;
        file.write_all(line.as_bytes())
            .map_err(AuthorityError::io(&index))
    }
}

#[async_trait]
impl SigningAuthority for CaChainManager {
    async fn bootstrap(&self) -> AuthorityResult<bool> {
        let _guard = self.lock.lock().await;
        self.bootstrap_locked()
    }

    async fn issue(&self, name: &str) -> AuthorityResult<IssuedCertificate> {
        if name.is_empty() {
            return Err(AuthorityError::InvalidName {
                name: name.to_string(),
                reason: "certificate name is empty".to_string(),
            });
        }
        let _guard = self.lock.lock().await;
        self.issue_locked(name)
    }

    fn root_certificate_path(&self) -> PathBuf {
        self.ca_dir.join("ca.crt")
    }

    fn status(&self) -> CaStatus {
        let issued = fs::read_to_string(self.index_path())
            .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0);
        CaStatus {
            initialized: self.root_exists(),
            ca_dir: self.ca_dir.clone(),
            certs_dir: self.certs_dir.clone(),
            root_certificate: self.root_certificate_path(),
            next_serial: self.read_serial().map(|s| format!("{s:04X}")),
            issued,
        }
    }

    fn root_info(&self) -> AuthorityResult<Option<CaInfo>> {
        if !self.root_exists() {
            return Ok(None);
        }
        let cert_path = self.root_certificate_path();
        let bytes = fs::read(&cert_path).map_err(AuthorityError::io(&cert_path))?;
        let unreadable =
            |e: String| AuthorityError::Certificate(format!("{}: {e}", cert_path.display()));
        let (_, pem) = x509_parser::pem::parse_x509_pem(&bytes).map_err(|e| unreadable(e.to_string()))?;
        let cert = pem.parse_x509().map_err(|e| unreadable(e.to_string()))?;

        Ok(Some(CaInfo {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            not_before: rfc3339(cert.validity().not_before.timestamp()),
            not_after: rfc3339(cert.validity().not_after.timestamp()),
            is_ca: cert.is_ca(),
            key_path: self.root_key_path(),
            cert_path,
        }))
    }
}

fn rfc3339(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|at| at.to_rfc3339())
        .unwrap_or_default()
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> AuthorityResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(AuthorityError::io(parent))?;
    }
    fs::write(path, contents).map_err(AuthorityError::io(path))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(AuthorityError::io(path))
}

fn add_days(from: DateTime<Utc>, days: u32) -> AuthorityResult<DateTime<Utc>> {
    from.checked_add_days(Days::new(u64::from(days)))
        .ok_or_else(|| AuthorityError::Certificate(format!("validity of {days} days overflows")))
}

/// Calendar date of `at` in the shape `rcgen::date_time_ymd` takes.
fn ymd(at: DateTime<Utc>) -> (i32, u8, u8) {
    (at.year(), at.month() as u8, at.day() as u8)
}

fn is_dns_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
