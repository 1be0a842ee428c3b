//! orch-authority: the systems that actually mint credentials.
//!
//! Three seams, each a trait with one production implementation:
//!
//! | Trait | Implementation | Backing system |
//! |---|---|---|
//! | [`CredentialAuthority`] | [`KadminAuthority`] | Kerberos admin server via `kadmin` |
//! | [`HostRegistrar`] | [`CommandHostRegistrar`] | build coordinator host script |
//! | [`SigningAuthority`] | [`CaChainManager`] | local root CA (rcgen) |
//!
//! Every subprocess call is bounded by a timeout and reports expiry as
//! [`AuthorityError::Timeout`].

pub mod ca;
pub mod command;
pub mod error;
pub mod hosts;
pub mod kerberos;
pub mod naming;

pub use ca::{CaChainManager, CaInfo, CaStatus, IssuedCertificate, SigningAuthority};
pub use error::{AuthorityError, AuthorityResult};
pub use hosts::{CommandHostRegistrar, HostRegistrar};
pub use kerberos::{CredentialAuthority, KadminAuthority};
pub use naming::{encode_file_stem, normalize_principal, worker_principal};
