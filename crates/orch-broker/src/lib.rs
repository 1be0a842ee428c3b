//! orch-broker: hands out credentials to containers, one holder at a time.
//!
//! The [`CheckoutBroker`] ties the pieces together:
//!
//! 1. resolve the caller's source address to a running container,
//! 2. look up the mapping and derive the concrete resource name,
//! 3. claim the ledger key atomically, taking it over from a dead holder
//!    when necessary,
//! 4. materialize the credential, rolling the claim back on failure.
//!
//! The [`Sweeper`] periodically removes leases whose holder has gone away.

pub mod broker;
pub mod error;
pub mod materializer;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::{AccessDecision, CheckoutBroker, CheckoutGrant, LeaseStatus, ResourceStatus};
pub use error::{BrokerError, BrokerResult};
pub use materializer::CredentialMaterializer;
pub use sweeper::{SweepStats, Sweeper};
