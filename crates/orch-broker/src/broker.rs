//! The checkout broker.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use orch_core::{
    CheckoutRecord, ContainerInfo, CredentialType, ResourceMapping, epoch_secs,
    validate_identifier,
};
use orch_runtime::{CallerIdentity, IdentityResolver};
use orch_state::{ClaimOutcome, ReleaseOutcome, StateStore};

use crate::error::{BrokerError, BrokerResult};
use crate::materializer::CredentialMaterializer;

/// A successful checkout.
#[derive(Debug, Clone)]
pub struct CheckoutGrant {
    pub record: CheckoutRecord,
    pub artifact_path: PathBuf,
}

impl CheckoutGrant {
    /// Download name of the artifact, e.g. `koji-worker-3.keytab`.
    pub fn file_name(&self) -> String {
        format!(
            "{}.{}",
            self.record.concrete_name,
            self.record.credential_type.file_extension()
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseStatus {
    #[serde(flatten)]
    pub record: CheckoutRecord,
    pub holder_running: bool,
    pub holder: Option<ContainerInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub mapping: ResourceMapping,
    pub held: bool,
    pub leases: Vec<LeaseStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub can_access: bool,
    pub reason: String,
}

impl AccessDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            can_access: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            can_access: false,
            reason: reason.into(),
        }
    }
}

/// Releases a freshly claimed lease unless [`ClaimGuard::disarm`] is called.
struct ClaimGuard<'a> {
    store: &'a StateStore,
    record: &'a CheckoutRecord,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(store: &'a StateStore, record: &'a CheckoutRecord) -> Self {
        Self {
            store,
            record,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let record = self.record;
        match self.store.release_if_held_by(
            &record.mapping_id,
            &record.concrete_name,
            &record.holder_container_id,
        ) {
            Ok(ReleaseOutcome::Released(_)) => info!(
                id = %record.mapping_id,
                concrete_name = %record.concrete_name,
                holder = %record.holder_container_id,
                "checkout rolled back"
            ),
            Ok(_) => {}
            Err(e) => error!(
                id = %record.mapping_id,
                concrete_name = %record.concrete_name,
                error = %e,
                "failed to roll back checkout"
            ),
        }
    }
}

pub struct CheckoutBroker {
    store: StateStore,
    resolver: Arc<IdentityResolver>,
    materializer: Arc<CredentialMaterializer>,
}

impl CheckoutBroker {
    pub fn new(
        store: StateStore,
        resolver: Arc<IdentityResolver>,
        materializer: Arc<CredentialMaterializer>,
    ) -> Self {
        Self {
            store,
            resolver,
            materializer,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn materializer(&self) -> &Arc<CredentialMaterializer> {
        &self.materializer
    }

    /// Lease the credential behind `id` to the container calling from `caller_ip`.
    pub async fn checkout(&self, id: &str, caller_ip: &str) -> BrokerResult<CheckoutGrant> {
        let mapping = self.mapping(id)?;
        let caller = self.identify(caller_ip).await?;
        let concrete_name = concrete_name(&mapping, &caller)?;

        let record = CheckoutRecord {
            mapping_id: mapping.id.clone(),
            concrete_name: concrete_name.clone(),
            holder_container_id: caller.container.id.clone(),
            holder_ip: caller_ip.to_string(),
            checked_out_at: epoch_secs(),
            credential_type: mapping.credential_type,
            scale_index: caller.scale_index,
        };
        self.claim(&record).await?;

        // Released on any exit before `disarm`, including cancellation.
        let guard = ClaimGuard::new(&self.store, &record);
        let artifact_path = self
            .materializer
            .materialize(mapping.credential_type, &concrete_name)
            .await
            .inspect_err(|e| {
                warn!(%id, %concrete_name, error = %e, "materialization failed, rolling back checkout");
            })?;
        guard.disarm();

        info!(
            %id,
            %concrete_name,
            holder = %record.holder_container_id,
            ip = %caller_ip,
            "resource checked out"
        );
        Ok(CheckoutGrant {
            record,
            artifact_path,
        })
    }

    /// Claim the ledger key, taking it over from a holder that is no longer running.
    async fn claim(&self, record: &CheckoutRecord) -> BrokerResult<()> {
        let held = match self.store.try_claim(record)? {
            ClaimOutcome::Claimed => return Ok(()),
            ClaimOutcome::AlreadyHeld(held) => held,
        };

        let runtime = self.resolver.runtime();
        if runtime.is_running(&held.holder_container_id).await? {
            warn!(
                id = %record.mapping_id,
                concrete_name = %record.concrete_name,
                holder = %held.holder_container_id,
                requester = %record.holder_container_id,
                "resource already checked out"
            );
            return Err(BrokerError::Conflict {
                id: record.mapping_id.clone(),
                holder: held.holder_container_id,
            });
        }

        // Only remove the stale lease if nobody replaced it meanwhile.
        if let ReleaseOutcome::Released(stale) = self.store.release_if_held_by(
            &record.mapping_id,
            &record.concrete_name,
            &held.holder_container_id,
        )? {
            info!(
                id = %stale.mapping_id,
                concrete_name = %stale.concrete_name,
                holder = %stale.holder_container_id,
                "reclaimed lease from dead container"
            );
        }

        match self.store.try_claim(record)? {
            ClaimOutcome::Claimed => Ok(()),
            ClaimOutcome::AlreadyHeld(winner) => {
                warn!(
                    id = %record.mapping_id,
                    holder = %winner.holder_container_id,
                    "lost takeover race"
                );
                Err(BrokerError::Conflict {
                    id: record.mapping_id.clone(),
                    holder: winner.holder_container_id,
                })
            }
        }
    }

    /// Return the caller's lease on `id`.
    pub async fn release(&self, id: &str, caller_ip: &str) -> BrokerResult<CheckoutRecord> {
        let mapping = self.mapping(id)?;
        let caller = self.identify(caller_ip).await?;
        let concrete_name = concrete_name(&mapping, &caller)?;
        let caller_id = &caller.container.id;

        match self.store.release_if_held_by(id, &concrete_name, caller_id)? {
            ReleaseOutcome::Released(record) => {
                info!(%id, %concrete_name, holder = %caller_id, "resource released");
                Ok(record)
            }
            ReleaseOutcome::NotHeld | ReleaseOutcome::HeldByOther(_) => {
                debug!(%id, %concrete_name, requester = %caller_id, "release by non-holder");
                Err(BrokerError::NotHeld {
                    id: id.to_string(),
                    container_id: caller_id.clone(),
                })
            }
        }
    }

    /// Every lease under `id`, with the current state of each holder.
    pub async fn status(&self, id: &str) -> BrokerResult<ResourceStatus> {
        let mapping = self.mapping(id)?;
        let runtime = self.resolver.runtime();

        let mut leases = Vec::new();
        for record in self.store.list_checkouts_for_mapping(id)? {
            let holder = runtime.inspect(&record.holder_container_id).await?;
            leases.push(LeaseStatus {
                holder_running: holder.as_ref().is_some_and(|c| c.running),
                holder,
                record,
            });
        }
        Ok(ResourceStatus {
            held: !leases.is_empty(),
            mapping,
            leases,
        })
    }

    /// Whether the caller at `caller_ip` could use the credential behind `id`.
    pub async fn validate_access(&self, id: &str, caller_ip: &str) -> BrokerResult<AccessDecision> {
        let mapping = self.mapping(id)?;

        let caller = self.resolver.resolve(caller_ip).await?;
        let concrete_name = match (&caller, mapping.credential_type) {
            (Some(caller), _) => match mapping.concrete_name(caller.scale_index) {
                Some(name) => name,
                None => return Ok(AccessDecision::deny("caller has no scale index")),
            },
            (None, CredentialType::Worker) => {
                if self.store.list_checkouts_for_mapping(id)?.is_empty() {
                    return Ok(AccessDecision::allow("resource is available"));
                }
                return Err(BrokerError::CannotIdentify {
                    ip: caller_ip.to_string(),
                });
            }
            (None, _) => mapping.canonical_name.clone(),
        };

        let Some(lease) = self.store.get_checkout(id, &concrete_name)? else {
            return Ok(AccessDecision::allow("resource is available"));
        };
        let Some(caller) = caller else {
            return Err(BrokerError::CannotIdentify {
                ip: caller_ip.to_string(),
            });
        };
        if lease.holder_container_id == caller.container.id {
            return Ok(AccessDecision::allow("resource is checked out by the caller"));
        }
        if !self
            .resolver
            .runtime()
            .is_running(&lease.holder_container_id)
            .await?
        {
            return Ok(AccessDecision::allow("holder is no longer running"));
        }
        Ok(AccessDecision::deny(format!(
            "resource is checked out by {}",
            lease.holder_container_id
        )))
    }

    /// Delete every lease whose holder is not a running container.
    ///
    /// Returns the reclaimed leases.
    pub async fn cleanup_sweep(&self) -> BrokerResult<Vec<CheckoutRecord>> {
        let runtime = self.resolver.runtime();
        let live: HashSet<String> = runtime.list().await?.into_iter().map(|c| c.id).collect();

        let mut reclaimed = Vec::new();
        for candidate in self.store.list_checkouts_outside(&live)? {
            // The holder may have started after the listing.
            if runtime.is_running(&candidate.holder_container_id).await? {
                debug!(
                    id = %candidate.mapping_id,
                    holder = %candidate.holder_container_id,
                    "holder started after listing, keeping lease"
                );
                continue;
            }
            if let ReleaseOutcome::Released(record) = self.store.release_if_held_by(
                &candidate.mapping_id,
                &candidate.concrete_name,
                &candidate.holder_container_id,
            )? {
                info!(
                    id = %record.mapping_id,
                    concrete_name = %record.concrete_name,
                    holder = %record.holder_container_id,
                    "reclaimed lease from dead container"
                );
                reclaimed.push(record);
            }
        }
        Ok(reclaimed)
    }

    fn mapping(&self, id: &str) -> BrokerResult<ResourceMapping> {
        validate_identifier(id)?;
        self.store
            .get_mapping(id)?
            .ok_or_else(|| BrokerError::NotFound { id: id.to_string() })
    }

    async fn identify(&self, caller_ip: &str) -> BrokerResult<CallerIdentity> {
        self.resolver
            .resolve(caller_ip)
            .await?
            .ok_or_else(|| BrokerError::CannotIdentify {
                ip: caller_ip.to_string(),
            })
    }
}

fn concrete_name(mapping: &ResourceMapping, caller: &CallerIdentity) -> BrokerResult<String> {
    mapping
        .concrete_name(caller.scale_index)
        .ok_or_else(|| BrokerError::Validation {
            field: "scale_index",
            value: caller.container.name.clone(),
            message: format!(
                "container {} has no scale index for worker resource {}",
                caller.container.name, mapping.id
            ),
        })
}
