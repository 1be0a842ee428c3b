//! Docker engine API backend (bollard).

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, EndpointSettings};
use tracing::debug;

use orch_core::ContainerInfo;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::ContainerRuntime;

pub struct DockerRuntime {
    docker: Docker,
    timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the engine socket. No request is made until first use.
    pub fn connect(socket: &Path, timeout_secs: u64) -> RuntimeResult<Self> {
        let path = socket.to_str().ok_or_else(|| {
            RuntimeError::Connect(format!("socket path is not UTF-8: {}", socket.display()))
        })?;
        let docker = Docker::connect_with_socket(path, timeout_secs, bollard::API_DEFAULT_VERSION)
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;
        debug!(socket = %socket.display(), "docker runtime configured");
        Ok(Self {
            docker,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> RuntimeResult<Result<T, bollard::errors::Error>>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn list(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self
            .bounded("list", self.docker.list_containers(Some(options)))
            .await?
            .map_err(|e| RuntimeError::Api(e.to_string()))?;
        Ok(summaries.into_iter().filter_map(from_summary).collect())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        let result = self
            .bounded(
                "inspect",
                self.docker.inspect_container(id, None::<InspectContainerOptions>),
            )
            .await?;
        match result {
            Ok(response) => Ok(from_inspect(response)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.bounded("ping", self.docker.ping())
            .await?
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;
        Ok(())
    }
}

/// Convert a `GET /containers/json` entry. Only running containers are listed.
fn from_summary(summary: ContainerSummary) -> Option<ContainerInfo> {
    let id = summary.id?;
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    Some(ContainerInfo {
        id,
        name,
        status: summary.status.unwrap_or_else(|| "running".to_string()),
        running: true,
        labels: summary.labels.map(into_btree).unwrap_or_default(),
        networks: summary
            .network_settings
            .and_then(|s| s.networks)
            .map(network_addresses)
            .unwrap_or_default(),
        env: Vec::new(),
    })
}

/// Convert a `GET /containers/{id}/json` response.
fn from_inspect(response: ContainerInspectResponse) -> Option<ContainerInfo> {
    let id = response.id?;
    let (running, status) = match response.state {
        Some(state) => (
            state.running.unwrap_or(false),
            state.status.map(|s| s.to_string()).unwrap_or_default(),
        ),
        None => (false, String::new()),
    };
    let (labels, env) = match response.config {
        Some(config) => (
            config.labels.map(into_btree).unwrap_or_default(),
            config.env.unwrap_or_default(),
        ),
        None => (BTreeMap::new(), Vec::new()),
    };
    Some(ContainerInfo {
        id,
        name: response
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        status,
        running,
        labels,
        networks: response
            .network_settings
            .and_then(|s| s.networks)
            .map(network_addresses)
            .unwrap_or_default(),
        env,
    })
}

fn into_btree(map: HashMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter().collect()
}

fn network_addresses(networks: HashMap<String, EndpointSettings>) -> BTreeMap<String, String> {
    networks
        .into_iter()
        .filter_map(|(network, endpoint)| {
            endpoint
                .ip_address
                .filter(|ip| !ip.is_empty())
                .map(|ip| (network, ip))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerConfig, ContainerState, ContainerSummaryNetworkSettings, NetworkSettings,
    };

    fn endpoint(ip: &str) -> EndpointSettings {
        EndpointSettings {
            ip_address: Some(ip.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn summary_conversion() {
        let summary = ContainerSummary {
            id: Some("abc123".to_string()),
            names: Some(vec!["/koji-worker-2".to_string()]),
            status: Some("Up 3 minutes".to_string()),
            labels: Some(HashMap::from([("scale_index".to_string(), "2".to_string())])),
            network_settings: Some(ContainerSummaryNetworkSettings {
                networks: Some(HashMap::from([
                    ("kojinet".to_string(), endpoint("172.20.0.7")),
                    ("none".to_string(), endpoint("")),
                ])),
            }),
            ..Default::default()
        };

        let info = from_summary(summary).unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.name, "koji-worker-2");
        assert!(info.running);
        assert_eq!(info.labels["scale_index"], "2");
        assert_eq!(info.networks.len(), 1);
        assert_eq!(info.networks["kojinet"], "172.20.0.7");
    }

    #[test]
    fn summary_without_id_is_skipped() {
        assert!(from_summary(ContainerSummary::default()).is_none());
    }

    #[test]
    fn inspect_conversion() {
        let response = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some("/koji-hub".to_string()),
            state: Some(ContainerState {
                running: Some(false),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                env: Some(vec!["SCALE_INDEX=5".to_string()]),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(HashMap::from([("kojinet".to_string(), endpoint("172.20.0.3"))])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = from_inspect(response).unwrap();
        assert_eq!(info.name, "koji-hub");
        assert!(!info.running);
        assert_eq!(info.env_var("SCALE_INDEX"), Some("5"));
        assert_eq!(info.networks["kojinet"], "172.20.0.3");
    }
}
