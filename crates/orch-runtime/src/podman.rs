//! Podman backend driven through the `podman` CLI.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use orch_core::ContainerInfo;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::ContainerRuntime;

pub struct PodmanRuntime {
    bin: PathBuf,
    timeout: Duration,
}

struct Output {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

impl PodmanRuntime {
    pub fn new(bin: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            bin: bin.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    async fn run(&self, operation: &'static str, args: &[&str]) -> RuntimeResult<Output> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(bin = %self.bin.display(), ?args, "running podman");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| RuntimeError::Connect(format!("{}: {e}", self.bin.display())))?;

        Ok(Output {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn command_error(&self, args: &[&str], output: Output) -> RuntimeError {
        RuntimeError::Command {
            command: format!("{} {}", self.bin.display(), args.join(" ")),
            status: output.status,
            stderr: output.stderr,
        }
    }

    /// Inspect several containers, skipping ids that no longer exist.
    async fn inspect_many(&self, ids: &[&str]) -> RuntimeResult<Vec<ContainerInfo>> {
        let mut args = vec!["inspect", "--type", "container"];
        args.extend_from_slice(ids);
        let output = self.run("inspect", &args).await?;
        if output.success {
            return parse_inspect(&output.stdout);
        }
        if !is_missing(&output) {
            return Err(self.command_error(&args, output));
        }

        // One of the ids was removed after `ps`; podman fails the whole batch.
        debug!(stderr = %output.stderr, "container vanished during listing, inspecting one by one");
        let mut containers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(container) = self.inspect(id).await? {
                containers.push(container);
            }
        }
        Ok(containers)
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn name(&self) -> &'static str {
        "podman"
    }

    async fn list(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        let args = ["ps", "-q", "--no-trunc"];
        let output = self.run("list", &args).await?;
        if !output.success {
            return Err(self.command_error(&args, output));
        }
        let ids: Vec<&str> = output.stdout.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        // A container can exit or disappear between `ps` and `inspect`.
        Ok(self
            .inspect_many(&ids)
            .await?
            .into_iter()
            .filter(|c| c.running)
            .collect())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        let args = ["inspect", "--type", "container", id];
        let output = self.run("inspect", &args).await?;
        if !output.success {
            if is_missing(&output) {
                return Ok(None);
            }
            return Err(self.command_error(&args, output));
        }
        Ok(parse_inspect(&output.stdout)?.into_iter().next())
    }

    async fn ping(&self) -> RuntimeResult<()> {
        let args = ["info", "--format", "{{.Host.Arch}}"];
        let output = self.run("ping", &args).await?;
        if !output.success {
            return Err(self.command_error(&args, output));
        }
        Ok(())
    }
}

fn is_missing(output: &Output) -> bool {
    output.stderr.to_ascii_lowercase().contains("no such")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanContainer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: PodmanState,
    #[serde(default)]
    config: PodmanConfig,
    #[serde(default)]
    network_settings: PodmanNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanNetworkSettings {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default)]
    networks: Option<HashMap<String, PodmanEndpoint>>,
}

#[derive(Debug, Default, Deserialize)]
struct PodmanEndpoint {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
}

fn parse_inspect(json: &str) -> RuntimeResult<Vec<ContainerInfo>> {
    let containers: Vec<PodmanContainer> =
        serde_json::from_str(json).map_err(|e| RuntimeError::Parse(e.to_string()))?;
    Ok(containers.into_iter().map(ContainerInfo::from).collect())
}

impl From<PodmanContainer> for ContainerInfo {
    fn from(c: PodmanContainer) -> Self {
        let mut networks: BTreeMap<String, String> = c
            .network_settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, endpoint)| !endpoint.ip_address.is_empty())
            .map(|(network, endpoint)| (network, endpoint.ip_address))
            .collect();
        // Rootful default network reports its address only at the top level.
        if networks.is_empty() && !c.network_settings.ip_address.is_empty() {
            networks.insert("podman".to_string(), c.network_settings.ip_address);
        }
        ContainerInfo {
            id: c.id,
            name: c.name.trim_start_matches('/').to_string(),
            status: c.state.status,
            running: c.state.running,
            labels: c.config.labels.unwrap_or_default().into_iter().collect(),
            networks,
            env: c.config.env.unwrap_or_default(),
        }
    }
}
