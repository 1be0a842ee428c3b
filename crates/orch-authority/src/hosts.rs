//! Build host registration.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use orch_core::config::HostsConfig;

use crate::command::run_bounded;
use crate::error::AuthorityResult;

/// Registers a worker with the build coordinator so it may take tasks.
#[async_trait]
pub trait HostRegistrar: Send + Sync {
    async fn register(&self, worker_name: &str, principal: &str) -> AuthorityResult<()>;
}

/// Runs `<script> <worker_name> <principal> [arch]`.
pub struct CommandHostRegistrar {
    script: PathBuf,
    arch: Option<String>,
    timeout: Duration,
}

impl CommandHostRegistrar {
    pub fn new(config: &HostsConfig) -> Self {
        Self {
            script: config.script.clone(),
            arch: config.arch.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl HostRegistrar for CommandHostRegistrar {
    async fn register(&self, worker_name: &str, principal: &str) -> AuthorityResult<()> {
        let mut cmd = Command::new(&self.script);
        cmd.arg(worker_name).arg(principal);
        let mut display = format!("{} {worker_name} {principal}", self.script.display());
        if let Some(arch) = &self.arch {
            cmd.arg(arch);
            display.push(' ');
            display.push_str(arch);
        }
        run_bounded(cmd, &display, self.timeout)
            .await?
            .check(&display)?;
        info!(%worker_name, %principal, "registered build host");
        Ok(())
    }
}
