//! Source address → calling container.
//!
//! Resolution order, first hit wins:
//!
//! 1. a network attachment with exactly the source address,
//! 2. an attachment on the same /24 as the source address,
//! 3. a `orch.client.ip` / `orch.ip` label naming the source address.
//!
//! The matched container is then inspected again so the scale index sees
//! its full environment and the running state is current.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use orch_core::ContainerInfo;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::ContainerRuntime;

/// Labels that pin a container to a client address.
pub const IP_OVERRIDE_LABELS: [&str; 2] = ["orch.client.ip", "orch.ip"];

/// Labels that carry an explicit scale index.
pub const SCALE_INDEX_LABELS: [&str; 2] = ["scale_index", "orch.scale.index"];

/// Replica number labels set by compose implementations.
pub const REPLICA_LABELS: [&str; 2] = [
    "com.docker.compose.container-number",
    "io.podman.compose.container-number",
];

/// Environment variable that carries an explicit scale index.
pub const SCALE_INDEX_ENV: &str = "SCALE_INDEX";

/// The container a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub container: ContainerInfo,
    pub scale_index: Option<u32>,
}

impl CallerIdentity {
    pub fn container_id(&self) -> &str {
        &self.container.id
    }
}

pub struct IdentityResolver {
    runtime: Arc<dyn ContainerRuntime>,
    worker_name: Regex,
    trailing_index: Regex,
}

impl IdentityResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> RuntimeResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| RuntimeError::Internal(format!("bad pattern {pattern}: {e}")))
        };
        Ok(Self {
            runtime,
            worker_name: compile(r"koji-worker-(\d+)")?,
            trailing_index: compile(r"[-_.](\d+)$")?,
        })
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Find the running container behind `source_ip`.
    ///
    /// `Ok(None)` means nobody matched; runtime failures are errors.
    pub async fn resolve(&self, source_ip: &str) -> RuntimeResult<Option<CallerIdentity>> {
        let Some(ip) = normalize_ip(source_ip) else {
            debug!(source_ip, "unparseable source address");
            return Ok(None);
        };
        let containers = self.runtime.list().await?;

        let Some(matched) = find_by_address(&containers, ip) else {
            debug!(%ip, candidates = containers.len(), "no container matches source address");
            return Ok(None);
        };

        let Some(container) = self.runtime.inspect(&matched.id).await? else {
            debug!(%ip, container = %matched.id, "matched container vanished");
            return Ok(None);
        };
        if !container.running {
            debug!(%ip, container = %container.id, "matched container is not running");
            return Ok(None);
        }

        let scale_index = self.scale_index(&container);
        debug!(%ip, container = %container.id, name = %container.name, ?scale_index, "caller resolved");
        Ok(Some(CallerIdentity {
            container,
            scale_index,
        }))
    }

    /// Extract the horizontal scale index of a container.
    pub fn scale_index(&self, container: &ContainerInfo) -> Option<u32> {
        let from_capture = |re: &Regex| {
            re.captures(&container.name)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok())
        };
        let from_labels = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| container.labels.get(*key))
                .and_then(|v| v.trim().parse().ok())
        };

        from_capture(&self.worker_name)
            .or_else(|| from_labels(&SCALE_INDEX_LABELS))
            .or_else(|| from_labels(&REPLICA_LABELS))
            .or_else(|| {
                container
                    .env_var(SCALE_INDEX_ENV)
                    .and_then(|v| v.trim().parse().ok())
            })
            .or_else(|| from_capture(&self.trailing_index))
    }
}

/// Parse a client address, unwrapping IPv4-mapped IPv6.
fn normalize_ip(raw: &str) -> Option<IpAddr> {
    match raw.trim().parse::<IpAddr>().ok()? {
        IpAddr::V6(v6) => Some(v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4)),
        v4 => Some(v4),
    }
}

fn find_by_address(containers: &[ContainerInfo], ip: IpAddr) -> Option<&ContainerInfo> {
    let addresses = |c: &ContainerInfo| {
        c.networks
            .values()
            .filter_map(|a| normalize_ip(a))
            .collect::<Vec<_>>()
    };

    if let Some(c) = containers.iter().find(|c| addresses(c).contains(&ip)) {
        debug!(%ip, container = %c.id, "exact address match");
        return Some(c);
    }

    if let IpAddr::V4(v4) = ip {
        if let Some(c) = containers.iter().find(|c| {
            addresses(c)
                .iter()
                .any(|a| matches!(a, IpAddr::V4(other) if same_slash_24(*other, v4)))
        }) {
            debug!(%ip, container = %c.id, "subnet match");
            return Some(c);
        }
    }

    let found = containers.iter().find(|c| {
        IP_OVERRIDE_LABELS
            .iter()
            .filter_map(|key| c.labels.get(*key))
            .any(|value| normalize_ip(value) == Some(ip))
    });
    if let Some(c) = found {
        debug!(%ip, container = %c.id, "label override match");
    }
    found
}

fn same_slash_24(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    a.octets()[..3] == b.octets()[..3]
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::memory::InMemoryRuntime;

    fn resolver(runtime: &Arc<InMemoryRuntime>) -> IdentityResolver {
        IdentityResolver::new(runtime.clone()).unwrap()
    }

    fn named(name: &str) -> ContainerInfo {
        ContainerInfo {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn exact_match_beats_subnet_match() {
        let runtime = Arc::new(InMemoryRuntime::with_containers([
            InMemoryRuntime::container("neighbour", "koji-hub", "172.20.0.2"),
            InMemoryRuntime::container("caller", "koji-web", "172.20.0.9"),
        ]));
        let identity = resolver(&runtime).resolve("172.20.0.9").await.unwrap().unwrap();
        assert_eq!(identity.container_id(), "caller");
    }

    #[tokio::test]
    async fn subnet_match_when_no_exact_address() {
        let runtime = Arc::new(InMemoryRuntime::with_containers([
            InMemoryRuntime::container("other-net", "a", "10.1.0.5"),
            InMemoryRuntime::container("same-net", "b", "172.20.0.2"),
        ]));
        let identity = resolver(&runtime).resolve("172.20.0.77").await.unwrap().unwrap();
        assert_eq!(identity.container_id(), "same-net");
    }

    #[tokio::test]
    async fn label_override_match() {
        let mut pinned = InMemoryRuntime::container("pinned", "proxy", "10.1.0.5");
        pinned
            .labels
            .insert("orch.client.ip".to_string(), "192.168.7.40".to_string());
        let runtime = Arc::new(InMemoryRuntime::with_containers([pinned]));

        let identity = resolver(&runtime).resolve("192.168.7.40").await.unwrap().unwrap();
        assert_eq!(identity.container_id(), "pinned");
    }

    #[tokio::test]
    async fn unknown_address_resolves_to_none() {
        let runtime = Arc::new(InMemoryRuntime::with_containers([InMemoryRuntime::container(
            "a", "koji-hub", "172.20.0.2",
        )]));
        let r = resolver(&runtime);
        assert!(r.resolve("10.9.9.9").await.unwrap().is_none());
        assert!(r.resolve("not-an-ip").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ipv4_mapped_source_is_normalized() {
        let runtime = Arc::new(InMemoryRuntime::with_containers([InMemoryRuntime::container(
            "a", "koji-hub", "172.20.0.2",
        )]));
        let identity = resolver(&runtime)
            .resolve("::ffff:172.20.0.2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.container_id(), "a");
    }

    #[tokio::test]
    async fn stopped_container_does_not_resolve() {
        let runtime = Arc::new(InMemoryRuntime::with_containers([InMemoryRuntime::container(
            "a", "koji-hub", "172.20.0.2",
        )]));
        runtime.stop("a");
        assert!(resolver(&runtime).resolve("172.20.0.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn runtime_failure_is_an_error() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.set_unavailable(true);
        assert!(resolver(&runtime).resolve("172.20.0.2").await.is_err());
    }

    #[tokio::test]
    async fn resolved_identity_carries_scale_index() {
        let runtime = Arc::new(InMemoryRuntime::with_containers([InMemoryRuntime::container(
            "w", "koji-worker-4", "172.20.0.4",
        )]));
        let identity = resolver(&runtime).resolve("172.20.0.4").await.unwrap().unwrap();
        assert_eq!(identity.scale_index, Some(4));
    }

    #[test]
    fn scale_index_precedence() {
        let r = resolver(&Arc::new(InMemoryRuntime::new()));

        // Reserved worker name wins over everything else.
        let mut c = named("koji-box_koji-worker-2_1");
        c.labels = BTreeMap::from([("scale_index".to_string(), "9".to_string())]);
        assert_eq!(r.scale_index(&c), Some(2));

        let mut c = named("builder");
        c.labels = BTreeMap::from([
            ("orch.scale.index".to_string(), "5".to_string()),
            ("com.docker.compose.container-number".to_string(), "1".to_string()),
        ]);
        assert_eq!(r.scale_index(&c), Some(5));

        let mut c = named("builder");
        c.labels = BTreeMap::from([(
            "io.podman.compose.container-number".to_string(),
            "3".to_string(),
        )]);
        c.env = vec!["SCALE_INDEX=8".to_string()];
        assert_eq!(r.scale_index(&c), Some(3));

        let mut c = named("builder");
        c.env = vec!["SCALE_INDEX=8".to_string()];
        assert_eq!(r.scale_index(&c), Some(8));

        assert_eq!(r.scale_index(&named("builder-6")), Some(6));
    }

    #[test]
    fn trailing_suffix_accepts_compose_v1_names() {
        let r = resolver(&Arc::new(InMemoryRuntime::new()));
        assert_eq!(r.scale_index(&named("proj_builder_2")), Some(2));
        assert_eq!(r.scale_index(&named("proj.builder.11")), Some(11));
        assert_eq!(r.scale_index(&named("proj_koji-db")), None);
        assert_eq!(r.scale_index(&named("builder2")), None);
    }

    #[test]
    fn scale_index_absent_is_none_not_zero() {
        let r = resolver(&Arc::new(InMemoryRuntime::new()));
        assert_eq!(r.scale_index(&named("koji-hub")), None);

        let mut c = named("builder");
        c.labels = BTreeMap::from([("scale_index".to_string(), "abc".to_string())]);
        assert_eq!(r.scale_index(&c), None);
    }
}
