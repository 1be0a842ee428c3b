//! orch-runtime: read-only access to the container engine.
//!
//! The broker authenticates callers by network identity. This crate turns
//! a source address into the running container behind it
//! ([`IdentityResolver`]) using one of two interchangeable engine clients:
//!
//! - [`DockerRuntime`] talks to the engine API over its unix socket.
//! - [`PodmanRuntime`] shells out to the `podman` CLI and parses its JSON.
//!
//! [`InMemoryRuntime`] is a scripted inventory for tests and local runs.

pub mod docker;
pub mod error;
pub mod memory;
pub mod podman;
pub mod resolver;
pub mod runtime;

pub use docker::DockerRuntime;
pub use error::{RuntimeError, RuntimeResult};
pub use memory::InMemoryRuntime;
pub use podman::PodmanRuntime;
pub use resolver::{CallerIdentity, IdentityResolver};
pub use runtime::ContainerRuntime;
