//! Capability interface to the hypervisor management daemon.
//!
//! Everything above this module talks to the hypervisor through
//! `Arc<dyn Hypervisor>`, injected at construction time. Calls are
//! synchronous and either succeed or fail with a typed [`HypervisorError`].

#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod sim;

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain_xml::{NetworkMode, ResourceProfile};

/// Opaque reference to a defined domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainHandle(String);

impl DomainHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque domain description produced by a [`DomainTemplate`] and consumed
/// by [`Hypervisor::define`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    pub body: String,
}

/// What `define` hands back: the handle plus the hypervisor-assigned UUID.
#[derive(Debug, Clone)]
pub struct DefinedDomain {
    pub handle: DomainHandle,
    pub uuid: String,
}

/// Coarse domain state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
}

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum HypervisorError {
    #[error("hypervisor connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("domain '{handle}' not found")]
    DomainNotFound { handle: String },

    #[error("snapshot '{snapshot}' not found on domain '{handle}'")]
    SnapshotNotFound { handle: String, snapshot: String },

    #[error("hypervisor refused {operation}: {message}")]
    Refused {
        operation: &'static str,
        message: String,
    },
}

pub trait Hypervisor: Send + Sync {
    fn define(&self, spec: &DomainSpec) -> Result<DefinedDomain, HypervisorError>;
    fn start(&self, handle: &DomainHandle) -> Result<(), HypervisorError>;
    /// Graceful stop asks the guest to power off; non-graceful pulls the plug.
    fn stop(&self, handle: &DomainHandle, graceful: bool) -> Result<(), HypervisorError>;
    /// Hard power-off. Succeeds if the domain is already off.
    fn destroy(&self, handle: &DomainHandle) -> Result<(), HypervisorError>;
    fn undefine(&self, handle: &DomainHandle) -> Result<(), HypervisorError>;
    fn poll(&self, handle: &DomainHandle) -> Result<DomainState, HypervisorError>;

    fn snapshot_create(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError>;
    /// Serialized description of the captured state. Stable for an
    /// unmodified snapshot; this is what integrity checksums cover.
    fn snapshot_describe(&self, handle: &DomainHandle, name: &str)
    -> Result<Vec<u8>, HypervisorError>;
    fn snapshot_revert(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError>;
    fn snapshot_delete(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError>;
    fn snapshot_list(&self, handle: &DomainHandle) -> Result<Vec<String>, HypervisorError>;
}

/// Maps a resource/network profile to a hypervisor domain description.
pub trait DomainTemplate: Send + Sync {
    fn render(&self, name: &str, resources: &ResourceProfile, network: NetworkMode) -> DomainSpec;
}
