use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::guest::ChannelError;
use crate::hypervisor::HypervisorError;
use crate::vm_state::VmState;

#[derive(Debug, Error, Diagnostic)]
pub enum SandpitError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("VM '{vm}' did not reach running within {timeout:?}")]
    #[diagnostic(help("the instance is evicted; check that the guest image boots under KVM"))]
    BootTimeout { vm: String, timeout: Duration },

    #[error("snapshot '{snapshot}' of VM '{vm}' failed integrity check (expected {expected}, got {actual})")]
    #[diagnostic(help("the snapshot was modified outside sandpit; the VM was left untouched"))]
    CorruptSnapshot {
        vm: String,
        snapshot: String,
        expected: String,
        actual: String,
    },

    #[error("snapshot '{snapshot}' is the baseline of VM '{vm}' and cannot be deleted")]
    BaselineProtected { vm: String, snapshot: String },

    #[error("no VM became available within {waited:?}")]
    #[diagnostic(help("retry later with backoff, or raise pool.max_size"))]
    PoolExhausted { waited: Duration },

    #[error("pool warm-up timed out with {ready} of {wanted} slots ready")]
    WarmUpTimeout { ready: usize, wanted: usize },

    #[error("guest channel to VM '{vm}' failed")]
    TransportFailure {
        vm: String,
        #[source]
        source: ChannelError,
    },

    #[error("snapshot '{snapshot}' already exists on VM '{vm}'")]
    SnapshotConflict { vm: String, snapshot: String },

    #[error("snapshot '{snapshot}' not found on VM '{vm}'")]
    SnapshotNotFound { vm: String, snapshot: String },

    #[error("cannot {operation} VM '{vm}' while it is {state}")]
    InvalidTransition {
        vm: String,
        state: VmState,
        operation: &'static str,
    },

    #[error("invalid execution request: {message}")]
    InvalidRequest { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}")]
    #[diagnostic(help("check that the hypervisor daemon is running and reachable"))]
    Hypervisor {
        context: String,
        #[source]
        source: HypervisorError,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandpitError {
    pub fn hypervisor(context: impl Into<String>, source: HypervisorError) -> Self {
        SandpitError::Hypervisor {
            context: context.into(),
            source,
        }
    }
}
