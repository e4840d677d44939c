//! Shared vocabulary for VM lifecycle state.
//!
//! `VmState` is what the rest of the crate reasons about. The hypervisor only
//! reports a coarse [`DomainState`]; [`VmState::reconcile`] folds that report
//! into the lifecycle phase a `VirtualMachine` is currently driving.

use std::fmt;

use crate::hypervisor::DomainState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    /// Domain is defined but has never been started.
    Defined,
    /// Start was issued; waiting for the hypervisor to report running.
    Starting,
    Running,
    Paused,
    /// Graceful shutdown requested; waiting for the guest to power off.
    Stopping,
    Shutoff,
    /// Unrecoverable fault. Only `destroy` is meaningful from here.
    Crashed,
    /// Domain undefined. Terminal.
    Destroyed,
}

impl VmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Destroyed)
    }

    /// States in which the domain consumes host resources.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            VmState::Starting | VmState::Running | VmState::Paused | VmState::Stopping
        )
    }

    /// States a snapshot may be taken or restored in.
    pub fn allows_snapshot(self) -> bool {
        matches!(self, VmState::Running | VmState::Shutoff)
    }

    /// Fold a fresh hypervisor observation into the current lifecycle phase.
    ///
    /// In-flight phases (`Starting`, `Stopping`) stick until the hypervisor
    /// reports the state they are waiting for, and a domain that has never
    /// been started stays `Defined` rather than `Shutoff`.
    pub fn reconcile(self, observed: DomainState) -> VmState {
        match (self, observed) {
            (VmState::Destroyed, _) => VmState::Destroyed,
            (_, DomainState::Crashed) => VmState::Crashed,
            (VmState::Starting, DomainState::Running) => VmState::Running,
            (VmState::Starting, _) => VmState::Starting,
            (VmState::Stopping, DomainState::Shutoff) => VmState::Shutoff,
            (VmState::Stopping, _) => VmState::Stopping,
            (VmState::Defined, DomainState::Shutoff | DomainState::NoState) => VmState::Defined,
            (_, DomainState::Running) => VmState::Running,
            (_, DomainState::Paused) => VmState::Paused,
            (_, DomainState::ShuttingDown) => VmState::Stopping,
            (_, DomainState::Shutoff) => VmState::Shutoff,
            (current, DomainState::NoState) => current,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Defined => "defined",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Stopping => "stopping",
            VmState::Shutoff => "shut off",
            VmState::Crashed => "crashed",
            VmState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}
