//! One hypervisor domain and its lifecycle state machine.
//!
//! ```text
//! Defined ─start─▶ Starting ─boot─▶ Running ─stop(graceful)─▶ Stopping ─ack─▶ Shutoff
//!                                   Running ─stop(hard)──────────────────────▶ Shutoff
//! any ─fault─▶ Crashed          Shutoff | Crashed | Defined ─destroy─▶ Destroyed
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::clock;
use crate::domain_xml::{NetworkMode, ResourceProfile};
use crate::error::SandpitError;
use crate::hypervisor::{DefinedDomain, DomainHandle, DomainState, Hypervisor, HypervisorError};
use crate::vm_state::VmState;

#[derive(Debug, Clone, Copy)]
pub struct VmTiming {
    pub boot_timeout: Duration,
    pub stop_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for VmTiming {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct VirtualMachine {
    handle: DomainHandle,
    name: String,
    uuid: String,
    resources: ResourceProfile,
    network_mode: NetworkMode,
    timing: VmTiming,
    hypervisor: Arc<dyn Hypervisor>,
    state: Mutex<VmState>,
    /// Serializes start/stop/destroy.
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

impl VirtualMachine {
    /// Wrap a freshly defined domain.
    pub fn new(
        domain: DefinedDomain,
        name: impl Into<String>,
        resources: ResourceProfile,
        network_mode: NetworkMode,
        timing: VmTiming,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        Self {
            handle: domain.handle,
            name: name.into(),
            uuid: domain.uuid,
            resources,
            network_mode,
            timing,
            hypervisor,
            state: Mutex::new(VmState::Defined),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &DomainHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn resources(&self) -> &ResourceProfile {
        &self.resources
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    /// Current state, refreshed from the hypervisor on every call.
    pub fn state(&self) -> VmState {
        let last = *self.state.lock().unwrap();
        if last.is_terminal() {
            return last;
        }
        // Poll unlocked: with libvirt this is a blocking RPC.
        let observed = self.hypervisor.poll(&self.handle);
        let mut current = self.state.lock().unwrap();
        if current.is_terminal() {
            return *current;
        }
        match observed {
            Ok(observed) => {
                *current = current.reconcile(observed);
            }
            Err(HypervisorError::DomainNotFound { .. }) => {
                tracing::warn!(vm = %self.name, "domain vanished from hypervisor");
                *current = VmState::Crashed;
            }
            Err(e) => {
                tracing::warn!(vm = %self.name, error = %e, "state poll failed, using last known state");
            }
        }
        *current
    }

    fn set_state(&self, next: VmState) {
        let mut current = self.state.lock().unwrap();
        tracing::debug!(vm = %self.name, from = %*current, to = %next, "vm state");
        *current = next;
    }

    fn invalid(&self, state: VmState, operation: &'static str) -> SandpitError {
        SandpitError::InvalidTransition {
            vm: self.name.clone(),
            state,
            operation,
        }
    }

    /// Boot the domain and wait until the hypervisor reports it running.
    ///
    /// A boot timeout leaves the VM `Crashed`; it is not retried in place.
    pub async fn start(&self) -> Result<(), SandpitError> {
        let _guard = self.lifecycle.lock().await;
        let current = self.state();
        if !matches!(current, VmState::Defined | VmState::Shutoff) {
            return Err(self.invalid(current, "start"));
        }

        self.set_state(VmState::Starting);
        if let Err(e) = self.hypervisor.start(&self.handle) {
            self.set_state(VmState::Crashed);
            return Err(SandpitError::hypervisor(
                format!("failed to start VM '{}'", self.name),
                e,
            ));
        }

        let deadline = clock::deadline_in(self.timing.boot_timeout);
        loop {
            match self.state() {
                VmState::Running => {
                    tracing::info!(vm = %self.name, "VM running");
                    return Ok(());
                }
                VmState::Crashed => {
                    return Err(SandpitError::hypervisor(
                        format!("VM '{}' crashed during boot", self.name),
                        HypervisorError::Refused {
                            operation: "start",
                            message: "domain crashed".into(),
                        },
                    ));
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                self.set_state(VmState::Crashed);
                tracing::warn!(vm = %self.name, timeout = ?self.timing.boot_timeout, "boot timed out");
                return Err(SandpitError::BootTimeout {
                    vm: self.name.clone(),
                    timeout: self.timing.boot_timeout,
                });
            }
            tokio::time::sleep(self.timing.poll_interval.min(deadline - now)).await;
        }
    }

    /// Stop the domain. Graceful stops fall back to a hard stop once the
    /// grace period runs out.
    pub async fn stop(&self, graceful: bool) -> Result<(), SandpitError> {
        let _guard = self.lifecycle.lock().await;
        let current = self.state();
        if !matches!(current, VmState::Running | VmState::Paused) {
            return Err(self.invalid(current, "stop"));
        }

        if graceful {
            self.set_state(VmState::Stopping);
            match self.hypervisor.stop(&self.handle, true) {
                Ok(()) => {
                    let deadline = clock::deadline_in(self.timing.stop_grace);
                    while Instant::now() < deadline {
                        if self.state() == VmState::Shutoff {
                            tracing::info!(vm = %self.name, "VM shut down");
                            return Ok(());
                        }
                        tokio::time::sleep(self.timing.poll_interval).await;
                    }
                    tracing::warn!(vm = %self.name, "graceful shutdown timed out, force stopping");
                }
                Err(e) => {
                    tracing::warn!(vm = %self.name, error = %e, "graceful shutdown refused, force stopping");
                }
            }
        }

        if let Err(e) = self.hypervisor.stop(&self.handle, false) {
            self.set_state(VmState::Crashed);
            return Err(SandpitError::hypervisor(
                format!("failed to stop VM '{}'", self.name),
                e,
            ));
        }
        match self.hypervisor.poll(&self.handle) {
            Ok(DomainState::Shutoff) => {
                self.set_state(VmState::Shutoff);
                tracing::info!(vm = %self.name, "VM force stopped");
                Ok(())
            }
            Ok(other) => {
                self.set_state(VmState::Crashed);
                Err(SandpitError::hypervisor(
                    format!("VM '{}' still {other:?} after hard stop", self.name),
                    HypervisorError::Refused {
                        operation: "stop",
                        message: "domain did not power off".into(),
                    },
                ))
            }
            Err(e) => {
                self.set_state(VmState::Crashed);
                Err(SandpitError::hypervisor(
                    format!("lost track of VM '{}' during stop", self.name),
                    e,
                ))
            }
        }
    }

    /// Force-stop if needed and undefine. Calling it again is a no-op.
    pub async fn destroy(&self) -> Result<(), SandpitError> {
        let _guard = self.lifecycle.lock().await;
        let current = self.state();
        if current.is_terminal() {
            return Ok(());
        }

        match self.hypervisor.destroy(&self.handle) {
            Ok(()) | Err(HypervisorError::DomainNotFound { .. }) => {}
            Err(e) => {
                self.set_state(VmState::Crashed);
                return Err(SandpitError::hypervisor(
                    format!("failed to power off VM '{}'", self.name),
                    e,
                ));
            }
        }
        match self.hypervisor.undefine(&self.handle) {
            Ok(()) | Err(HypervisorError::DomainNotFound { .. }) => {}
            Err(e) => {
                self.set_state(VmState::Crashed);
                return Err(SandpitError::hypervisor(
                    format!("failed to undefine VM '{}'", self.name),
                    e,
                ));
            }
        }

        self.set_state(VmState::Destroyed);
        tracing::info!(vm = %self.name, "VM destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    use crate::hypervisor::DomainSpec;
    use crate::hypervisor::sim::SimHypervisor;

    fn timing() -> VmTiming {
        VmTiming {
            boot_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
        }
    }

    fn make_vm(hv: &Arc<SimHypervisor>, name: &str) -> VirtualMachine {
        make_vm_with(hv, name, timing())
    }

    fn make_vm_with(hv: &Arc<SimHypervisor>, name: &str, timing: VmTiming) -> VirtualMachine {
        let domain = hv
            .define(&DomainSpec {
                name: name.into(),
                body: String::new(),
            })
            .unwrap();
        let hypervisor: Arc<dyn Hypervisor> = hv.clone();
        VirtualMachine::new(
            domain,
            name,
            ResourceProfile::default(),
            NetworkMode::Isolated,
            timing,
            hypervisor,
        )
    }

    /// Forwards to the simulator and counts polls made while the VM's state
    /// lock was held.
    struct WatchedPoll {
        inner: Arc<SimHypervisor>,
        vm: OnceLock<Weak<VirtualMachine>>,
        polls: AtomicUsize,
        locked_polls: AtomicUsize,
    }

    impl Hypervisor for WatchedPoll {
        fn define(&self, spec: &DomainSpec) -> Result<DefinedDomain, HypervisorError> {
            self.inner.define(spec)
        }
        fn start(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
            self.inner.start(handle)
        }
        fn stop(&self, handle: &DomainHandle, graceful: bool) -> Result<(), HypervisorError> {
            self.inner.stop(handle, graceful)
        }
        fn destroy(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
            self.inner.destroy(handle)
        }
        fn undefine(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
            self.inner.undefine(handle)
        }
        fn poll(&self, handle: &DomainHandle) -> Result<DomainState, HypervisorError> {
            if let Some(vm) = self.vm.get().and_then(Weak::upgrade) {
                self.polls.fetch_add(1, Ordering::SeqCst);
                if vm.state.try_lock().is_err() {
                    self.locked_polls.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.inner.poll(handle)
        }
        fn snapshot_create(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
            self.inner.snapshot_create(handle, name)
        }
        fn snapshot_describe(
            &self,
            handle: &DomainHandle,
            name: &str,
        ) -> Result<Vec<u8>, HypervisorError> {
            self.inner.snapshot_describe(handle, name)
        }
        fn snapshot_revert(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
            self.inner.snapshot_revert(handle, name)
        }
        fn snapshot_delete(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
            self.inner.snapshot_delete(handle, name)
        }
        fn snapshot_list(&self, handle: &DomainHandle) -> Result<Vec<String>, HypervisorError> {
            self.inner.snapshot_list(handle)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_runs_without_state_lock() {
        let hv = Arc::new(WatchedPoll {
            inner: Arc::new(SimHypervisor::new(Duration::from_secs(1))),
            vm: OnceLock::new(),
            polls: AtomicUsize::new(0),
            locked_polls: AtomicUsize::new(0),
        });
        let domain = hv
            .define(&DomainSpec {
                name: "vm-a".into(),
                body: String::new(),
            })
            .unwrap();
        let vm = Arc::new(VirtualMachine::new(
            domain,
            "vm-a",
            ResourceProfile::default(),
            NetworkMode::Isolated,
            timing(),
            hv.clone(),
        ));
        hv.vm.set(Arc::downgrade(&vm)).unwrap();

        vm.start().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert!(hv.polls.load(Ordering::SeqCst) > 0);
        assert_eq!(hv.locked_polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeouts_do_not_overflow() {
        let hv = Arc::new(SimHypervisor::new(Duration::from_secs(1)));
        let vm = make_vm_with(
            &hv,
            "vm-a",
            VmTiming {
                boot_timeout: Duration::MAX,
                stop_grace: Duration::MAX,
                poll_interval: Duration::from_millis(100),
            },
        );
        vm.start().await.unwrap();
        vm.stop(true).await.unwrap();
        assert_eq!(vm.state(), VmState::Shutoff);
    }

    #[tokio::test(start_paused = true)]
    async fn start_reaches_running() {
        let hv = Arc::new(SimHypervisor::new(Duration::from_secs(1)));
        let vm = make_vm(&hv, "vm-a");
        assert_eq!(vm.state(), VmState::Defined);
        vm.start().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn boot_timeout_crashes_vm() {
        let hv = Arc::new(SimHypervisor::new(Duration::from_secs(1)));
        hv.hang_boot(true);
        let vm = make_vm(&hv, "vm-a");
        let err = vm.start().await.unwrap_err();
        assert!(matches!(err, SandpitError::BootTimeout { .. }));
        assert_eq!(vm.state(), VmState::Crashed);
    }

    #[tokio::test(start_paused = true)]
    async fn start_from_running_is_rejected() {
        let hv = Arc::new(SimHypervisor::new(Duration::ZERO));
        let vm = make_vm(&hv, "vm-a");
        vm.start().await.unwrap();
        let err = vm.start().await.unwrap_err();
        assert!(matches!(
            err,
            SandpitError::InvalidTransition {
                state: VmState::Running,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_ends_shutoff() {
        let hv = Arc::new(SimHypervisor::new(Duration::ZERO));
        let vm = make_vm(&hv, "vm-a");
        vm.start().await.unwrap();
        vm.stop(true).await.unwrap();
        assert_eq!(vm.state(), VmState::Shutoff);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_falls_back_to_hard_stop() {
        let hv = Arc::new(SimHypervisor::new(Duration::ZERO));
        hv.ignore_shutdown(true);
        let vm = make_vm(&hv, "vm-a");
        vm.start().await.unwrap();
        let started = Instant::now();
        vm.stop(true).await.unwrap();
        assert!(started.elapsed() >= timing().stop_grace);
        assert_eq!(vm.state(), VmState::Shutoff);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_requires_running() {
        let hv = Arc::new(SimHypervisor::new(Duration::ZERO));
        let vm = make_vm(&hv, "vm-a");
        assert!(matches!(
            vm.stop(false).await,
            Err(SandpitError::InvalidTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop() {
        let hv = Arc::new(SimHypervisor::new(Duration::ZERO));
        let vm = make_vm(&hv, "vm-a");
        vm.start().await.unwrap();
        vm.stop(false).await.unwrap();
        vm.start().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent() {
        let hv = Arc::new(SimHypervisor::new(Duration::ZERO));
        let vm = make_vm(&hv, "vm-a");
        vm.start().await.unwrap();
        vm.destroy().await.unwrap();
        assert_eq!(vm.state(), VmState::Destroyed);
        assert!(!hv.is_defined(vm.id()));
        vm.destroy().await.unwrap();
        assert_eq!(vm.state(), VmState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_is_observed_by_poll() {
        let hv = Arc::new(SimHypervisor::new(Duration::ZERO));
        let vm = make_vm(&hv, "vm-a");
        vm.start().await.unwrap();
        hv.crash(vm.id());
        assert_eq!(vm.state(), VmState::Crashed);
        vm.destroy().await.unwrap();
        assert_eq!(vm.state(), VmState::Destroyed);
    }
}
