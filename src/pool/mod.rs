//! Warm pool of ready VMs.
//!
//! Slot bookkeeping lives under one short-lived lock; every state change goes
//! through [`slot::transition`]. All slow work (boot, restore, destroy,
//! retention) runs in the background loop in [`maintenance`], which callers
//! talk to through a command channel so `release` never blocks.

mod maintenance;
pub mod slot;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::domain_xml::{NetworkMode, ResourceProfile};
use crate::error::SandpitError;
use crate::events::{EventSink, PoolEvent};
use crate::hypervisor::{DomainTemplate, Hypervisor};
use crate::snapshot::SnapshotManager;
use crate::vm::{VirtualMachine, VmTiming};

pub use slot::{SlotEvent, SlotState};

use maintenance::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    /// A VM older than this is destroyed instead of being restored.
    pub ttl: Duration,
    pub health_check_interval: Duration,
    pub replenish_interval: Duration,
    pub sweep_interval: Duration,
    pub name_prefix: String,
    pub resources: ResourceProfile,
    pub network_mode: NetworkMode,
    pub timing: VmTiming,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 5,
            ttl: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(10),
            replenish_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(300),
            name_prefix: "sandpit".into(),
            resources: ResourceProfile::default(),
            network_mode: NetworkMode::default(),
            timing: VmTiming::default(),
        }
    }
}

/// Slot counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub warming: usize,
    pub available: usize,
    pub in_use: usize,
    pub unhealthy: usize,
    /// Callers currently blocked in `acquire`.
    pub waiters: usize,
}

impl PoolStatus {
    pub fn live(&self) -> usize {
        self.warming + self.available + self.in_use
    }
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub id: SlotId,
    pub state: SlotState,
    pub vm: String,
    pub created_at: Instant,
    pub acquired_at: Option<Instant>,
    pub ttl_deadline: Instant,
}

struct Slot {
    state: SlotState,
    vm: Arc<VirtualMachine>,
    created_at: Instant,
    ttl_deadline: Instant,
    acquired_at: Option<Instant>,
    /// A background worker currently owns this slot's VM.
    busy: bool,
}

impl Slot {
    fn apply(&mut self, id: SlotId, event: SlotEvent) -> bool {
        match slot::transition(self.state, event) {
            Some(next) => {
                tracing::debug!(%id, vm = %self.vm.name(), from = %self.state, to = %next, ?event, "slot transition");
                self.state = next;
                true
            }
            None => {
                tracing::warn!(%id, vm = %self.vm.name(), state = %self.state, ?event, "ignored invalid slot transition");
                false
            }
        }
    }
}

/// State shared between the pool handle, leases, and the background loop.
struct Shared {
    settings: PoolSettings,
    slots: Mutex<BTreeMap<SlotId, Slot>>,
    /// Fired whenever a slot becomes available or the pool closes.
    changed: Notify,
    waiters: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<dyn EventSink>,
}

impl Shared {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("pool loop has exited, dropping command");
        }
    }

    fn status(&self) -> PoolStatus {
        let slots = self.slots.lock().unwrap();
        let mut status = PoolStatus {
            waiters: self.waiters.load(Ordering::SeqCst),
            ..PoolStatus::default()
        };
        for slot in slots.values() {
            match slot.state {
                SlotState::Warming => status.warming += 1,
                SlotState::Available => status.available += 1,
                SlotState::InUse => status.in_use += 1,
                SlotState::Unhealthy => status.unhealthy += 1,
            }
        }
        status
    }

    /// Claim one available slot, if any.
    fn try_take(self: &Arc<Self>) -> Option<PoolSlot> {
        let now = Instant::now();
        let lease = {
            let mut slots = self.slots.lock().unwrap();
            let (id, slot) = slots.iter_mut().find(|(_, s)| {
                s.state == SlotState::Available && !s.busy && now < s.ttl_deadline
            })?;
            let id = *id;
            if !slot.apply(id, SlotEvent::Acquired) {
                return None;
            }
            slot.acquired_at = Some(now);
            PoolSlot {
                id,
                vm: slot.vm.clone(),
                acquired_at: now,
                shared: self.clone(),
                armed: true,
            }
        };
        self.events.emit(PoolEvent::SlotAcquired {
            slot: lease.id,
            vm: lease.vm.name().to_string(),
        });
        // Replace the spare that was just taken.
        self.send(Command::Kick);
        Some(lease)
    }

    fn finish(&self, id: SlotId, healthy: bool) {
        let vm = {
            let mut slots = self.slots.lock().unwrap();
            let Some(slot) = slots.get_mut(&id) else {
                return;
            };
            if slot.state != SlotState::InUse {
                return;
            }
            slot.acquired_at = None;
            if !healthy {
                slot.apply(id, SlotEvent::Failed);
            }
            slot.vm.name().to_string()
        };
        self.events.emit(PoolEvent::SlotReleased {
            slot: id,
            vm,
            healthy,
        });
        self.send(if healthy {
            Command::Recycle(id)
        } else {
            Command::Evict(id)
        });
    }
}

/// Counts a caller as waiting for the lifetime of an `acquire`.
struct Waiting<'a>(&'a Shared);

impl<'a> Waiting<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.waiters.fetch_add(1, Ordering::SeqCst);
        shared.send(Command::Kick);
        Self(shared)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive lease on one pool VM.
///
/// Give it back with [`VmPool::release`]. A lease that is dropped without
/// being released counts as an unhealthy release and its VM is destroyed.
pub struct PoolSlot {
    id: SlotId,
    vm: Arc<VirtualMachine>,
    acquired_at: Instant,
    shared: Arc<Shared>,
    armed: bool,
}

impl PoolSlot {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn vm(&self) -> &Arc<VirtualMachine> {
        &self.vm
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    fn finish(mut self, healthy: bool) {
        self.armed = false;
        self.shared.finish(self.id, healthy);
    }
}

impl fmt::Debug for PoolSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSlot")
            .field("id", &self.id)
            .field("vm", &self.vm.name())
            .finish()
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(slot = %self.id, vm = %self.vm.name(), "lease dropped without release, evicting");
            self.shared.finish(self.id, false);
        }
    }
}

pub struct VmPool {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VmPool {
    /// Start the pool and its background loop. Slots begin warming
    /// immediately; use [`warm_up`](Self::warm_up) to wait for them.
    pub fn start(
        settings: PoolSettings,
        hypervisor: Arc<dyn Hypervisor>,
        snapshots: Arc<SnapshotManager>,
        template: Arc<dyn DomainTemplate>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tracing::info!(
            min_size = settings.min_size,
            max_size = settings.max_size,
            network = %settings.network_mode,
            "starting VM pool"
        );
        let shared = Arc::new(Shared {
            settings,
            slots: Mutex::new(BTreeMap::new()),
            changed: Notify::new(),
            waiters: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            commands,
            events,
        });
        let runner = maintenance::Maintenance {
            shared: shared.clone(),
            hypervisor,
            snapshots,
            template,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(runner.run(command_rx));
        Self {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// Take exclusive ownership of an available VM, waiting up to `timeout`.
    ///
    /// A zero timeout checks once and never waits. Dropping the returned
    /// future gives up the wait without side effects.
    pub async fn acquire(&self, timeout: Duration) -> Result<PoolSlot, SandpitError> {
        let started = Instant::now();
        let deadline = clock::deadline_from(started, timeout);
        let _waiting = Waiting::new(&self.shared);

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // wait still wakes us.
            notified.as_mut().enable();

            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(SandpitError::PoolExhausted {
                    waited: started.elapsed(),
                });
            }
            if let Some(lease) = self.shared.try_take() {
                tracing::debug!(slot = %lease.id, vm = %lease.vm.name(), "slot acquired");
                return Ok(lease);
            }
            if timeout.is_zero()
                || tokio::time::timeout_at(deadline, notified).await.is_err()
            {
                let waited = started.elapsed();
                tracing::debug!(?waited, "acquire timed out");
                return Err(SandpitError::PoolExhausted { waited });
            }
        }
    }

    /// Hand a lease back. Never blocks: healthy slots are restored to their
    /// baseline in the background, unhealthy ones are destroyed and replaced.
    pub fn release(&self, slot: PoolSlot, healthy: bool) {
        slot.finish(healthy);
    }

    /// Wait until at least `min_size` slots are available.
    pub async fn warm_up(&self, timeout: Duration) -> Result<(), SandpitError> {
        let deadline = clock::deadline_in(timeout);
        let wanted = self.shared.settings.min_size;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = self.shared.status().available;
            if ready >= wanted {
                tracing::info!(ready, "pool warm");
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let ready = self.shared.status().available;
                return Err(SandpitError::WarmUpTimeout { ready, wanted });
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        self.shared
            .slots
            .lock()
            .unwrap()
            .iter()
            .map(|(id, s)| SlotInfo {
                id: *id,
                state: s.state,
                vm: s.vm.name().to_string(),
                created_at: s.created_at,
                acquired_at: s.acquired_at,
                ttl_deadline: s.ttl_deadline,
            })
            .collect()
    }

    /// Stop the background loop and destroy every VM, including leased ones.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.changed.notify_waiters();
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "pool loop panicked");
        }
    }
}

impl Drop for VmPool {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}
