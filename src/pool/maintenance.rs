//! Background loop that keeps the pool stocked and clean.
//!
//! One task owns every slow operation. It wakes on caller commands, worker
//! completions, and three timers (replenish, health check, retention sweep),
//! applies the resulting slot transitions, and dispatches new workers.
//! Failures here are logged and turned into evictions, never propagated.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Shared, Slot, SlotEvent, SlotId, SlotState};
use crate::clock;
use crate::error::SandpitError;
use crate::events::PoolEvent;
use crate::hypervisor::{DomainTemplate, Hypervisor};
use crate::snapshot::{SnapshotKind, SnapshotManager};
use crate::vm::VirtualMachine;
use crate::vm_state::VmState;

/// Name of the snapshot every pool VM is reset to.
const BASELINE: &str = "baseline";

#[derive(Debug)]
pub(super) enum Command {
    /// Healthy release: restore the baseline and make the slot available.
    Recycle(SlotId),
    /// Destroy the slot's VM and forget the slot.
    Evict(SlotId),
    /// Re-evaluate the pool size.
    Kick,
}

#[derive(Debug)]
enum Outcome {
    Warmed { id: SlotId },
    WarmFailed { id: SlotId, error: SandpitError },
    Recycled { id: SlotId },
    RecycleFailed { id: SlotId, error: SandpitError },
    Evicted { id: SlotId, vm: String, result: Result<(), SandpitError> },
    Swept { deleted: usize },
}

enum Wake {
    Command(Command),
    Outcome(Outcome),
    HealthCheck,
    Replenish,
    Sweep,
}

type Worker = Pin<Box<dyn Future<Output = Outcome> + Send>>;

pub(super) struct Maintenance {
    pub(super) shared: Arc<Shared>,
    pub(super) hypervisor: Arc<dyn Hypervisor>,
    pub(super) snapshots: Arc<SnapshotManager>,
    pub(super) template: Arc<dyn DomainTemplate>,
    pub(super) cancel: CancellationToken,
}

impl Maintenance {
    pub(super) async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let settings = self.shared.settings.clone();
        let mut workers: FuturesUnordered<Worker> = FuturesUnordered::new();

        let mut health = tokio::time::interval(settings.health_check_interval.min(clock::NO_EXPIRY));
        let mut replenish = tokio::time::interval(settings.replenish_interval.min(clock::NO_EXPIRY));
        let mut sweep = tokio::time::interval(settings.sweep_interval.min(clock::NO_EXPIRY));
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        replenish.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sweeping = false;
        let mut backoff_until: Option<Instant> = None;

        loop {
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => Wake::Command(command),
                Some(outcome) = workers.next() => Wake::Outcome(outcome),
                _ = health.tick() => Wake::HealthCheck,
                _ = replenish.tick() => Wake::Replenish,
                _ = sweep.tick() => Wake::Sweep,
            };

            match wake {
                Wake::Command(Command::Recycle(id)) => self.recycle(id, &mut workers),
                Wake::Command(Command::Evict(id)) => self.evict(id, &mut workers),
                Wake::Command(Command::Kick) | Wake::Replenish => {}
                Wake::Outcome(outcome) => {
                    match &outcome {
                        Outcome::Swept { .. } => sweeping = false,
                        Outcome::WarmFailed { .. } => {
                            backoff_until = Some(clock::deadline_in(settings.replenish_interval))
                        }
                        _ => {}
                    }
                    self.handle_outcome(outcome, &mut workers);
                }
                Wake::HealthCheck => self.health_check(&mut workers),
                Wake::Sweep => {
                    if !sweeping {
                        sweeping = true;
                        let snapshots = self.snapshots.clone();
                        workers.push(Box::pin(async move {
                            Outcome::Swept {
                                deleted: snapshots.sweep().await,
                            }
                        }));
                    }
                }
            }

            if backoff_until.is_none_or(|t| Instant::now() >= t) {
                backoff_until = None;
                if !self.replenish(&mut workers) {
                    backoff_until = Some(clock::deadline_in(settings.replenish_interval));
                }
            }
        }

        // In-flight workers hold VM locks; drop them before tearing down.
        drop(workers);
        self.teardown().await;
    }

    /// Start warming slots until the live count reaches its target. Returns
    /// false when a domain could not be defined.
    fn replenish(&self, workers: &mut FuturesUnordered<Worker>) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) {
            return true;
        }
        let settings = &self.shared.settings;
        let status = self.shared.status();
        // Keep one spare (or one per waiting caller) above what is in use.
        let spare = status.waiters.max(1);
        let target = settings
            .min_size
            .max(settings.max_size.min(status.in_use + spare));

        let mut live = status.live();
        while live < target {
            if !self.warm(workers) {
                return false;
            }
            live += 1;
        }
        true
    }

    fn warm(&self, workers: &mut FuturesUnordered<Worker>) -> bool {
        let settings = &self.shared.settings;
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", settings.name_prefix, &suffix[..12]);
        let spec = self
            .template
            .render(&name, &settings.resources, settings.network_mode);
        let domain = match self.hypervisor.define(&spec) {
            Ok(domain) => domain,
            Err(e) => {
                tracing::warn!(vm = %name, error = %e, "failed to define VM, backing off");
                return false;
            }
        };

        let vm = Arc::new(VirtualMachine::new(
            domain,
            name,
            settings.resources,
            settings.network_mode,
            settings.timing,
            self.hypervisor.clone(),
        ));
        let id = SlotId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let now = Instant::now();
        let ttl_deadline = clock::deadline_from(now, settings.ttl);
        self.shared.slots.lock().unwrap().insert(
            id,
            Slot {
                state: SlotState::Warming,
                vm: vm.clone(),
                created_at: now,
                ttl_deadline,
                acquired_at: None,
                busy: true,
            },
        );
        tracing::info!(slot = %id, vm = %vm.name(), "warming slot");

        let snapshots = self.snapshots.clone();
        workers.push(Box::pin(async move {
            let result = async {
                vm.start().await?;
                snapshots
                    .create(&vm, BASELINE, SnapshotKind::Automatic)
                    .await?;
                Ok::<_, SandpitError>(())
            }
            .await;
            match result {
                Ok(()) => Outcome::Warmed { id },
                Err(error) => Outcome::WarmFailed { id, error },
            }
        }));
        true
    }

    fn recycle(&self, id: SlotId, workers: &mut FuturesUnordered<Worker>) {
        let vm = {
            let mut slots = self.shared.slots.lock().unwrap();
            let Some(slot) = slots.get_mut(&id) else {
                return;
            };
            if slot.busy || slot.state != SlotState::InUse {
                return;
            }
            if Instant::now() >= slot.ttl_deadline {
                tracing::info!(slot = %id, vm = %slot.vm.name(), "TTL expired, evicting instead of restoring");
                slot.apply(id, SlotEvent::Failed);
                None
            } else {
                slot.busy = true;
                Some(slot.vm.clone())
            }
        };
        let Some(vm) = vm else {
            self.evict(id, workers);
            return;
        };

        let snapshots = self.snapshots.clone();
        workers.push(Box::pin(async move {
            let result = async {
                snapshots.restore_baseline(&vm).await?;
                match vm.state() {
                    VmState::Running => Ok::<(), SandpitError>(()),
                    state => Err(SandpitError::InvalidTransition {
                        vm: vm.name().to_string(),
                        state,
                        operation: "recycle",
                    }),
                }
            }
            .await;
            match result {
                Ok(()) => Outcome::Recycled { id },
                Err(error) => Outcome::RecycleFailed { id, error },
            }
        }));
    }

    fn evict(&self, id: SlotId, workers: &mut FuturesUnordered<Worker>) {
        let vm = {
            let mut slots = self.shared.slots.lock().unwrap();
            let Some(slot) = slots.get_mut(&id) else {
                return;
            };
            if slot.busy {
                return;
            }
            if slot.state.is_live() {
                slot.apply(id, SlotEvent::Failed);
            }
            slot.busy = true;
            slot.vm.clone()
        };
        tracing::info!(slot = %id, vm = %vm.name(), "evicting slot");

        let snapshots = self.snapshots.clone();
        workers.push(Box::pin(async move {
            snapshots.purge(vm.id());
            let result = vm.destroy().await;
            Outcome::Evicted {
                id,
                vm: vm.name().to_string(),
                result,
            }
        }));
    }

    fn handle_outcome(&self, outcome: Outcome, workers: &mut FuturesUnordered<Worker>) {
        match outcome {
            Outcome::Warmed { id } => {
                let vm = self.settle(id, SlotEvent::Booted);
                if let Some(vm) = vm {
                    self.shared.events.emit(PoolEvent::VmStarted { vm });
                    self.shared.changed.notify_waiters();
                }
            }
            Outcome::WarmFailed { id, error } => {
                tracing::warn!(slot = %id, error = %error, "slot failed to warm");
                self.settle(id, SlotEvent::Failed);
                self.evict(id, workers);
            }
            Outcome::Recycled { id } => {
                let expired = self
                    .shared
                    .slots
                    .lock()
                    .unwrap()
                    .get(&id)
                    .is_some_and(|s| Instant::now() >= s.ttl_deadline);
                let event = if expired {
                    SlotEvent::Failed
                } else {
                    SlotEvent::Restored
                };
                if self.settle(id, event).is_some() && !expired {
                    self.shared.changed.notify_waiters();
                } else {
                    self.evict(id, workers);
                }
            }
            Outcome::RecycleFailed { id, error } => {
                tracing::warn!(slot = %id, error = %error, "baseline restore failed, evicting");
                self.settle(id, SlotEvent::Failed);
                self.evict(id, workers);
            }
            Outcome::Evicted { id, vm, result } => match result {
                Ok(()) => {
                    self.shared.slots.lock().unwrap().remove(&id);
                    self.shared.events.emit(PoolEvent::VmDestroyed { vm });
                }
                Err(e) => {
                    // Left unhealthy; the next health check retries.
                    tracing::error!(slot = %id, %vm, error = %e, "failed to destroy VM");
                    if let Some(slot) = self.shared.slots.lock().unwrap().get_mut(&id) {
                        slot.busy = false;
                    }
                }
            },
            Outcome::Swept { deleted } => {
                tracing::debug!(deleted, "retention sweep finished");
            }
        }
    }

    /// Clear the busy flag and apply `event`. Returns the VM name when the
    /// transition was valid.
    fn settle(&self, id: SlotId, event: SlotEvent) -> Option<String> {
        let mut slots = self.shared.slots.lock().unwrap();
        let slot = slots.get_mut(&id)?;
        slot.busy = false;
        slot.apply(id, event).then(|| slot.vm.name().to_string())
    }

    /// Demote available slots whose VM stopped running or outlived its TTL,
    /// and retry evictions that failed earlier.
    fn health_check(&self, workers: &mut FuturesUnordered<Worker>) {
        let now = Instant::now();
        let (candidates, retries): (Vec<_>, Vec<_>) = {
            let slots = self.shared.slots.lock().unwrap();
            let candidates = slots
                .iter()
                .filter(|(_, s)| s.state == SlotState::Available && !s.busy)
                .map(|(id, s)| (*id, s.vm.clone(), s.ttl_deadline))
                .collect();
            let retries = slots
                .iter()
                .filter(|(_, s)| s.state == SlotState::Unhealthy && !s.busy)
                .map(|(id, _)| *id)
                .collect();
            (candidates, retries)
        };

        for (id, vm, ttl_deadline) in candidates {
            let reason = if now >= ttl_deadline {
                "ttl expired".to_string()
            } else {
                match vm.state() {
                    VmState::Running => continue,
                    state => format!("VM is {state}"),
                }
            };
            let demoted = {
                let mut slots = self.shared.slots.lock().unwrap();
                match slots.get_mut(&id) {
                    Some(slot) if slot.state == SlotState::Available && !slot.busy => {
                        slot.apply(id, SlotEvent::Failed)
                    }
                    _ => false,
                }
            };
            if demoted {
                tracing::warn!(slot = %id, vm = %vm.name(), %reason, "health check failed");
                self.evict(id, workers);
            }
        }

        for id in retries {
            self.evict(id, workers);
        }
    }

    async fn teardown(&self) {
        let slots = std::mem::take(&mut *self.shared.slots.lock().unwrap());
        tracing::info!(count = slots.len(), "shutting down pool");
        for (id, slot) in slots {
            self.snapshots.purge(slot.vm.id());
            match slot.vm.destroy().await {
                Ok(()) => self.shared.events.emit(PoolEvent::VmDestroyed {
                    vm: slot.vm.name().to_string(),
                }),
                Err(e) => {
                    tracing::error!(slot = %id, vm = %slot.vm.name(), error = %e, "failed to destroy VM during shutdown")
                }
            }
        }
        self.shared.changed.notify_waiters();
    }
}
