//! Point-in-time VM state with integrity checks and retention.
//!
//! Metadata (checksums, baseline marker, restore timestamps) lives only here.
//! Snapshots refer to their VM by id; destroying a VM drops its metadata via
//! [`SnapshotManager::purge`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::SandpitError;
use crate::events::{EventSink, PoolEvent};
use crate::hypervisor::{DomainHandle, Hypervisor, HypervisorError};
use crate::vm::VirtualMachine;

pub type VmId = DomainHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Manual,
    Automatic,
    /// Taken right before a risky operation so it can be rolled back.
    PreOperation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: Uuid,
    pub vm_id: VmId,
    pub name: String,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the hypervisor's description of the captured state.
    pub checksum: String,
    seq: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
}

#[derive(Debug, Default)]
struct VmSnapshots {
    entries: Vec<Snapshot>,
    baseline: Option<Uuid>,
    last_restore: Option<DateTime<Utc>>,
}

pub struct SnapshotManager {
    hypervisor: Arc<dyn Hypervisor>,
    events: Arc<dyn EventSink>,
    policy: RetentionPolicy,
    metadata: RwLock<HashMap<VmId, VmSnapshots>>,
    /// Per-VM operation locks so no caller observes a half-applied restore.
    locks: Mutex<HashMap<VmId, Arc<tokio::sync::Mutex<()>>>>,
    seq: std::sync::atomic::AtomicU64,
}

pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

impl SnapshotManager {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        events: Arc<dyn EventSink>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            hypervisor,
            events,
            policy,
            metadata: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn lock_for(&self, vm: &VmId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(vm.clone())
            .or_default()
            .clone()
    }

    fn describe_checksum(&self, vm: &VirtualMachine, name: &str) -> Result<String, SandpitError> {
        let data = self
            .hypervisor
            .snapshot_describe(vm.id(), name)
            .map_err(|e| {
                SandpitError::hypervisor(
                    format!("failed to read snapshot '{name}' of VM '{}'", vm.name()),
                    e,
                )
            })?;
        Ok(checksum(&data))
    }

    pub async fn create(
        &self,
        vm: &VirtualMachine,
        name: &str,
        kind: SnapshotKind,
    ) -> Result<Snapshot, SandpitError> {
        let lock = self.lock_for(vm.id());
        let _guard = lock.lock().await;

        let state = vm.state();
        if !state.allows_snapshot() {
            return Err(SandpitError::InvalidTransition {
                vm: vm.name().to_string(),
                state,
                operation: "snapshot",
            });
        }
        if self.get(vm, name).is_some() {
            return Err(SandpitError::SnapshotConflict {
                vm: vm.name().to_string(),
                snapshot: name.to_string(),
            });
        }

        self.hypervisor
            .snapshot_create(vm.id(), name)
            .map_err(|e| {
                SandpitError::hypervisor(
                    format!("failed to snapshot VM '{}' as '{name}'", vm.name()),
                    e,
                )
            })?;
        let checksum = match self.describe_checksum(vm, name) {
            Ok(sum) => sum,
            Err(e) => {
                // Without a checksum the snapshot can never be restored.
                let _ = self.hypervisor.snapshot_delete(vm.id(), name);
                return Err(e);
            }
        };

        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            vm_id: vm.id().clone(),
            name: name.to_string(),
            kind,
            created_at: Utc::now(),
            checksum,
            seq: self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        };

        {
            let mut metadata = self.metadata.write().unwrap();
            let entry = metadata.entry(vm.id().clone()).or_default();
            if kind == SnapshotKind::Automatic && entry.baseline.is_none() {
                entry.baseline = Some(snapshot.id);
            }
            entry.entries.push(snapshot.clone());
        }

        tracing::info!(vm = %vm.name(), snapshot = name, ?kind, "snapshot created");
        self.events.emit(PoolEvent::SnapshotCreated {
            vm: vm.name().to_string(),
            snapshot: name.to_string(),
            kind,
        });
        Ok(snapshot)
    }

    /// Roll the VM back to `snapshot`.
    ///
    /// The stored data is re-checksummed first; on mismatch the VM is left
    /// untouched and `CorruptSnapshot` is returned.
    pub async fn restore(
        &self,
        vm: &VirtualMachine,
        snapshot: &Snapshot,
    ) -> Result<(), SandpitError> {
        let result = self.restore_inner(vm, snapshot).await;
        if let Err(e) = &result {
            self.events.emit(PoolEvent::SnapshotRestoreFailed {
                vm: vm.name().to_string(),
                snapshot: snapshot.name.clone(),
                reason: e.to_string(),
            });
        }
        result
    }

    async fn restore_inner(
        &self,
        vm: &VirtualMachine,
        snapshot: &Snapshot,
    ) -> Result<(), SandpitError> {
        let lock = self.lock_for(vm.id());
        let _guard = lock.lock().await;

        let stored = self
            .get(vm, &snapshot.name)
            .filter(|s| s.id == snapshot.id)
            .ok_or_else(|| SandpitError::SnapshotNotFound {
                vm: vm.name().to_string(),
                snapshot: snapshot.name.clone(),
            })?;

        let state = vm.state();
        if !state.allows_snapshot() {
            return Err(SandpitError::InvalidTransition {
                vm: vm.name().to_string(),
                state,
                operation: "restore",
            });
        }

        let actual = self.describe_checksum(vm, &stored.name)?;
        if actual != stored.checksum {
            tracing::error!(
                vm = %vm.name(),
                snapshot = %stored.name,
                expected = %stored.checksum,
                actual = %actual,
                "snapshot checksum mismatch, refusing restore"
            );
            return Err(SandpitError::CorruptSnapshot {
                vm: vm.name().to_string(),
                snapshot: stored.name,
                expected: stored.checksum,
                actual,
            });
        }

        self.hypervisor
            .snapshot_revert(vm.id(), &stored.name)
            .map_err(|e| {
                SandpitError::hypervisor(
                    format!(
                        "failed to restore VM '{}' to snapshot '{}'",
                        vm.name(),
                        stored.name
                    ),
                    e,
                )
            })?;

        if let Some(entry) = self.metadata.write().unwrap().get_mut(vm.id()) {
            entry.last_restore = Some(Utc::now());
        }
        tracing::info!(vm = %vm.name(), snapshot = %stored.name, "snapshot restored");
        Ok(())
    }

    /// Restore the VM's baseline snapshot.
    pub async fn restore_baseline(&self, vm: &VirtualMachine) -> Result<(), SandpitError> {
        let baseline = self
            .baseline(vm)
            .ok_or_else(|| SandpitError::SnapshotNotFound {
                vm: vm.name().to_string(),
                snapshot: "<baseline>".into(),
            })?;
        self.restore(vm, &baseline).await
    }

    pub async fn delete(
        &self,
        vm: &VirtualMachine,
        snapshot: &Snapshot,
    ) -> Result<(), SandpitError> {
        let lock = self.lock_for(vm.id());
        let _guard = lock.lock().await;

        if self.is_baseline(vm.id(), snapshot.id) {
            return Err(SandpitError::BaselineProtected {
                vm: vm.name().to_string(),
                snapshot: snapshot.name.clone(),
            });
        }
        if self.get(vm, &snapshot.name).filter(|s| s.id == snapshot.id).is_none() {
            return Err(SandpitError::SnapshotNotFound {
                vm: vm.name().to_string(),
                snapshot: snapshot.name.clone(),
            });
        }
        self.delete_unchecked(vm.id(), snapshot)
            .map_err(|e| {
                SandpitError::hypervisor(
                    format!("failed to delete snapshot '{}' of VM '{}'", snapshot.name, vm.name()),
                    e,
                )
            })
    }

    fn delete_unchecked(&self, vm: &VmId, snapshot: &Snapshot) -> Result<(), HypervisorError> {
        match self.hypervisor.snapshot_delete(vm, &snapshot.name) {
            Ok(()) | Err(HypervisorError::SnapshotNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        if let Some(entry) = self.metadata.write().unwrap().get_mut(vm) {
            entry.entries.retain(|s| s.id != snapshot.id);
        }
        tracing::debug!(vm = %vm, snapshot = %snapshot.name, "snapshot deleted");
        Ok(())
    }

    fn is_baseline(&self, vm: &VmId, id: Uuid) -> bool {
        self.metadata
            .read()
            .unwrap()
            .get(vm)
            .is_some_and(|e| e.baseline == Some(id))
    }

    /// Snapshots of `vm`, oldest first.
    pub fn list(&self, vm: &VirtualMachine) -> impl Iterator<Item = Snapshot> + use<> {
        let mut entries = self
            .metadata
            .read()
            .unwrap()
            .get(vm.id())
            .map(|e| e.entries.clone())
            .unwrap_or_default();
        entries.sort_by_key(|s| (s.created_at, s.seq));
        entries.into_iter()
    }

    pub fn get(&self, vm: &VirtualMachine, name: &str) -> Option<Snapshot> {
        self.metadata
            .read()
            .unwrap()
            .get(vm.id())
            .and_then(|e| e.entries.iter().find(|s| s.name == name).cloned())
    }

    pub fn baseline(&self, vm: &VirtualMachine) -> Option<Snapshot> {
        let metadata = self.metadata.read().unwrap();
        let entry = metadata.get(vm.id())?;
        let id = entry.baseline?;
        entry.entries.iter().find(|s| s.id == id).cloned()
    }

    /// Drop all metadata for a destroyed VM.
    pub fn purge(&self, vm: &VmId) {
        let removed = self.metadata.write().unwrap().remove(vm);
        self.locks.lock().unwrap().remove(vm);
        if let Some(entry) = removed {
            tracing::debug!(vm = %vm, count = entry.entries.len(), "snapshot metadata purged");
        }
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Apply the retention policy as of `now`. Returns the number of
    /// snapshots deleted.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let plan: Vec<(VmId, Vec<Snapshot>)> = {
            let metadata = self.metadata.read().unwrap();
            metadata
                .iter()
                .map(|(vm, entry)| (vm.clone(), expired(entry, &self.policy, now)))
                .filter(|(_, doomed)| !doomed.is_empty())
                .collect()
        };

        let mut deleted = 0;
        for (vm, doomed) in plan {
            // A missing lock means the VM was purged after planning.
            let Some(lock) = self.locks.lock().unwrap().get(&vm).cloned() else {
                continue;
            };
            let _guard = lock.lock().await;
            if !self.metadata.read().unwrap().contains_key(&vm) {
                continue;
            }
            for snapshot in doomed {
                // Re-check under the lock: the snapshot may have been
                // promoted in the meantime.
                if self.is_baseline(&vm, snapshot.id) {
                    continue;
                }
                match self.delete_unchecked(&vm, &snapshot) {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        tracing::warn!(vm = %vm, snapshot = %snapshot.name, error = %e, "retention delete failed");
                    }
                }
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, "snapshot retention sweep");
        }
        deleted
    }
}

/// Snapshots the policy would delete. The baseline and any pre-operation
/// snapshot newer than the last successful restore are never candidates.
fn expired(entry: &VmSnapshots, policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<Snapshot> {
    let mut candidates: Vec<&Snapshot> = entry
        .entries
        .iter()
        .filter(|s| entry.baseline != Some(s.id))
        .filter(|s| {
            s.kind != SnapshotKind::PreOperation
                || entry.last_restore.is_some_and(|at| s.created_at <= at)
        })
        .collect();
    candidates.sort_by_key(|s| (s.created_at, s.seq));

    let mut doomed: Vec<Snapshot> = Vec::new();
    if let Some(max_age) = policy.max_age {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        for s in &candidates {
            if now.signed_duration_since(s.created_at) > max_age {
                doomed.push((*s).clone());
            }
        }
    }

    if let Some(max_count) = policy.max_count {
        let remaining = entry.entries.len() - doomed.len();
        let mut excess = remaining.saturating_sub(max_count);
        for s in &candidates {
            if excess == 0 {
                break;
            }
            if doomed.iter().any(|d| d.id == s.id) {
                continue;
            }
            doomed.push((*s).clone());
            excess -= 1;
        }
    }
    doomed
}
