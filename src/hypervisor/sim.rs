//! In-memory hypervisor.
//!
//! Backs `--simulate` runs and the test suite. Domains boot after a
//! configurable delay (measured on the tokio clock, so paused-time tests
//! control it), snapshots capture a per-domain "disk generation" counter that
//! the simulated guest channel bumps whenever code runs, and faults can be
//! injected per domain.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::{DefinedDomain, DomainHandle, DomainSpec, DomainState, Hypervisor, HypervisorError};

#[derive(Debug, Clone)]
struct SimSnapshot {
    generation: u64,
    state: DomainState,
    description: Vec<u8>,
}

#[derive(Debug)]
struct SimDomain {
    uuid: String,
    state: DomainState,
    ready_at: Option<Instant>,
    generation: u64,
    snapshots: BTreeMap<String, SimSnapshot>,
}

#[derive(Debug, Default)]
struct Faults {
    hang_boot: bool,
    fail_start: bool,
    fail_revert: bool,
    ignore_shutdown: bool,
}

pub struct SimHypervisor {
    domains: Mutex<HashMap<DomainHandle, SimDomain>>,
    boot_delay: Mutex<Duration>,
    faults: Mutex<Faults>,
    next_uuid: AtomicU64,
    defined_total: AtomicU64,
}

impl SimHypervisor {
    pub fn new(boot_delay: Duration) -> Self {
        Self {
            domains: Mutex::new(HashMap::new()),
            boot_delay: Mutex::new(boot_delay),
            faults: Mutex::new(Faults::default()),
            next_uuid: AtomicU64::new(1),
            defined_total: AtomicU64::new(0),
        }
    }

    pub fn set_boot_delay(&self, delay: Duration) {
        *self.boot_delay.lock().unwrap() = delay;
    }

    /// Started domains never report running.
    pub fn hang_boot(&self, hang: bool) {
        self.faults.lock().unwrap().hang_boot = hang;
    }

    pub fn fail_start(&self, fail: bool) {
        self.faults.lock().unwrap().fail_start = fail;
    }

    pub fn fail_revert(&self, fail: bool) {
        self.faults.lock().unwrap().fail_revert = fail;
    }

    /// Guests ignore ACPI shutdown requests.
    pub fn ignore_shutdown(&self, ignore: bool) {
        self.faults.lock().unwrap().ignore_shutdown = ignore;
    }

    /// Simulate guest writes: bump the domain's disk generation.
    pub fn mark_dirty(&self, handle: &DomainHandle) {
        if let Some(d) = self.domains.lock().unwrap().get_mut(handle) {
            d.generation += 1;
        }
    }

    pub fn generation(&self, handle: &DomainHandle) -> Option<u64> {
        self.domains.lock().unwrap().get(handle).map(|d| d.generation)
    }

    /// Force the domain into the crashed state.
    pub fn crash(&self, handle: &DomainHandle) {
        if let Some(d) = self.domains.lock().unwrap().get_mut(handle) {
            d.state = DomainState::Crashed;
            d.ready_at = None;
        }
    }

    /// Modify a snapshot's stored data behind the snapshot manager's back.
    pub fn tamper_snapshot(&self, handle: &DomainHandle, name: &str) -> bool {
        let mut domains = self.domains.lock().unwrap();
        match domains.get_mut(handle).and_then(|d| d.snapshots.get_mut(name)) {
            Some(snap) => {
                snap.description.extend_from_slice(b"\ntampered");
                true
            }
            None => false,
        }
    }

    pub fn is_defined(&self, handle: &DomainHandle) -> bool {
        self.domains.lock().unwrap().contains_key(handle)
    }

    pub fn defined_count(&self) -> usize {
        self.domains.lock().unwrap().len()
    }

    /// Domains ever defined, including undefined ones.
    pub fn defined_total(&self) -> u64 {
        self.defined_total.load(Ordering::SeqCst)
    }

    fn with_domain<T>(
        &self,
        handle: &DomainHandle,
        f: impl FnOnce(&mut SimDomain) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| HypervisorError::DomainNotFound {
                handle: handle.to_string(),
            })?;
        f(domain)
    }
}

impl Default for SimHypervisor {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

impl SimDomain {
    /// Promote a booting domain once its boot delay has elapsed.
    fn settle(&mut self) {
        if let Some(ready_at) = self.ready_at
            && Instant::now() >= ready_at
        {
            self.state = DomainState::Running;
            self.ready_at = None;
        }
    }
}

impl Hypervisor for SimHypervisor {
    fn define(&self, spec: &DomainSpec) -> Result<DefinedDomain, HypervisorError> {
        let handle = DomainHandle::new(&spec.name);
        let mut domains = self.domains.lock().unwrap();
        if domains.contains_key(&handle) {
            return Err(HypervisorError::Refused {
                operation: "define",
                message: format!("domain '{}' already exists", spec.name),
            });
        }
        let n = self.next_uuid.fetch_add(1, Ordering::SeqCst);
        let uuid = format!("00000000-0000-4000-8000-{n:012x}");
        domains.insert(
            handle.clone(),
            SimDomain {
                uuid: uuid.clone(),
                state: DomainState::Shutoff,
                ready_at: None,
                generation: 0,
                snapshots: BTreeMap::new(),
            },
        );
        self.defined_total.fetch_add(1, Ordering::SeqCst);
        Ok(DefinedDomain { handle, uuid })
    }

    fn start(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
        let (fail, hang) = {
            let faults = self.faults.lock().unwrap();
            (faults.fail_start, faults.hang_boot)
        };
        let delay = *self.boot_delay.lock().unwrap();
        self.with_domain(handle, |d| {
            if fail {
                return Err(HypervisorError::Refused {
                    operation: "start",
                    message: "injected start failure".into(),
                });
            }
            if d.state != DomainState::Shutoff {
                return Err(HypervisorError::Refused {
                    operation: "start",
                    message: format!("domain is {:?}", d.state),
                });
            }
            d.state = DomainState::NoState;
            d.ready_at = if hang { None } else { Some(crate::clock::deadline_in(delay)) };
            Ok(())
        })
    }

    fn stop(&self, handle: &DomainHandle, graceful: bool) -> Result<(), HypervisorError> {
        let ignore = self.faults.lock().unwrap().ignore_shutdown;
        self.with_domain(handle, |d| {
            if graceful && ignore {
                return Ok(());
            }
            d.state = DomainState::Shutoff;
            d.ready_at = None;
            Ok(())
        })
    }

    fn destroy(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
        self.with_domain(handle, |d| {
            d.state = DomainState::Shutoff;
            d.ready_at = None;
            Ok(())
        })
    }

    fn undefine(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
        let mut domains = self.domains.lock().unwrap();
        match domains.get(handle) {
            None => Err(HypervisorError::DomainNotFound {
                handle: handle.to_string(),
            }),
            Some(d) if d.state != DomainState::Shutoff && d.state != DomainState::Crashed => {
                Err(HypervisorError::Refused {
                    operation: "undefine",
                    message: "domain is still active".into(),
                })
            }
            Some(_) => {
                domains.remove(handle);
                Ok(())
            }
        }
    }

    fn poll(&self, handle: &DomainHandle) -> Result<DomainState, HypervisorError> {
        self.with_domain(handle, |d| {
            d.settle();
            Ok(d.state)
        })
    }

    fn snapshot_create(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
        self.with_domain(handle, |d| {
            d.settle();
            if !matches!(d.state, DomainState::Running | DomainState::Shutoff) {
                return Err(HypervisorError::Refused {
                    operation: "snapshot create",
                    message: format!("domain is {:?}", d.state),
                });
            }
            if d.snapshots.contains_key(name) {
                return Err(HypervisorError::Refused {
                    operation: "snapshot create",
                    message: format!("snapshot '{name}' exists"),
                });
            }
            let description = format!(
                "snapshot={name}\ndomain={}\ngeneration={}\nstate={:?}\n",
                d.uuid, d.generation, d.state
            )
            .into_bytes();
            d.snapshots.insert(
                name.to_string(),
                SimSnapshot {
                    generation: d.generation,
                    state: d.state,
                    description,
                },
            );
            Ok(())
        })
    }

    fn snapshot_describe(
        &self,
        handle: &DomainHandle,
        name: &str,
    ) -> Result<Vec<u8>, HypervisorError> {
        self.with_domain(handle, |d| {
            d.snapshots
                .get(name)
                .map(|s| s.description.clone())
                .ok_or_else(|| HypervisorError::SnapshotNotFound {
                    handle: handle.to_string(),
                    snapshot: name.to_string(),
                })
        })
    }

    fn snapshot_revert(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
        let fail = self.faults.lock().unwrap().fail_revert;
        self.with_domain(handle, |d| {
            if fail {
                return Err(HypervisorError::Refused {
                    operation: "snapshot revert",
                    message: "injected revert failure".into(),
                });
            }
            let snap = d
                .snapshots
                .get(name)
                .ok_or_else(|| HypervisorError::SnapshotNotFound {
                    handle: handle.to_string(),
                    snapshot: name.to_string(),
                })?;
            d.generation = snap.generation;
            d.state = snap.state;
            d.ready_at = None;
            Ok(())
        })
    }

    fn snapshot_delete(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
        self.with_domain(handle, |d| match d.snapshots.remove(name) {
            Some(_) => Ok(()),
            None => Err(HypervisorError::SnapshotNotFound {
                handle: handle.to_string(),
                snapshot: name.to_string(),
            }),
        })
    }

    fn snapshot_list(&self, handle: &DomainHandle) -> Result<Vec<String>, HypervisorError> {
        self.with_domain(handle, |d| Ok(d.snapshots.keys().cloned().collect()))
    }
}
