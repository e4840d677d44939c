use std::sync::Mutex;

use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;
use virt::error as virt_error;

use super::{DefinedDomain, DomainHandle, DomainSpec, DomainState, Hypervisor, HypervisorError};

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// Hypervisor backed by a libvirt connection (`qemu:///system` by default).
pub struct LibvirtHypervisor {
    uri: String,
    conn: Mutex<ConnGuard>,
}

impl LibvirtHypervisor {
    pub fn connect(uri: &str) -> Result<Self, HypervisorError> {
        // Suppress libvirt's default error handler that prints to stderr.
        // Errors are only surfaced through Result types.
        virt_error::clear_error_callback();

        let conn = Connect::open(Some(uri)).map_err(|e| HypervisorError::ConnectionLost {
            message: format!("failed to connect to {uri}: {e}"),
        })?;
        tracing::info!(uri, "connected to libvirt");
        Ok(Self {
            uri: uri.to_string(),
            conn: Mutex::new(ConnGuard(conn)),
        })
    }

    fn domain(&self, handle: &DomainHandle) -> Result<Domain, HypervisorError> {
        let conn = self.conn.lock().unwrap();
        if !conn.is_alive().unwrap_or(false) {
            return Err(HypervisorError::ConnectionLost {
                message: format!("connection to {} is no longer alive", self.uri),
            });
        }
        Domain::lookup_by_name(&conn, handle.as_str()).map_err(|_| {
            HypervisorError::DomainNotFound {
                handle: handle.to_string(),
            }
        })
    }

    fn snapshot(&self, handle: &DomainHandle, name: &str) -> Result<DomainSnapshot, HypervisorError> {
        let dom = self.domain(handle)?;
        DomainSnapshot::lookup_by_name(&dom, name, 0).map_err(|_| {
            HypervisorError::SnapshotNotFound {
                handle: handle.to_string(),
                snapshot: name.to_string(),
            }
        })
    }
}

fn refused(operation: &'static str, e: virt_error::Error) -> HypervisorError {
    HypervisorError::Refused {
        operation,
        message: e.to_string(),
    }
}

fn map_state(raw: virt::sys::virDomainState) -> DomainState {
    match raw {
        virt::sys::VIR_DOMAIN_RUNNING | virt::sys::VIR_DOMAIN_BLOCKED => DomainState::Running,
        virt::sys::VIR_DOMAIN_PAUSED | virt::sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Paused,
        virt::sys::VIR_DOMAIN_SHUTDOWN => DomainState::ShuttingDown,
        virt::sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
        virt::sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
        _ => DomainState::NoState,
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn define(&self, spec: &DomainSpec) -> Result<DefinedDomain, HypervisorError> {
        let conn = self.conn.lock().unwrap();
        let dom = Domain::define_xml(&conn, &spec.body).map_err(|e| refused("define", e))?;
        let uuid = dom.get_uuid_string().map_err(|e| refused("define", e))?;
        tracing::info!(name = %spec.name, %uuid, "domain defined");
        Ok(DefinedDomain {
            handle: DomainHandle::new(&spec.name),
            uuid,
        })
    }

    fn start(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
        let dom = self.domain(handle)?;
        dom.create().map_err(|e| refused("start", e))?;
        Ok(())
    }

    fn stop(&self, handle: &DomainHandle, graceful: bool) -> Result<(), HypervisorError> {
        let dom = self.domain(handle)?;
        if graceful {
            dom.shutdown().map_err(|e| refused("shutdown", e))?;
        } else {
            dom.destroy().map_err(|e| refused("destroy", e))?;
        }
        Ok(())
    }

    fn destroy(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
        let dom = self.domain(handle)?;
        if dom.is_active().unwrap_or(false) {
            dom.destroy().map_err(|e| refused("destroy", e))?;
        }
        Ok(())
    }

    fn undefine(&self, handle: &DomainHandle) -> Result<(), HypervisorError> {
        let dom = self.domain(handle)?;
        dom.undefine_flags(virt::sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA)
            .map_err(|e| refused("undefine", e))?;
        Ok(())
    }

    fn poll(&self, handle: &DomainHandle) -> Result<DomainState, HypervisorError> {
        let dom = self.domain(handle)?;
        let (state, _reason) = dom.get_state().map_err(|e| refused("poll", e))?;
        Ok(map_state(state))
    }

    fn snapshot_create(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
        let dom = self.domain(handle)?;
        let xml = format!("<domainsnapshot><name>{name}</name></domainsnapshot>");
        DomainSnapshot::create_xml(&dom, &xml, 0).map_err(|e| refused("snapshot create", e))?;
        Ok(())
    }

    fn snapshot_describe(
        &self,
        handle: &DomainHandle,
        name: &str,
    ) -> Result<Vec<u8>, HypervisorError> {
        let snap = self.snapshot(handle, name)?;
        let xml = snap
            .get_xml_desc(0)
            .map_err(|e| refused("snapshot describe", e))?;
        Ok(xml.into_bytes())
    }

    fn snapshot_revert(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
        let snap = self.snapshot(handle, name)?;
        snap.revert(0).map_err(|e| refused("snapshot revert", e))?;
        Ok(())
    }

    fn snapshot_delete(&self, handle: &DomainHandle, name: &str) -> Result<(), HypervisorError> {
        let snap = self.snapshot(handle, name)?;
        snap.delete(0).map_err(|e| refused("snapshot delete", e))?;
        Ok(())
    }

    fn snapshot_list(&self, handle: &DomainHandle) -> Result<Vec<String>, HypervisorError> {
        let dom = self.domain(handle)?;
        let snaps = dom
            .list_all_snapshots(0)
            .map_err(|e| refused("snapshot list", e))?;
        snaps
            .iter()
            .map(|s| s.get_name().map_err(|e| refused("snapshot list", e)))
            .collect()
    }
}
