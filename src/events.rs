//! Lifecycle notifications for metrics and audit consumers.
//!
//! Emission is fire-and-forget: [`EventSink::emit`] is synchronous and must
//! never block on the consumer.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::pool::SlotId;
use crate::snapshot::SnapshotKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    VmStarted {
        vm: String,
    },
    VmDestroyed {
        vm: String,
    },
    SlotAcquired {
        slot: SlotId,
        vm: String,
    },
    SlotReleased {
        slot: SlotId,
        vm: String,
        healthy: bool,
    },
    SnapshotCreated {
        vm: String,
        snapshot: String,
        kind: SnapshotKind,
    },
    SnapshotRestoreFailed {
        vm: String,
        snapshot: String,
        reason: String,
    },
    ExecutionCompleted {
        vm: String,
        timed_out: bool,
        duration: Duration,
    },
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::VmStarted { .. } => "vm_started",
            PoolEvent::VmDestroyed { .. } => "vm_destroyed",
            PoolEvent::SlotAcquired { .. } => "slot_acquired",
            PoolEvent::SlotReleased { .. } => "slot_released",
            PoolEvent::SnapshotCreated { .. } => "snapshot_created",
            PoolEvent::SnapshotRestoreFailed { .. } => "snapshot_restore_failed",
            PoolEvent::ExecutionCompleted { .. } => "execution_completed",
        }
    }

    pub fn vm(&self) -> &str {
        match self {
            PoolEvent::VmStarted { vm }
            | PoolEvent::VmDestroyed { vm }
            | PoolEvent::SlotAcquired { vm, .. }
            | PoolEvent::SlotReleased { vm, .. }
            | PoolEvent::SnapshotCreated { vm, .. }
            | PoolEvent::SnapshotRestoreFailed { vm, .. }
            | PoolEvent::ExecutionCompleted { vm, .. } => vm,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PoolEvent);
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PoolEvent) {}
}

/// Writes each event as a structured `tracing` record.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PoolEvent) {
        match &event {
            PoolEvent::SlotReleased { slot, healthy, .. } => {
                tracing::info!(event = event.name(), vm = event.vm(), %slot, healthy)
            }
            PoolEvent::SlotAcquired { slot, .. } => {
                tracing::info!(event = event.name(), vm = event.vm(), %slot)
            }
            PoolEvent::SnapshotCreated { snapshot, kind, .. } => {
                tracing::info!(event = event.name(), vm = event.vm(), %snapshot, ?kind)
            }
            PoolEvent::SnapshotRestoreFailed {
                snapshot, reason, ..
            } => {
                tracing::warn!(event = event.name(), vm = event.vm(), %snapshot, %reason)
            }
            PoolEvent::ExecutionCompleted {
                timed_out,
                duration,
                ..
            } => tracing::info!(
                event = event.name(),
                vm = event.vm(),
                timed_out,
                duration_ms = duration.as_millis() as u64
            ),
            PoolEvent::VmStarted { .. } | PoolEvent::VmDestroyed { .. } => {
                tracing::info!(event = event.name(), vm = event.vm())
            }
        }
    }
}

/// Fans events out to any number of subscribers. Slow subscribers lag and
/// lose events instead of holding up the pool.
pub struct BroadcastSink {
    tx: broadcast::Sender<PoolEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_without_subscribers_does_not_panic() {
        let sink = BroadcastSink::new(4);
        sink.emit(PoolEvent::VmStarted { vm: "a".into() });
    }

    #[test]
    fn broadcast_delivers_to_subscriber() {
        let sink = BroadcastSink::new(4);
        let mut rx = sink.subscribe();
        sink.emit(PoolEvent::VmDestroyed { vm: "a".into() });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), "vm_destroyed");
        assert_eq!(event.vm(), "a");
    }

    #[test]
    fn lagging_subscriber_does_not_block_emit() {
        let sink = BroadcastSink::new(2);
        let mut rx = sink.subscribe();
        for i in 0..10 {
            sink.emit(PoolEvent::VmStarted { vm: format!("vm-{i}") });
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }
}
