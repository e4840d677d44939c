//! End-to-end pool and executor behavior against the in-memory hypervisor
//! and scripted guest channel, on tokio's paused clock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sandpit::config::Config;
use sandpit::error::SandpitError;
use sandpit::events::{BroadcastSink, PoolEvent};
use sandpit::executor::{AgentExecutor, ExecutionRequest, ExecutorSettings};
use sandpit::guest::ChannelError;
use sandpit::guest::sim::SimChannel;
use sandpit::hypervisor::DomainHandle;
use sandpit::hypervisor::sim::SimHypervisor;
use sandpit::pool::{PoolSettings, SlotState, VmPool};
use sandpit::snapshot::{RetentionPolicy, SnapshotManager};
use sandpit::vm::VmTiming;
use sandpit::vm_state::VmState;

const WARM: Duration = Duration::from_secs(60);

struct Harness {
    hv: Arc<SimHypervisor>,
    snapshots: Arc<SnapshotManager>,
    pool: Arc<VmPool>,
    channel: Arc<SimChannel>,
    sink: Arc<BroadcastSink>,
    events: broadcast::Receiver<PoolEvent>,
}

fn settings(min_size: usize, max_size: usize) -> PoolSettings {
    PoolSettings {
        min_size,
        max_size,
        ttl: Duration::from_secs(3600),
        health_check_interval: Duration::from_secs(10),
        replenish_interval: Duration::from_secs(1),
        sweep_interval: Duration::from_secs(300),
        timing: VmTiming {
            boot_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        },
        ..PoolSettings::default()
    }
}

fn harness(settings: PoolSettings) -> Harness {
    let hv = Arc::new(SimHypervisor::new(Duration::from_secs(2)));
    let sink = Arc::new(BroadcastSink::new(1024));
    let events = sink.subscribe();
    let snapshots = Arc::new(SnapshotManager::new(
        hv.clone(),
        sink.clone(),
        RetentionPolicy::default(),
    ));
    let pool = Arc::new(VmPool::start(
        settings,
        hv.clone(),
        snapshots.clone(),
        Arc::new(Config::default().template()),
        sink.clone(),
    ));
    let channel = Arc::new(SimChannel::new(hv.clone()));
    Harness {
        hv,
        snapshots,
        pool,
        channel,
        sink,
        events,
    }
}

impl Harness {
    fn executor(&self, settings: ExecutorSettings) -> AgentExecutor {
        AgentExecutor::new(
            self.pool.clone(),
            self.channel.clone(),
            self.sink.clone(),
            settings,
        )
    }

    /// Next event matching `pred`, skipping everything else.
    async fn wait_for(&mut self, pred: impl Fn(&PoolEvent) -> bool) -> PoolEvent {
        let deadline = Instant::now() + Duration::from_secs(600);
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Ok(event)) if pred(&event) => return event,
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event sink closed"),
                Err(_) => panic!("timed out waiting for event"),
            }
        }
    }
}

fn destroyed(name: &str) -> impl Fn(&PoolEvent) -> bool + '_ {
    move |e| matches!(e, PoolEvent::VmDestroyed { vm } if vm == name)
}

fn started_other_than(name: &str) -> impl Fn(&PoolEvent) -> bool + '_ {
    move |e| matches!(e, PoolEvent::VmStarted { vm } if vm != name)
}

// ── pool ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scenario_exhausted_pool_fails_fast_with_zero_timeout() {
    let h = harness(settings(2, 5));
    h.pool.warm_up(WARM).await.unwrap();
    assert_eq!(h.pool.status().available, 2);

    let a = h.pool.acquire(Duration::ZERO).await.unwrap();
    let b = h.pool.acquire(Duration::ZERO).await.unwrap();
    assert_ne!(a.vm().name(), b.vm().name());

    let started = Instant::now();
    let err = h.pool.acquire(Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, SandpitError::PoolExhausted { .. }));
    assert_eq!(started.elapsed(), Duration::ZERO);

    // The background loop warms a spare for the next caller.
    let c = h.pool.acquire(Duration::from_secs(30)).await.unwrap();
    assert_ne!(c.vm().name(), a.vm().name());
    assert_ne!(c.vm().name(), b.vm().name());

    h.pool.release(a, true);
    h.pool.release(b, true);
    h.pool.release(c, true);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn acquire_times_out_at_the_boundary() {
    let h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();
    let held = h.pool.acquire(Duration::ZERO).await.unwrap();

    let started = Instant::now();
    let err = h.pool.acquire(Duration::from_secs(3)).await.unwrap_err();
    match err {
        SandpitError::PoolExhausted { waited } => assert!(waited >= Duration::from_secs(3)),
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() < Duration::from_millis(3100));

    h.pool.release(held, true);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unbounded_acquire_timeout_is_accepted() {
    let h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();

    let held = h.pool.acquire(Duration::MAX).await.unwrap();
    let name = held.vm().name().to_string();

    let pool = h.pool.clone();
    let waiter = tokio::spawn(async move {
        let slot = pool.acquire(Duration::MAX).await.unwrap();
        let name = slot.vm().name().to_string();
        pool.release(slot, true);
        name
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!waiter.is_finished());

    h.pool.release(held, true);
    assert_eq!(waiter.await.unwrap(), name);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn at_most_one_holder_per_vm() {
    let h = harness(settings(1, 3));
    h.pool.warm_up(WARM).await.unwrap();
    let held: Arc<Mutex<HashSet<String>>> = Arc::default();

    let mut tasks = Vec::new();
    for i in 0..12u64 {
        let pool = h.pool.clone();
        let held = held.clone();
        tasks.push(tokio::spawn(async move {
            let slot = pool.acquire(Duration::from_secs(300)).await.unwrap();
            let name = slot.vm().name().to_string();
            assert!(held.lock().unwrap().insert(name.clone()), "{name} handed out twice");
            assert!(pool.status().in_use <= 3);
            tokio::time::sleep(Duration::from_millis(100 * (i % 4 + 1))).await;
            held.lock().unwrap().remove(&name);
            pool.release(slot, true);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(h.pool.status().live() <= 3);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn healthy_release_restores_baseline() {
    let mut h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();

    let slot = h.pool.acquire(Duration::ZERO).await.unwrap();
    let vm = slot.vm().clone();
    h.hv.mark_dirty(vm.id());
    h.hv.mark_dirty(vm.id());
    assert_eq!(h.hv.generation(vm.id()), Some(2));
    h.pool.release(slot, true);

    h.wait_for(|e| matches!(e, PoolEvent::SlotReleased { healthy: true, .. }))
        .await;
    let again = h.pool.acquire(Duration::from_secs(30)).await.unwrap();
    assert_eq!(again.vm().name(), vm.name());
    assert_eq!(h.hv.generation(vm.id()), Some(0));
    assert_eq!(again.vm().state(), VmState::Running);

    h.pool.release(again, true);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unhealthy_release_destroys_and_replaces() {
    let mut h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();

    let slot = h.pool.acquire(Duration::ZERO).await.unwrap();
    let name = slot.vm().name().to_string();
    let handle = slot.vm().id().clone();
    h.pool.release(slot, false);

    h.wait_for(destroyed(&name)).await;
    assert!(!h.hv.is_defined(&handle));

    let fresh = h.pool.acquire(Duration::from_secs(30)).await.unwrap();
    assert_ne!(fresh.vm().name(), name);
    assert!(h.snapshots.baseline(fresh.vm()).is_some());
    assert_eq!(h.hv.defined_total(), 2);
    h.pool.release(fresh, true);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_lease_is_evicted() {
    let mut h = harness(settings(1, 2));
    h.pool.warm_up(WARM).await.unwrap();

    let slot = h.pool.acquire(Duration::ZERO).await.unwrap();
    let name = slot.vm().name().to_string();
    drop(slot);

    h.wait_for(|e| {
        matches!(e, PoolEvent::SlotReleased { vm, healthy: false, .. } if *vm == name)
    })
    .await;
    h.wait_for(destroyed(&name)).await;
    assert!(h.pool.slots().iter().all(|s| s.vm != name));
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_tampered_baseline_is_refused_and_vm_replaced() {
    let mut h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();

    let slot = h.pool.acquire(Duration::ZERO).await.unwrap();
    let vm = slot.vm().clone();
    let baseline = h.snapshots.baseline(&vm).unwrap();
    h.hv.mark_dirty(vm.id());
    assert!(h.hv.tamper_snapshot(vm.id(), &baseline.name));

    let err = h.snapshots.restore(&vm, &baseline).await.unwrap_err();
    assert!(matches!(err, SandpitError::CorruptSnapshot { .. }));
    assert_eq!(vm.state(), VmState::Running);
    assert_eq!(h.hv.generation(vm.id()), Some(1));

    // The pool hits the same corruption while recycling and evicts the VM.
    h.pool.release(slot, true);
    h.wait_for(destroyed(vm.name())).await;
    h.wait_for(started_other_than(vm.name())).await;
    let fresh = h.pool.acquire(Duration::from_secs(30)).await.unwrap();
    assert_ne!(fresh.vm().name(), vm.name());
    h.pool.release(fresh, true);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn health_check_evicts_crashed_vm() {
    let mut h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();

    let name = h.pool.slots()[0].vm.clone();
    h.hv.crash(&DomainHandle::new(&name));

    h.wait_for(destroyed(&name)).await;
    h.wait_for(started_other_than(&name)).await;
    let slots = h.pool.slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].state, SlotState::Available);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn expired_vm_is_evicted_on_release() {
    let mut s = settings(1, 1);
    s.ttl = Duration::from_secs(30);
    s.health_check_interval = Duration::from_secs(3600);
    let mut h = harness(s);
    h.pool.warm_up(WARM).await.unwrap();

    let slot = h.pool.acquire(Duration::ZERO).await.unwrap();
    let name = slot.vm().name().to_string();
    tokio::time::sleep(Duration::from_secs(40)).await;
    h.pool.release(slot, true);

    h.wait_for(destroyed(&name)).await;
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn boot_failures_do_not_fill_the_pool() {
    let h = harness(settings(2, 3));
    h.hv.hang_boot(true);
    let err = h.pool.warm_up(Duration::from_secs(10)).await.unwrap_err();
    assert!(matches!(err, SandpitError::WarmUpTimeout { ready: 0, wanted: 2 }));
    assert!(h.pool.status().live() <= 3);

    h.hv.hang_boot(false);
    h.pool.warm_up(Duration::from_secs(300)).await.unwrap();
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_destroys_every_vm() {
    let h = harness(settings(2, 4));
    h.pool.warm_up(WARM).await.unwrap();
    let held = h.pool.acquire(Duration::ZERO).await.unwrap();

    h.pool.shutdown().await;
    assert_eq!(h.hv.defined_count(), 0);
    assert!(h.pool.slots().is_empty());
    assert!(matches!(
        h.pool.acquire(Duration::from_secs(1)).await,
        Err(SandpitError::PoolExhausted { .. })
    ));
    h.pool.release(held, true);
}

// ── executor ──────────────────────────────────────────────

fn exec_settings() -> ExecutorSettings {
    ExecutorSettings {
        acquire_timeout: Duration::from_secs(60),
        cancel_grace: Duration::from_secs(2),
        output_cap: 1024 * 1024,
    }
}

#[tokio::test(start_paused = true)]
async fn clean_run_reports_output_and_recycles() {
    let mut h = harness(settings(1, 2));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(exec_settings());

    let request = ExecutionRequest::new("echo hello\nwarn note\nexit 0", Duration::from_secs(5));
    let result = executor
        .execute(&CancellationToken::new(), request)
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(result.stdout, b"hello\n");
    assert_eq!(result.stderr, b"note\n");
    assert!(!result.timed_out);
    assert!(result.transport_error.is_none());

    h.wait_for(|e| matches!(e, PoolEvent::ExecutionCompleted { timed_out: false, .. }))
        .await;
    h.wait_for(|e| matches!(e, PoolEvent::SlotReleased { healthy: true, .. }))
        .await;
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_timeout_returns_on_deadline_and_replaces_vm() {
    let mut h = harness(settings(1, 2));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(exec_settings());

    let started = Instant::now();
    let request = ExecutionRequest::new("sleep 5000\nexit 0", Duration::from_secs(1));
    let result = executor
        .execute(&CancellationToken::new(), request)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    assert_eq!(h.channel.cancellations(), 1);

    h.wait_for(|e| matches!(e, PoolEvent::ExecutionCompleted { timed_out: true, .. }))
        .await;
    h.wait_for(destroyed(&result.vm)).await;
    h.wait_for(started_other_than(&result.vm)).await;
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unbounded_request_timeout_runs_to_completion() {
    let h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(ExecutorSettings {
        acquire_timeout: Duration::MAX,
        ..exec_settings()
    });

    let result = executor
        .execute(
            &CancellationToken::new(),
            ExecutionRequest::new("echo hi\nexit 0", Duration::MAX),
        )
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(result.stdout, b"hi\n");
    assert!(!result.timed_out);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_wins_a_tie_with_completion() {
    let h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(exec_settings());

    let request = ExecutionRequest::new("sleep 1000\nexit 0", Duration::from_secs(1));
    let result = executor
        .execute(&CancellationToken::new(), request)
        .await
        .unwrap();
    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn finishing_just_before_the_deadline_is_clean() {
    let h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(exec_settings());

    let request = ExecutionRequest::new("sleep 999\nexit 7", Duration::from_secs(1));
    let result = executor
        .execute(&CancellationToken::new(), request)
        .await
        .unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.exit_code, Some(7));
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transport_failure_is_reported_and_vm_destroyed() {
    let mut h = harness(settings(1, 2));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(exec_settings());

    let request = ExecutionRequest::new("echo partial\ndrop", Duration::from_secs(5));
    let result = executor
        .execute(&CancellationToken::new(), request)
        .await
        .unwrap();
    assert_eq!(
        result.transport_error,
        Some(ChannelError::transport("guest agent connection dropped"))
    );
    assert_eq!(result.exit_code, None);
    assert!(!result.timed_out);
    assert_eq!(result.stdout, b"partial\n");
    // The guest is told to stop whatever it may still be running.
    assert_eq!(h.channel.cancellations(), 1);
    match result.transport_failure() {
        Some(SandpitError::TransportFailure { vm, .. }) => assert_eq!(vm, result.vm),
        other => panic!("expected a transport failure, got {other:?}"),
    }

    h.wait_for(destroyed(&result.vm)).await;
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_upload_is_a_transport_failure() {
    let h = harness(settings(1, 2));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(exec_settings());
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "data").unwrap();

    let ok = executor
        .execute(
            &CancellationToken::new(),
            ExecutionRequest::new("echo ok", Duration::from_secs(5)).with_file(&input),
        )
        .await
        .unwrap();
    assert!(ok.success());

    h.channel.fail_push(true);
    let failed = executor
        .execute(
            &CancellationToken::new(),
            ExecutionRequest::new("echo ok", Duration::from_secs(5)).with_file(&input),
        )
        .await
        .unwrap();
    assert!(matches!(failed.transport_error, Some(ChannelError::Transport { .. })));
    assert!(failed.stdout.is_empty());
    assert_eq!(h.channel.cancellations(), 1);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancellation_is_treated_like_a_timeout() {
    let mut h = harness(settings(1, 2));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(exec_settings());

    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = executor
        .execute(&ctx, ExecutionRequest::new("hang", Duration::from_secs(30)))
        .await
        .unwrap();
    assert!(result.cancelled);
    assert!(!result.timed_out);
    assert!(started.elapsed() < Duration::from_secs(1));

    h.wait_for(destroyed(&result.vm)).await;
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unresponsive_guest_cancel_is_bounded_by_grace() {
    let h = harness(settings(1, 2));
    h.pool.warm_up(WARM).await.unwrap();
    h.channel.unresponsive_cancel(true);
    let executor = h.executor(exec_settings());

    let started = Instant::now();
    let result = executor
        .execute(
            &CancellationToken::new(),
            ExecutionRequest::new("hang", Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert!(result.timed_out);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_acquire_is_an_error() {
    let h = harness(settings(1, 1));
    let executor = h.executor(exec_settings());
    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = executor
        .execute(&ctx, ExecutionRequest::new("echo hi", Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, SandpitError::Cancelled));
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_surfaces_as_error() {
    let h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();
    let held = h.pool.acquire(Duration::ZERO).await.unwrap();
    let executor = h.executor(ExecutorSettings {
        acquire_timeout: Duration::from_secs(2),
        ..exec_settings()
    });

    let err = executor
        .execute(
            &CancellationToken::new(),
            ExecutionRequest::new("echo hi", Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandpitError::PoolExhausted { .. }));
    h.pool.release(held, true);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn output_is_capped() {
    let h = harness(settings(1, 1));
    h.pool.warm_up(WARM).await.unwrap();
    let executor = h.executor(ExecutorSettings {
        output_cap: 16,
        ..exec_settings()
    });

    let result = executor
        .execute(
            &CancellationToken::new(),
            ExecutionRequest::new("fill 100\nwarn short", Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(result.stdout.len(), 16);
    assert!(result.stdout_truncated);
    assert!(!result.stderr_truncated);
    h.pool.shutdown().await;
}
