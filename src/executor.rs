//! Bounded-time execution of agent code on pooled VMs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::error::SandpitError;
use crate::events::{EventSink, PoolEvent};
use crate::guest::{ChannelError, GuestChannel, GuestOutput};
use crate::pool::VmPool;
use crate::vm::VirtualMachine;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// How long `execute` waits for a free VM.
    pub acquire_timeout: Duration,
    /// How long the guest gets to acknowledge a cancel.
    pub cancel_grace: Duration,
    /// Per-stream capture limit in bytes.
    pub output_cap: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(2),
            output_cap: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: Vec<u8>,
    pub workspace_files: Vec<PathBuf>,
    /// Covers the workspace upload and the invocation itself.
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        Self {
            code: code.into(),
            workspace_files: Vec::new(),
            timeout,
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_files.push(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), SandpitError> {
        if self.timeout.is_zero() {
            return Err(SandpitError::InvalidRequest {
                message: "timeout must be greater than zero".into(),
            });
        }
        if self.code.is_empty() {
            return Err(SandpitError::InvalidRequest {
                message: "code must not be empty".into(),
            });
        }
        if let Some(missing) = self.workspace_files.iter().find(|p| !p.exists()) {
            return Err(SandpitError::InvalidRequest {
                message: format!("workspace file {} does not exist", missing.display()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// `None` unless the guest reported an exit status before the deadline.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Set when the guest channel failed before an exit status arrived.
    pub transport_error: Option<ChannelError>,
    pub duration: Duration,
    pub vm: String,
}

impl ExecutionResult {
    /// Exited 0 within the deadline.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The channel failure as an error, for callers that treat it as one.
    pub fn transport_failure(&self) -> Option<SandpitError> {
        self.transport_error
            .clone()
            .map(|source| SandpitError::TransportFailure {
                vm: self.vm.clone(),
                source,
            })
    }
}

#[derive(Debug, Default)]
struct Capture {
    cap: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: bool,
    stderr_truncated: bool,
}

impl Capture {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }

    fn push(&mut self, output: GuestOutput) -> Option<i32> {
        match output {
            GuestOutput::Stdout(data) => {
                append(&mut self.stdout, &mut self.stdout_truncated, self.cap, &data)
            }
            GuestOutput::Stderr(data) => {
                append(&mut self.stderr, &mut self.stderr_truncated, self.cap, &data)
            }
            GuestOutput::Exit(code) => return Some(code),
        }
        None
    }
}

fn append(buf: &mut Vec<u8>, truncated: &mut bool, cap: usize, data: &[u8]) {
    let room = cap.saturating_sub(buf.len());
    if data.len() > room {
        *truncated = true;
    }
    buf.extend_from_slice(&data[..data.len().min(room)]);
}

enum Finish {
    Exited(i32),
    Transport(ChannelError),
    TimedOut,
    Cancelled,
}

pub struct AgentExecutor {
    pool: Arc<VmPool>,
    channel: Arc<dyn GuestChannel>,
    events: Arc<dyn EventSink>,
    settings: ExecutorSettings,
}

impl AgentExecutor {
    pub fn new(
        pool: Arc<VmPool>,
        channel: Arc<dyn GuestChannel>,
        events: Arc<dyn EventSink>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            pool,
            channel,
            events,
            settings,
        }
    }

    /// Run `request` on a pooled VM.
    ///
    /// Returns `Err` only when no VM could be obtained (bad request, pool
    /// exhausted, cancelled while waiting). Everything that happens once a
    /// VM is held, including timeouts and transport failures, is reported in
    /// the [`ExecutionResult`]. Any outcome other than a clean exit releases
    /// the VM as unhealthy.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SandpitError> {
        request.validate()?;

        let slot = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(SandpitError::Cancelled),
            slot = self.pool.acquire(self.settings.acquire_timeout) => slot?,
        };
        let vm = slot.vm().clone();
        tracing::info!(vm = %vm.name(), slot = %slot.id(), timeout = ?request.timeout, "executing");

        let started = Instant::now();
        let deadline = clock::deadline_from(started, request.timeout);
        let mut capture = Capture::new(self.settings.output_cap);

        let finish = {
            let guest = run_guest(self.channel.as_ref(), &vm, &request, &mut capture);
            // Deadline first: when the guest finishes on the same tick, the
            // timeout wins.
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => Finish::TimedOut,
                _ = ctx.cancelled() => Finish::Cancelled,
                result = guest => match result {
                    Ok(code) => Finish::Exited(code),
                    Err(e) => Finish::Transport(e),
                },
            }
        };

        // Whatever the guest may still be running gets told to stop.
        if !matches!(finish, Finish::Exited(_)) {
            self.cancel_guest(&vm).await;
        }
        let duration = started.elapsed();
        let healthy = matches!(finish, Finish::Exited(_));
        self.pool.release(slot, healthy);

        let mut result = ExecutionResult {
            exit_code: None,
            stdout: capture.stdout,
            stderr: capture.stderr,
            stdout_truncated: capture.stdout_truncated,
            stderr_truncated: capture.stderr_truncated,
            timed_out: false,
            cancelled: false,
            transport_error: None,
            duration,
            vm: vm.name().to_string(),
        };
        match finish {
            Finish::Exited(code) => result.exit_code = Some(code),
            Finish::TimedOut => result.timed_out = true,
            Finish::Cancelled => result.cancelled = true,
            Finish::Transport(e) => {
                tracing::warn!(vm = %vm.name(), error = %e, "guest transport failed");
                result.transport_error = Some(e);
            }
        }

        tracing::info!(
            vm = %result.vm,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            cancelled = result.cancelled,
            duration_ms = duration.as_millis() as u64,
            "execution finished"
        );
        self.events.emit(PoolEvent::ExecutionCompleted {
            vm: result.vm.clone(),
            timed_out: result.timed_out,
            duration,
        });
        Ok(result)
    }

    async fn cancel_guest(&self, vm: &VirtualMachine) {
        match tokio::time::timeout(self.settings.cancel_grace, self.channel.cancel(vm)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(vm = %vm.name(), error = %e, "guest cancel failed"),
            Err(_) => {
                tracing::warn!(vm = %vm.name(), grace = ?self.settings.cancel_grace, "guest ignored cancel")
            }
        }
    }
}

/// Push the workspace, invoke, and drain output until the exit status.
async fn run_guest(
    channel: &dyn GuestChannel,
    vm: &VirtualMachine,
    request: &ExecutionRequest,
    capture: &mut Capture,
) -> Result<i32, ChannelError> {
    if !request.workspace_files.is_empty() {
        channel.push_files(vm, &request.workspace_files).await?;
    }
    let mut output = channel.invoke(vm, &request.code).await?;
    while let Some(item) = output.next().await {
        if let Some(code) = capture.push(item?) {
            return Ok(code);
        }
    }
    Err(ChannelError::Closed)
}
