//! Scripted guest channel.
//!
//! The "code" sent to the guest is a tiny line-oriented script:
//!
//! ```text
//! echo <text>     write <text> and a newline to stdout
//! warn <text>     same, on stderr
//! fill <bytes>    write <bytes> 'x' characters to stdout
//! sleep <ms>      pause
//! exit <code>     finish with an exit status
//! hang            never finish
//! drop            fail the transport
//! ```
//!
//! Blank lines and `#` comments are skipped. A script that runs off the end
//! exits 0; an unknown command exits 127.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;

use super::{ChannelError, GuestChannel, GuestOutput, OutputStream};
use crate::hypervisor::sim::SimHypervisor;
use crate::vm::VirtualMachine;
use crate::vm_state::VmState;

#[derive(Default)]
pub struct SimChannel {
    hypervisor: Option<Arc<SimHypervisor>>,
    fail_push: AtomicBool,
    unresponsive_cancel: AtomicBool,
    invocations: AtomicUsize,
    cancellations: AtomicUsize,
}

impl SimChannel {
    /// Invocations dirty the guest disk of `hypervisor`'s domains, so a
    /// missed restore is observable.
    pub fn new(hypervisor: Arc<SimHypervisor>) -> Self {
        Self {
            hypervisor: Some(hypervisor),
            ..Self::default()
        }
    }

    pub fn fail_push(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::SeqCst);
    }

    /// `cancel` never returns.
    pub fn unresponsive_cancel(&self, unresponsive: bool) {
        self.unresponsive_cancel.store(unresponsive, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    fn ensure_running(&self, vm: &VirtualMachine) -> Result<(), ChannelError> {
        match vm.state() {
            VmState::Running => Ok(()),
            other => Err(ChannelError::transport(format!(
                "guest agent on '{}' unreachable ({other})",
                vm.name()
            ))),
        }
    }
}

#[async_trait]
impl GuestChannel for SimChannel {
    async fn push_files(
        &self,
        vm: &VirtualMachine,
        files: &[PathBuf],
    ) -> Result<(), ChannelError> {
        self.ensure_running(vm)?;
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(ChannelError::transport("workspace upload interrupted"));
        }
        for path in files {
            tokio::fs::metadata(path).await.map_err(|e| {
                ChannelError::transport(format!("cannot read {}: {e}", path.display()))
            })?;
        }
        if let Some(hv) = &self.hypervisor {
            hv.mark_dirty(vm.id());
        }
        tracing::debug!(vm = %vm.name(), count = files.len(), "workspace pushed");
        Ok(())
    }

    async fn invoke(&self, vm: &VirtualMachine, code: &[u8]) -> Result<OutputStream, ChannelError> {
        self.ensure_running(vm)?;
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(hv) = &self.hypervisor {
            hv.mark_dirty(vm.id());
        }
        Ok(interpret(&String::from_utf8_lossy(code)))
    }

    async fn cancel(&self, vm: &VirtualMachine) -> Result<(), ChannelError> {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        if self.unresponsive_cancel.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tracing::debug!(vm = %vm.name(), "invocation cancelled");
        Ok(())
    }
}

enum Step {
    Emit(GuestOutput),
    Finish(Result<GuestOutput, ChannelError>),
}

fn interpret(script: &str) -> OutputStream {
    let lines: VecDeque<String> = script
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect();

    stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        loop {
            let Some(line) = lines.pop_front() else {
                return Some((Ok(GuestOutput::Exit(0)), None));
            };
            let step = match run_line(&line).await {
                Some(step) => step,
                None => continue,
            };
            return match step {
                Step::Emit(out) => Some((Ok(out), Some(lines))),
                Step::Finish(item) => Some((item, None)),
            };
        }
    })
    .boxed()
}

/// Execute one script line. `None` means the line produced no output.
async fn run_line(line: &str) -> Option<Step> {
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };
    match cmd {
        "echo" => Some(Step::Emit(GuestOutput::Stdout(format!("{arg}\n").into_bytes()))),
        "warn" => Some(Step::Emit(GuestOutput::Stderr(format!("{arg}\n").into_bytes()))),
        "fill" => match arg.parse::<usize>() {
            Ok(n) => Some(Step::Emit(GuestOutput::Stdout(vec![b'x'; n]))),
            Err(_) => Some(Step::Finish(Ok(GuestOutput::Exit(2)))),
        },
        "sleep" => match arg.parse::<u64>() {
            Ok(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                None
            }
            Err(_) => Some(Step::Finish(Ok(GuestOutput::Exit(2)))),
        },
        "exit" => Some(Step::Finish(Ok(GuestOutput::Exit(
            arg.parse().unwrap_or(2),
        )))),
        "hang" => {
            std::future::pending::<()>().await;
            None
        }
        "drop" => Some(Step::Finish(Err(ChannelError::transport(
            "guest agent connection dropped",
        )))),
        _ => Some(Step::Finish(Ok(GuestOutput::Exit(127)))),
    }
}
