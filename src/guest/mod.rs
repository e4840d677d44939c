//! Channel to the agent process running inside a guest.
//!
//! The wire protocol belongs to the in-guest agent; this module only fixes
//! the shape: push files in, invoke code, stream output back, cancel.

pub mod sim;

use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use miette::Diagnostic;
use thiserror::Error;

use crate::vm::VirtualMachine;

/// Output of an invocation, in the order the guest produced it. A stream
/// that ends without an `Exit` item is a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(i32),
}

pub type OutputStream = BoxStream<'static, Result<GuestOutput, ChannelError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ChannelError {
    #[error("guest transport failed: {message}")]
    Transport { message: String },

    #[error("guest closed the output stream without an exit status")]
    Closed,
}

impl ChannelError {
    pub fn transport(message: impl Into<String>) -> Self {
        ChannelError::Transport {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait GuestChannel: Send + Sync {
    /// Copy host files into the guest workspace.
    async fn push_files(&self, vm: &VirtualMachine, files: &[PathBuf])
    -> Result<(), ChannelError>;

    async fn invoke(&self, vm: &VirtualMachine, code: &[u8]) -> Result<OutputStream, ChannelError>;

    /// Ask the guest to abort the current invocation. Callers bound this
    /// with their own grace period; an unresponsive guest may never return.
    async fn cancel(&self, vm: &VirtualMachine) -> Result<(), ChannelError>;
}
