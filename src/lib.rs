#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod clock;
pub mod config;
pub mod domain_xml;
pub mod error;
pub mod events;
pub mod executor;
pub mod guest;
pub mod hypervisor;
pub mod logging;
pub mod paths;
pub mod pool;
pub mod snapshot;
pub mod vm;
pub mod vm_state;
