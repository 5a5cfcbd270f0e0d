//! IPU Process System - Job layer between clients and the IPU firmware
//!
//! # Purpose
//! Clients hand in process groups: job descriptors naming the programs to run
//! and the buffers to attach. This crate reserves the cells and DMA channels
//! each job needs, drives the firmware through a command backend, and tracks
//! every job as a kernel command (kcmd) until it completes, fails or is
//! aborted.
//!
//! # Integration Points
//! - Depends on: `psys-resources` (pools), `psys-fw-com` (queues),
//!   `ipu-cpd` (firmware package)
//! - Consumes: a [`DeviceMemory`](ipu_cpd::DeviceMemory) allocator, a
//!   [`Clock`], and either a doorbell (built-in backend) or an external
//!   [`PsysAbi`] implementation
//! - Provides to: the request layer above, via [`Psys`]
//!
//! # Architecture
//! ```text
//!  submit ──► ProcessGroup + ProgramGroupManifest
//!               │
//!               ▼
//!  Scheduler ── allocate_resources ──► running pool ─┐
//!     │                        └─────► started pool ─┤ move on completion
//!     ▼                                               │
//!  AbiBackend (builtin | external) ◄── events ◄──────┘
//! ```
//!
//! Kcmd state and both pools are only touched under spinlocks, so completion
//! may be driven from an interrupt-adjacent event handler. Backend failures
//! and watchdog expiry end the affected kcmd only; they surface as a
//! [`KcmdEvent`] with an error rather than as a returned error.
//!
//! # Testing Strategy
//! - Unit tests: codecs, allocator rollback, scheduler transitions
//! - Integration tests: full job flows against a scripted firmware

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod abi;
mod allocator;
mod config;
mod error;
mod kcmd;
mod manifest;
mod pg;
mod psys;

pub use abi::{AbiBackend, AbiResult, BuiltinAbi, PsysAbi, TerminalBuffer};
pub use allocator::allocate_resources;
pub use config::{BackendKind, PsysConfig, DEFAULT_FW_LIB_VERSION, DEFAULT_WATCHDOG_TIMEOUT_MS};
pub use error::{AbiError, ErrorClass, PsysError, Result};
pub use kcmd::{
    KcmdError, KcmdEvent, KcmdFlags, KcmdState, KcmdToken, KernelCommand, Priority, Watchdog,
};
pub use manifest::{
    CellRequirement, ChannelRequirement, ProgramGroupManifest, ProgramManifest, ANY_CELL,
    ANY_OFFSET, MAX_CHANNEL_KINDS,
};
pub use pg::{
    BufferState, PgState, ProcessEntry, ProcessGroup, ProcessGroupBuilder, TerminalEntry,
    TerminalType, NO_CELL,
};
pub use psys::{Clock, KcmdParams, Psys};
