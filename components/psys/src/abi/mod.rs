//! Command backends
//!
//! Every process-group operation the scheduler performs goes through
//! [`PsysAbi`]. Two implementations exist and exactly one is selected when
//! the subsystem is created:
//!
//! - [`BuiltinAbi`] edits the process-group header itself and talks to the
//!   firmware over the shared-memory queues of `psys-fw-com`.
//! - An external backend is any `Box<dyn PsysAbi>` a companion library hands
//!   in. It sees the same operation set and the same buffers.
//!
//! The choice is held as an [`AbiBackend`] value; nothing is resolved per
//! call.

mod builtin;

pub use builtin::BuiltinAbi;

use alloc::boxed::Box;

use psys_fw_com::PsysEvent;

use crate::config::BackendKind;
use crate::error::{AbiError, PsysError, Result};
use crate::pg::ProcessGroup;

pub type AbiResult<T> = core::result::Result<T, AbiError>;

/// A buffer to attach to one terminal of a process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalBuffer {
    /// Terminal index within the process group
    pub index: usize,
    pub device_address: u32,
    pub size: u32,
}

/// Process-group operations a backend provides
///
/// The getters and setters have header-editing defaults; a backend only
/// overrides them when its firmware lays the header out differently.
pub trait PsysAbi: Send + Sync {
    /// Mark the group started on the host side
    fn pg_start(&self, pg: &mut ProcessGroup) -> AbiResult<()>;

    /// Hand the group to the firmware
    fn pg_disown(&self, pg: &mut ProcessGroup) -> AbiResult<()>;

    /// Prepare the group for submission
    fn pg_submit(&self, pg: &mut ProcessGroup) -> AbiResult<()>;

    fn pg_abort(&self, pg: &mut ProcessGroup) -> AbiResult<()>;

    /// Next event from the firmware, if one is waiting
    fn rcv_event(&self) -> Option<PsysEvent>;

    fn terminal_set(&self, pg: &mut ProcessGroup, buffer: &TerminalBuffer) -> AbiResult<()>;

    fn pg_dump(&self, pg: &ProcessGroup, note: &str) {
        log::debug!(
            "{}: pg {} size {} state {:?} processes {} terminals {}",
            note,
            pg.id(),
            pg.size(),
            pg.state(),
            pg.process_count(),
            pg.terminal_count()
        );
        for index in 0..pg.process_count() {
            if let Some(process) = pg.process(index) {
                log::debug!(
                    "  process {} program {} cell {}",
                    index,
                    process.program_id,
                    process.cell_id
                );
            }
        }
    }

    fn pg_id(&self, pg: &ProcessGroup) -> u32 {
        pg.id()
    }

    fn terminal_count(&self, pg: &ProcessGroup) -> usize {
        pg.terminal_count()
    }

    fn pg_size(&self, pg: &ProcessGroup) -> usize {
        pg.size()
    }

    fn set_device_address(&self, pg: &mut ProcessGroup, address: u32) {
        pg.set_device_address(address);
    }

    fn device_address(&self, pg: &ProcessGroup) -> u32 {
        pg.device_address()
    }

    fn set_token(&self, pg: &mut ProcessGroup, token: u64) {
        pg.set_token(token);
    }

    fn token(&self, pg: &ProcessGroup) -> u64 {
        pg.token()
    }
}

/// The active backend
pub enum AbiBackend {
    Builtin(BuiltinAbi),
    External(Box<dyn PsysAbi>),
}

impl AbiBackend {
    /// Pick the backend named by `kind` from what the caller has available
    ///
    /// # Errors
    /// `BackendUnavailable` when the requested backend was not supplied.
    pub fn select(
        kind: BackendKind,
        builtin: Option<BuiltinAbi>,
        external: Option<Box<dyn PsysAbi>>,
    ) -> Result<Self> {
        let backend = match kind {
            BackendKind::Builtin => builtin.map(AbiBackend::Builtin),
            BackendKind::External => external.map(AbiBackend::External),
        };
        let backend = backend.ok_or(PsysError::BackendUnavailable { kind })?;
        log::info!("psys: using {:?} command backend", kind);
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            AbiBackend::Builtin(_) => BackendKind::Builtin,
            AbiBackend::External(_) => BackendKind::External,
        }
    }

    fn ops(&self) -> &dyn PsysAbi {
        match self {
            AbiBackend::Builtin(abi) => abi,
            AbiBackend::External(abi) => abi.as_ref(),
        }
    }
}

impl PsysAbi for AbiBackend {
    fn pg_start(&self, pg: &mut ProcessGroup) -> AbiResult<()> {
        self.ops().pg_start(pg)
    }

    fn pg_disown(&self, pg: &mut ProcessGroup) -> AbiResult<()> {
        self.ops().pg_disown(pg)
    }

    fn pg_submit(&self, pg: &mut ProcessGroup) -> AbiResult<()> {
        self.ops().pg_submit(pg)
    }

    fn pg_abort(&self, pg: &mut ProcessGroup) -> AbiResult<()> {
        self.ops().pg_abort(pg)
    }

    fn rcv_event(&self) -> Option<PsysEvent> {
        self.ops().rcv_event()
    }

    fn terminal_set(&self, pg: &mut ProcessGroup, buffer: &TerminalBuffer) -> AbiResult<()> {
        self.ops().terminal_set(pg, buffer)
    }

    fn pg_dump(&self, pg: &ProcessGroup, note: &str) {
        self.ops().pg_dump(pg, note)
    }

    fn pg_id(&self, pg: &ProcessGroup) -> u32 {
        self.ops().pg_id(pg)
    }

    fn terminal_count(&self, pg: &ProcessGroup) -> usize {
        self.ops().terminal_count(pg)
    }

    fn pg_size(&self, pg: &ProcessGroup) -> usize {
        self.ops().pg_size(pg)
    }

    fn set_device_address(&self, pg: &mut ProcessGroup, address: u32) {
        self.ops().set_device_address(pg, address)
    }

    fn device_address(&self, pg: &ProcessGroup) -> u32 {
        self.ops().device_address(pg)
    }

    fn set_token(&self, pg: &mut ProcessGroup, token: u64) {
        self.ops().set_token(pg, token)
    }

    fn token(&self, pg: &ProcessGroup) -> u64 {
        self.ops().token(pg)
    }
}
