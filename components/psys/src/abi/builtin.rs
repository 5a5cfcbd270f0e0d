//! Built-in backend over the shared-memory command/event queues

use psys_fw_com::{FwCom, ProcessGroupCommand, PsysCommand, PsysEvent};

use super::{AbiResult, PsysAbi, TerminalBuffer};
use crate::error::AbiError;
use crate::pg::{BufferState, PgState, ProcessGroup, TerminalType};

pub struct BuiltinAbi {
    com: FwCom,
}

impl BuiltinAbi {
    pub fn new(com: FwCom) -> Self {
        Self { com }
    }

    pub fn com(&self) -> &FwCom {
        &self.com
    }

    fn send(&self, command: ProcessGroupCommand, pg: &ProcessGroup) -> AbiResult<()> {
        self.com
            .send(PsysCommand::new(command, pg.device_address()))
            .map_err(AbiError::from)
    }
}

/// Buffer state a streamed terminal starts in once a buffer is attached
///
/// `None` for parameter and program terminals, which only carry a payload
/// address.
fn initial_state(terminal_type: TerminalType) -> Option<BufferState> {
    use TerminalType::*;
    match terminal_type {
        DataIn | StateIn | ParamStream => Some(BufferState::Full),
        DataOut | StateOut => Some(BufferState::Empty),
        ParamCachedIn | ParamCachedOut | ParamSpatialIn | ParamSpatialOut | ParamSlicedIn
        | ParamSlicedOut | Program | ProgramControlInit => None,
    }
}

impl PsysAbi for BuiltinAbi {
    fn pg_start(&self, pg: &mut ProcessGroup) -> AbiResult<()> {
        pg.set_state(PgState::Started);
        Ok(())
    }

    fn pg_disown(&self, pg: &mut ProcessGroup) -> AbiResult<()> {
        self.send(ProcessGroupCommand::Start, pg)
    }

    fn pg_submit(&self, pg: &mut ProcessGroup) -> AbiResult<()> {
        pg.set_state(PgState::Blocked);
        Ok(())
    }

    fn pg_abort(&self, pg: &mut ProcessGroup) -> AbiResult<()> {
        self.send(ProcessGroupCommand::Stop, pg)
    }

    fn rcv_event(&self) -> Option<PsysEvent> {
        self.com.recv_event()
    }

    fn terminal_set(&self, pg: &mut ProcessGroup, buffer: &TerminalBuffer) -> AbiResult<()> {
        let index = buffer.index;
        let raw = pg
            .terminal(index)
            .ok_or(AbiError::InvalidTerminal { index })?
            .terminal_type;
        let terminal_type = TerminalType::from_raw(raw)
            .ok_or(AbiError::UnknownTerminalType { terminal_type: raw })?;

        let bound = match initial_state(terminal_type) {
            Some(state) => {
                pg.set_data_terminal(index, buffer.device_address, buffer.size, state)
            }
            None => pg.set_param_terminal(index, buffer.device_address),
        };
        bound.map_err(|_| AbiError::InvalidTerminal { index })
    }
}
