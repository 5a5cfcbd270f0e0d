//! Process group: the unit of work handed to the firmware
//!
//! A process group is one contiguous little-endian buffer shared with the
//! firmware:
//!
//! ```text
//! 0x00 u64 token            0x20 u32 resource_bitmap
//! 0x08 u64 private_token    0x24 u16 processes_offset
//! 0x10 u32 size             0x26 u16 terminals_offset
//! 0x14 u32 id               0x28 u8  process_count
//! 0x18 u32 state            0x29 u8  terminal_count
//! 0x1c u32 ipu_virtual_addr 0x2a u8  protocol_version
//! ```
//!
//! `processes_offset` and `terminals_offset` locate tables of `u16` entry
//! offsets, one per process or terminal, relative to the start of the group.

use alloc::vec;
use alloc::vec::Vec;

use ipu_cpd::bytes::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use psys_resources::CellId;

use crate::error::{PsysError, Result};
use crate::manifest::MAX_CHANNEL_KINDS;

pub const PG_HEADER_SIZE: usize = 64;
pub const PROCESS_SIZE: usize = 32;
pub const TERMINAL_SIZE: usize = 32;

/// Process cell id meaning "no cell assigned"
pub const NO_CELL: CellId = 0xff;

const PG_TOKEN: usize = 0x00;
const PG_PRIVATE_TOKEN: usize = 0x08;
const PG_SIZE: usize = 0x10;
const PG_ID: usize = 0x14;
const PG_STATE: usize = 0x18;
const PG_IPU_ADDRESS: usize = 0x1c;
const PG_RESOURCE_BITMAP: usize = 0x20;
const PG_PROCESSES_OFFSET: usize = 0x24;
const PG_TERMINALS_OFFSET: usize = 0x26;
const PG_PROCESS_COUNT: usize = 0x28;
const PG_TERMINAL_COUNT: usize = 0x29;
const PG_PROTOCOL: usize = 0x2a;

const PROC_SIZE: usize = 0x00;
const PROC_PROGRAM: usize = 0x04;
const PROC_STATE: usize = 0x08;
const PROC_CELL: usize = 0x0c;
const PROC_CHN_OFFSETS: usize = 0x10;

const TERM_TYPE: usize = 0x00;
const TERM_SIZE: usize = 0x04;
const TERM_ID: usize = 0x06;
const TERM_BUFFER: usize = 0x08;
const TERM_DATA_BYTES: usize = 0x0c;
const TERM_BUFFER_STATE: usize = 0x10;
const TERM_CONNECTION: usize = 0x14;

/// Process-group state as seen by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PgState {
    Error = 0,
    Created = 1,
    Ready = 2,
    Blocked = 3,
    Started = 4,
    Running = 5,
    Stalled = 6,
    Stopped = 7,
}

impl PgState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => PgState::Error,
            1 => PgState::Created,
            2 => PgState::Ready,
            3 => PgState::Blocked,
            4 => PgState::Started,
            5 => PgState::Running,
            6 => PgState::Stalled,
            7 => PgState::Stopped,
            _ => return None,
        })
    }
}

/// Terminal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TerminalType {
    DataIn = 0,
    DataOut = 1,
    ParamStream = 2,
    ParamCachedIn = 3,
    ParamCachedOut = 4,
    ParamSpatialIn = 5,
    ParamSpatialOut = 6,
    ParamSlicedIn = 7,
    ParamSlicedOut = 8,
    StateIn = 9,
    StateOut = 10,
    Program = 11,
    ProgramControlInit = 12,
}

impl TerminalType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use TerminalType::*;
        Some(match raw {
            0 => DataIn,
            1 => DataOut,
            2 => ParamStream,
            3 => ParamCachedIn,
            4 => ParamCachedOut,
            5 => ParamSpatialIn,
            6 => ParamSpatialOut,
            7 => ParamSlicedIn,
            8 => ParamSlicedOut,
            9 => StateIn,
            10 => StateOut,
            11 => Program,
            12 => ProgramControlInit,
            _ => return None,
        })
    }

    pub fn is_data(self) -> bool {
        matches!(self, TerminalType::DataIn | TerminalType::DataOut)
    }
}

/// Ownership state of a terminal buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufferState {
    Null = 0,
    Undefined = 1,
    Empty = 2,
    NonEmpty = 3,
    Full = 4,
}

/// Connection type written into data terminals
pub const CONNECTION_MEMORY: u32 = 0;

/// Decoded view of one process entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub program_id: u32,
    pub state: u32,
    pub cell_id: CellId,
}

/// Decoded view of one terminal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalEntry {
    pub terminal_type: u32,
    pub id: u8,
    pub buffer: u32,
    pub data_bytes: u32,
    pub buffer_state: u32,
}

/// An owned, validated process-group buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    bytes: Vec<u8>,
}

impl ProcessGroup {
    /// Take ownership of a process-group buffer after checking its layout
    ///
    /// The declared size must fit the buffer, and every offset table and
    /// entry must lie inside the declared size.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < PG_HEADER_SIZE {
            return Err(PsysError::InvalidProcessGroup {
                reason: "buffer shorter than header",
            });
        }

        let size = read_u32(&bytes, PG_SIZE) as usize;
        if size > bytes.len() {
            return Err(PsysError::InvalidProcessGroup {
                reason: "declared size exceeds buffer",
            });
        }
        if size < PG_HEADER_SIZE {
            return Err(PsysError::InvalidProcessGroup {
                reason: "declared size shorter than header",
            });
        }

        let pg = Self { bytes };
        pg.check_table(
            pg.processes_offset(),
            pg.process_count(),
            PROCESS_SIZE,
            "process entry out of bounds",
        )?;
        pg.check_table(
            pg.terminals_offset(),
            pg.terminal_count(),
            TERMINAL_SIZE,
            "terminal entry out of bounds",
        )?;
        Ok(pg)
    }

    fn check_table(
        &self,
        table: usize,
        count: usize,
        entry_size: usize,
        reason: &'static str,
    ) -> Result<()> {
        let size = self.size();
        if count == 0 {
            return Ok(());
        }
        if table < PG_HEADER_SIZE || table + count * 2 > size {
            return Err(PsysError::InvalidProcessGroup {
                reason: "offset table out of bounds",
            });
        }
        for index in 0..count {
            let offset = read_u16(&self.bytes, table + index * 2) as usize;
            if offset < PG_HEADER_SIZE || offset + entry_size > size {
                return Err(PsysError::InvalidProcessGroup { reason });
            }
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn token(&self) -> u64 {
        read_u64(&self.bytes, PG_TOKEN)
    }

    pub fn set_token(&mut self, token: u64) {
        write_u64(&mut self.bytes, PG_TOKEN, token);
    }

    pub fn private_token(&self) -> u64 {
        read_u64(&self.bytes, PG_PRIVATE_TOKEN)
    }

    /// Declared size in bytes
    pub fn size(&self) -> usize {
        read_u32(&self.bytes, PG_SIZE) as usize
    }

    pub fn id(&self) -> u32 {
        read_u32(&self.bytes, PG_ID)
    }

    pub fn state(&self) -> Option<PgState> {
        PgState::from_raw(read_u32(&self.bytes, PG_STATE))
    }

    pub fn set_state(&mut self, state: PgState) {
        write_u32(&mut self.bytes, PG_STATE, state as u32);
    }

    /// Address at which the firmware sees this group
    pub fn device_address(&self) -> u32 {
        read_u32(&self.bytes, PG_IPU_ADDRESS)
    }

    pub fn set_device_address(&mut self, address: u32) {
        write_u32(&mut self.bytes, PG_IPU_ADDRESS, address);
    }

    pub fn resource_bitmap(&self) -> u32 {
        read_u32(&self.bytes, PG_RESOURCE_BITMAP)
    }

    pub fn set_resource_bitmap(&mut self, cells: u32) {
        write_u32(&mut self.bytes, PG_RESOURCE_BITMAP, cells);
    }

    fn processes_offset(&self) -> usize {
        read_u16(&self.bytes, PG_PROCESSES_OFFSET) as usize
    }

    fn terminals_offset(&self) -> usize {
        read_u16(&self.bytes, PG_TERMINALS_OFFSET) as usize
    }

    pub fn process_count(&self) -> usize {
        self.bytes[PG_PROCESS_COUNT] as usize
    }

    pub fn terminal_count(&self) -> usize {
        self.bytes[PG_TERMINAL_COUNT] as usize
    }

    pub fn protocol_version(&self) -> u8 {
        self.bytes[PG_PROTOCOL]
    }

    fn process_base(&self, index: usize) -> Option<usize> {
        (index < self.process_count())
            .then(|| read_u16(&self.bytes, self.processes_offset() + index * 2) as usize)
    }

    fn terminal_base(&self, index: usize) -> Option<usize> {
        (index < self.terminal_count())
            .then(|| read_u16(&self.bytes, self.terminals_offset() + index * 2) as usize)
    }

    pub fn process(&self, index: usize) -> Option<ProcessEntry> {
        let base = self.process_base(index)?;
        Some(ProcessEntry {
            program_id: read_u32(&self.bytes, base + PROC_PROGRAM),
            state: read_u32(&self.bytes, base + PROC_STATE),
            cell_id: self.bytes[base + PROC_CELL],
        })
    }

    pub fn set_process_cell(&mut self, index: usize, cell: CellId) -> Result<()> {
        let base = self.process_base(index).ok_or(PsysError::InvalidProcessGroup {
            reason: "process index out of range",
        })?;
        self.bytes[base + PROC_CELL] = cell;
        Ok(())
    }

    /// Start offset of the process's draw from channel kind `kind`
    pub fn process_channel_offset(&self, index: usize, kind: usize) -> Option<u16> {
        let base = self.process_base(index)?;
        (kind < MAX_CHANNEL_KINDS)
            .then(|| read_u16(&self.bytes, base + PROC_CHN_OFFSETS + kind * 2))
    }

    pub fn set_process_channel_offset(
        &mut self,
        index: usize,
        kind: usize,
        offset: u16,
    ) -> Result<()> {
        let base = self.process_base(index).ok_or(PsysError::InvalidProcessGroup {
            reason: "process index out of range",
        })?;
        if kind >= MAX_CHANNEL_KINDS {
            return Err(PsysError::InvalidProcessGroup {
                reason: "channel kind out of range",
            });
        }
        write_u16(&mut self.bytes, base + PROC_CHN_OFFSETS + kind * 2, offset);
        Ok(())
    }

    pub fn terminal(&self, index: usize) -> Option<TerminalEntry> {
        let base = self.terminal_base(index)?;
        Some(TerminalEntry {
            terminal_type: read_u32(&self.bytes, base + TERM_TYPE),
            id: self.bytes[base + TERM_ID],
            buffer: read_u32(&self.bytes, base + TERM_BUFFER),
            data_bytes: read_u32(&self.bytes, base + TERM_DATA_BYTES),
            buffer_state: read_u32(&self.bytes, base + TERM_BUFFER_STATE),
        })
    }

    /// Bind a buffer to a data terminal
    pub fn set_data_terminal(
        &mut self,
        index: usize,
        buffer: u32,
        data_bytes: u32,
        state: BufferState,
    ) -> Result<()> {
        let base = self.terminal_base(index).ok_or(PsysError::InvalidProcessGroup {
            reason: "terminal index out of range",
        })?;
        write_u32(&mut self.bytes, base + TERM_CONNECTION, CONNECTION_MEMORY);
        write_u32(&mut self.bytes, base + TERM_DATA_BYTES, data_bytes);
        write_u32(&mut self.bytes, base + TERM_BUFFER, buffer);
        write_u32(&mut self.bytes, base + TERM_BUFFER_STATE, state as u32);
        Ok(())
    }

    /// Bind a payload buffer to a parameter terminal
    pub fn set_param_terminal(&mut self, index: usize, buffer: u32) -> Result<()> {
        let base = self.terminal_base(index).ok_or(PsysError::InvalidProcessGroup {
            reason: "terminal index out of range",
        })?;
        write_u32(&mut self.bytes, base + TERM_BUFFER, buffer);
        Ok(())
    }
}

/// Encoder for process groups
///
/// Used by clients that assemble a group on the host before submission.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroupBuilder {
    id: u32,
    protocol_version: u8,
    programs: Vec<u32>,
    terminals: Vec<u32>,
}

impl ProcessGroupBuilder {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    /// Add a process running `program_id`
    pub fn process(mut self, program_id: u32) -> Self {
        self.programs.push(program_id);
        self
    }

    pub fn terminal(mut self, terminal_type: TerminalType) -> Self {
        self.terminals.push(terminal_type as u32);
        self
    }

    /// Add a terminal with a raw type value, including ones this crate
    /// does not know
    pub fn raw_terminal(mut self, terminal_type: u32) -> Self {
        self.terminals.push(terminal_type);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let processes_offset = PG_HEADER_SIZE;
        let terminals_offset = processes_offset + self.programs.len() * 2;
        let mut entry = (terminals_offset + self.terminals.len() * 2 + 7) & !7;
        let size =
            entry + self.programs.len() * PROCESS_SIZE + self.terminals.len() * TERMINAL_SIZE;

        let mut out = vec![0u8; size];
        write_u32(&mut out, PG_SIZE, size as u32);
        write_u32(&mut out, PG_ID, self.id);
        write_u32(&mut out, PG_STATE, PgState::Created as u32);
        write_u16(&mut out, PG_PROCESSES_OFFSET, processes_offset as u16);
        write_u16(&mut out, PG_TERMINALS_OFFSET, terminals_offset as u16);
        out[PG_PROCESS_COUNT] = self.programs.len() as u8;
        out[PG_TERMINAL_COUNT] = self.terminals.len() as u8;
        out[PG_PROTOCOL] = self.protocol_version;

        for (index, &program_id) in self.programs.iter().enumerate() {
            write_u16(&mut out, processes_offset + index * 2, entry as u16);
            write_u32(&mut out, entry + PROC_SIZE, PROCESS_SIZE as u32);
            write_u32(&mut out, entry + PROC_PROGRAM, program_id);
            out[entry + PROC_CELL] = NO_CELL;
            entry += PROCESS_SIZE;
        }

        for (index, &terminal_type) in self.terminals.iter().enumerate() {
            write_u16(&mut out, terminals_offset + index * 2, entry as u16);
            write_u32(&mut out, entry + TERM_TYPE, terminal_type);
            write_u16(&mut out, entry + TERM_SIZE, TERMINAL_SIZE as u16);
            out[entry + TERM_ID] = index as u8;
            entry += TERMINAL_SIZE;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProcessGroup {
        let bytes = ProcessGroupBuilder::new(0x42)
            .process(7)
            .process(9)
            .terminal(TerminalType::DataIn)
            .terminal(TerminalType::ParamCachedIn)
            .build();
        ProcessGroup::parse(bytes).unwrap()
    }

    #[test]
    fn test_builder_layout() {
        let pg = sample();
        assert_eq!(pg.id(), 0x42);
        assert_eq!(pg.process_count(), 2);
        assert_eq!(pg.terminal_count(), 2);
        assert_eq!(pg.state(), Some(PgState::Created));
        assert_eq!(pg.process(1).unwrap().program_id, 9);
        assert_eq!(pg.process(0).unwrap().cell_id, NO_CELL);
        assert_eq!(pg.terminal(1).unwrap().terminal_type, TerminalType::ParamCachedIn as u32);
        assert!(pg.process(2).is_none());
    }

    #[test]
    fn test_header_setters() {
        let mut pg = sample();
        pg.set_token(0xdead_beef_0000_0001);
        pg.set_device_address(0x9000_0000);
        pg.set_state(PgState::Blocked);
        assert_eq!(pg.token(), 0xdead_beef_0000_0001);
        assert_eq!(pg.device_address(), 0x9000_0000);
        assert_eq!(pg.state(), Some(PgState::Blocked));
        assert_eq!(pg.private_token(), 0);
    }

    #[test]
    fn test_process_fields() {
        let mut pg = sample();
        pg.set_process_cell(1, 4).unwrap();
        pg.set_process_channel_offset(1, 3, 17).unwrap();
        assert_eq!(pg.process(1).unwrap().cell_id, 4);
        assert_eq!(pg.process_channel_offset(1, 3), Some(17));
        assert_eq!(pg.process_channel_offset(0, 3), Some(0));
        assert!(pg.set_process_cell(2, 0).is_err());
        assert!(pg.set_process_channel_offset(0, MAX_CHANNEL_KINDS, 0).is_err());
    }

    #[test]
    fn test_terminal_binding() {
        let mut pg = sample();
        pg.set_data_terminal(0, 0x1000, 4096, BufferState::Full).unwrap();
        let terminal = pg.terminal(0).unwrap();
        assert_eq!(terminal.buffer, 0x1000);
        assert_eq!(terminal.data_bytes, 4096);
        assert_eq!(terminal.buffer_state, BufferState::Full as u32);

        pg.set_param_terminal(1, 0x2000).unwrap();
        assert_eq!(pg.terminal(1).unwrap().buffer, 0x2000);
    }

    #[test]
    fn test_parse_rejects_oversized_declaration() {
        let mut bytes = ProcessGroupBuilder::new(1).process(1).build();
        let len = bytes.len() as u32;
        write_u32(&mut bytes, PG_SIZE, len + 1);
        assert!(matches!(
            ProcessGroup::parse(bytes),
            Err(PsysError::InvalidProcessGroup {
                reason: "declared size exceeds buffer"
            })
        ));

        assert!(ProcessGroup::parse(vec![0u8; 16]).is_err());
    }

    #[test]
    fn test_parse_rejects_entry_outside_group() {
        let mut bytes = ProcessGroupBuilder::new(1)
            .process(1)
            .terminal(TerminalType::DataOut)
            .build();
        let size = bytes.len() as u16;
        // Point the terminal entry at the last byte
        write_u16(&mut bytes, PG_HEADER_SIZE + 2, size - 1);
        assert!(matches!(
            ProcessGroup::parse(bytes),
            Err(PsysError::InvalidProcessGroup {
                reason: "terminal entry out of bounds"
            })
        ));
    }
}
