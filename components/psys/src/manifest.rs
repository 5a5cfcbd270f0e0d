//! Program group manifest: per-program resource requirements
//!
//! The manifest ships in the firmware metadata and tells the allocator which
//! cell and how many elements of each channel kind every program needs.
//!
//! ```text
//! header   0x00 u32 size  0x04 u32 id  0x08 u16 program_offset  0x0a u8 count
//! program  0x00 u32 size  0x04 u32 program_id  0x08 u8 cell_id  0x09 u8 cell_type
//!          0x0c u16 dev_chn_size[8]  0x1c u16 dev_chn_offset[8]
//! ```

use alloc::vec;
use alloc::vec::Vec;

use ipu_cpd::bytes::{read_u16, read_u32, write_u16, write_u32};
use psys_resources::CellId;

use crate::error::{PsysError, Result};

pub const MANIFEST_HEADER_SIZE: usize = 16;
pub const PROGRAM_MANIFEST_SIZE: usize = 48;

/// Channel kinds a program can request
pub const MAX_CHANNEL_KINDS: usize = 8;

/// Cell id or type meaning "unspecified"
pub const ANY_CELL: u8 = 0xff;

/// Channel offset meaning "anywhere in the channel"
pub const ANY_OFFSET: u16 = 0xffff;

const PROG_ID: usize = 0x04;
const PROG_CELL: usize = 0x08;
const PROG_CELL_TYPE: usize = 0x09;
const PROG_CHN_SIZE: usize = 0x0c;
const PROG_CHN_OFFSET: usize = 0x1c;

/// Which cell a program must run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRequirement {
    /// No cell needed
    None,
    /// Exactly this cell
    Fixed(CellId),
    /// Any free cell of this type
    Type(u8),
}

/// Demand on one channel kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelRequirement {
    pub size: u16,
    /// Required start position, if pinned
    pub offset: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramManifest {
    pub program_id: u32,
    pub cell: CellRequirement,
    pub channels: [ChannelRequirement; MAX_CHANNEL_KINDS],
}

impl ProgramManifest {
    pub fn new(program_id: u32, cell: CellRequirement) -> Self {
        Self {
            program_id,
            cell,
            channels: [ChannelRequirement::default(); MAX_CHANNEL_KINDS],
        }
    }

    /// Request `size` elements of channel `kind` at any position
    ///
    /// Kinds at or past [`MAX_CHANNEL_KINDS`] have no slot in the encoded
    /// manifest and are dropped with a warning.
    pub fn with_channel(self, kind: usize, size: u16) -> Self {
        self.set_channel(kind, ChannelRequirement { size, offset: None })
    }

    /// Request `size` elements of channel `kind` starting at `offset`
    ///
    /// Out-of-range kinds are dropped as in [`ProgramManifest::with_channel`].
    pub fn with_channel_at(self, kind: usize, size: u16, offset: u16) -> Self {
        let requirement = ChannelRequirement {
            size,
            offset: Some(offset),
        };
        self.set_channel(kind, requirement)
    }

    fn set_channel(mut self, kind: usize, requirement: ChannelRequirement) -> Self {
        match self.channels.get_mut(kind) {
            Some(slot) => *slot = requirement,
            None => log::warn!(
                "program {}: channel kind {} out of range, ignored",
                self.program_id,
                kind
            ),
        }
        self
    }

    fn decode(bytes: &[u8]) -> Self {
        let cell_id = bytes[PROG_CELL];
        let cell_type = bytes[PROG_CELL_TYPE];
        let cell = if cell_id != ANY_CELL {
            CellRequirement::Fixed(cell_id)
        } else if cell_type != ANY_CELL {
            CellRequirement::Type(cell_type)
        } else {
            CellRequirement::None
        };

        let mut channels = [ChannelRequirement::default(); MAX_CHANNEL_KINDS];
        for (kind, channel) in channels.iter_mut().enumerate() {
            let offset = read_u16(bytes, PROG_CHN_OFFSET + kind * 2);
            *channel = ChannelRequirement {
                size: read_u16(bytes, PROG_CHN_SIZE + kind * 2),
                offset: (offset != ANY_OFFSET).then_some(offset),
            };
        }

        Self {
            program_id: read_u32(bytes, PROG_ID),
            cell,
            channels,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        write_u32(out, 0, PROGRAM_MANIFEST_SIZE as u32);
        write_u32(out, PROG_ID, self.program_id);
        let (cell_id, cell_type) = match self.cell {
            CellRequirement::None => (ANY_CELL, ANY_CELL),
            CellRequirement::Fixed(cell) => (cell, ANY_CELL),
            CellRequirement::Type(cell_type) => (ANY_CELL, cell_type),
        };
        out[PROG_CELL] = cell_id;
        out[PROG_CELL_TYPE] = cell_type;
        for (kind, channel) in self.channels.iter().enumerate() {
            write_u16(out, PROG_CHN_SIZE + kind * 2, channel.size);
            write_u16(out, PROG_CHN_OFFSET + kind * 2, channel.offset.unwrap_or(ANY_OFFSET));
        }
    }
}

/// Decoded manifest of a program group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramGroupManifest {
    pub id: u32,
    programs: Vec<ProgramManifest>,
}

impl ProgramGroupManifest {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            programs: Vec::new(),
        }
    }

    pub fn with_program(mut self, program: ProgramManifest) -> Self {
        self.programs.push(program);
        self
    }

    /// Decode and bounds-check a manifest buffer
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MANIFEST_HEADER_SIZE {
            return Err(PsysError::InvalidManifest {
                reason: "buffer shorter than header",
            });
        }
        let size = read_u32(bytes, 0) as usize;
        if size > bytes.len() || size < MANIFEST_HEADER_SIZE {
            return Err(PsysError::InvalidManifest {
                reason: "declared size does not fit buffer",
            });
        }

        let offset = read_u16(bytes, 8) as usize;
        let count = bytes[10] as usize;
        let end = offset + count * PROGRAM_MANIFEST_SIZE;
        if count > 0 && (offset < MANIFEST_HEADER_SIZE || end > size) {
            return Err(PsysError::InvalidManifest {
                reason: "program table out of bounds",
            });
        }

        let programs = (0..count)
            .map(|i| {
                let base = offset + i * PROGRAM_MANIFEST_SIZE;
                ProgramManifest::decode(&bytes[base..base + PROGRAM_MANIFEST_SIZE])
            })
            .collect();

        Ok(Self {
            id: read_u32(bytes, 4),
            programs,
        })
    }

    pub fn programs(&self) -> &[ProgramManifest] {
        &self.programs
    }

    pub fn program(&self, program_id: u32) -> Option<&ProgramManifest> {
        self.programs.iter().find(|p| p.program_id == program_id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = MANIFEST_HEADER_SIZE + self.programs.len() * PROGRAM_MANIFEST_SIZE;
        let mut out = vec![0u8; size];
        write_u32(&mut out, 0, size as u32);
        write_u32(&mut out, 4, self.id);
        write_u16(&mut out, 8, MANIFEST_HEADER_SIZE as u16);
        out[10] = self.programs.len() as u8;
        for (i, program) in self.programs.iter().enumerate() {
            let base = MANIFEST_HEADER_SIZE + i * PROGRAM_MANIFEST_SIZE;
            program.encode(&mut out[base..base + PROGRAM_MANIFEST_SIZE]);
        }
        out
    }
}
