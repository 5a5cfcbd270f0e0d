//! Resource definitions: which cells exist, their types, and channel sizes

use alloc::vec;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::{CellId, ResourceError, ResourceId, Result};

/// Upper bound on cells; the pool tracks cells in a 32-bit mask
pub const MAX_CELLS: usize = 32;

/// Channel kinds of the default layout
pub mod channel {
    use crate::ResourceId;

    pub const DMA_EXT0: ResourceId = 0;
    pub const GDC: ResourceId = 1;
    pub const DMA_EXT1_READ: ResourceId = 2;
    pub const DMA_EXT1_WRITE: ResourceId = 3;
    pub const DMA_INTERNAL: ResourceId = 4;
}

/// Static description of a pool
///
/// `cell_types[i]` is the type of cell `i`; `channels[k]` is the element
/// count of channel kind `k`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefs {
    pub cell_types: Vec<u8>,
    pub channels: Vec<u16>,
}

impl Default for ResourceDefs {
    /// Generic layout: one control SP, two server SPs, four vector
    /// processors, three accelerators and one GDC over five channel kinds.
    fn default() -> Self {
        Self {
            cell_types: vec![0, 1, 1, 2, 2, 2, 2, 3, 3, 4, 5],
            channels: vec![30, 4, 30, 20, 2],
        }
    }
}

impl ResourceDefs {
    pub fn validate(&self) -> Result<()> {
        if self.cell_types.len() > MAX_CELLS {
            return Err(ResourceError::TooManyCells {
                count: self.cell_types.len(),
                max: MAX_CELLS,
            });
        }
        if self.channels.len() > ResourceId::MAX as usize + 1 {
            return Err(ResourceError::UnknownResource {
                resource: ResourceId::MAX,
            });
        }
        Ok(())
    }

    pub fn num_cells(&self) -> usize {
        self.cell_types.len()
    }

    /// One past the highest cell type in use
    pub fn num_cell_types(&self) -> usize {
        self.cell_types
            .iter()
            .map(|&t| t as usize + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn cell_type(&self, cell: CellId) -> Option<u8> {
        self.cell_types.get(cell as usize).copied()
    }

    /// Cells of `cell_type`, lowest id first
    pub fn cells_of_type(&self, cell_type: u8) -> impl Iterator<Item = CellId> + '_ {
        self.cell_types
            .iter()
            .enumerate()
            .filter(move |&(_, &t)| t == cell_type)
            .map(|(cell, _)| cell as CellId)
    }
}
