//! Per-job allocation set

use crate::resource::ResourceAllocationRecord;
use crate::{CellId, ResourceError, Result};

/// Maximum channel draws one job may hold
pub const MAX_RESOURCES: usize = 128;

/// Bitmask over cell ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CellMask(u32);

impl CellMask {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, cell: CellId) -> bool {
        cell < 32 && self.0 & (1 << cell) != 0
    }

    pub fn insert(&mut self, cell: CellId) {
        debug_assert!(cell < 32);
        self.0 |= 1 << cell;
    }

    pub fn remove(&mut self, cell: CellId) {
        debug_assert!(cell < 32);
        self.0 &= !(1 << cell);
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

/// Everything one job holds in a pool: channel draws plus reserved cells
///
/// The record array has a fixed capacity matching the firmware's per-job
/// limit; pushing past it fails instead of growing.
#[derive(Debug, Clone)]
pub struct ResourceAllocationSet {
    records: [ResourceAllocationRecord; MAX_RESOURCES],
    count: usize,
    cells: CellMask,
}

impl Default for ResourceAllocationSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceAllocationSet {
    pub const fn new() -> Self {
        Self {
            records: [ResourceAllocationRecord {
                resource: 0,
                start: 0,
                len: 0,
            }; MAX_RESOURCES],
            count: 0,
            cells: CellMask::EMPTY,
        }
    }

    pub fn push(&mut self, record: ResourceAllocationRecord) -> Result<()> {
        if self.count == MAX_RESOURCES {
            return Err(ResourceError::CapacityOverflow {
                capacity: MAX_RESOURCES,
            });
        }
        self.records[self.count] = record;
        self.count += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<ResourceAllocationRecord> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        Some(self.records[self.count])
    }

    pub fn records(&self) -> &[ResourceAllocationRecord] {
        &self.records[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.cells.is_empty()
    }

    pub fn cells(&self) -> CellMask {
        self.cells
    }

    pub fn add_cells(&mut self, cells: CellMask) {
        self.cells = self.cells.union(cells);
    }

    /// Forget every record and cell without touching any pool
    pub fn clear(&mut self) {
        self.count = 0;
        self.cells = CellMask::EMPTY;
    }
}
