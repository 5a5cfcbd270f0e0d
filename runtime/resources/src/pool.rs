//! Resource pools and set-level operations

use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::defs::ResourceDefs;
use crate::resource::{Resource, ResourceAllocationRecord};
use crate::set::{CellMask, ResourceAllocationSet};
use crate::{CellId, ResourceError, ResourceId, Result};

/// One resource per channel kind plus the pool-wide cell reservations
#[derive(Debug, Clone)]
pub struct ResourcePool {
    resources: Vec<Resource>,
    cells: CellMask,
    num_cells: usize,
}

impl ResourcePool {
    /// Build an empty pool from definitions
    pub fn new(defs: &ResourceDefs) -> Result<Self> {
        defs.validate()?;
        let resources = defs
            .channels
            .iter()
            .enumerate()
            .map(|(kind, &elements)| Resource::new(kind as ResourceId, elements))
            .collect();

        Ok(Self {
            resources,
            cells: CellMask::EMPTY,
            num_cells: defs.num_cells(),
        })
    }

    pub fn cells(&self) -> CellMask {
        self.cells
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resource(&self, id: ResourceId) -> Result<&Resource> {
        self.resources
            .get(id as usize)
            .ok_or(ResourceError::UnknownResource { resource: id })
    }

    pub fn resource_mut(&mut self, id: ResourceId) -> Result<&mut Resource> {
        self.resources
            .get_mut(id as usize)
            .ok_or(ResourceError::UnknownResource { resource: id })
    }

    pub fn is_cell_reserved(&self, cell: CellId) -> bool {
        self.cells.contains(cell)
    }

    /// Mark cells as held by a job
    pub fn reserve_cells(&mut self, cells: CellMask) -> Result<()> {
        let valid = if self.num_cells >= 32 {
            u32::MAX
        } else {
            (1u32 << self.num_cells) - 1
        };
        if cells.bits() & !valid != 0 {
            return Err(ResourceError::UnknownCell {
                cell: (31 - (cells.bits() & !valid).leading_zeros()) as CellId,
            });
        }
        if self.cells.intersects(cells) {
            return Err(ResourceError::Conflict);
        }
        self.cells = self.cells.union(cells);
        Ok(())
    }

    pub fn release_cells(&mut self, cells: CellMask) {
        self.cells = self.cells.difference(cells);
    }

    /// True when nothing is drawn and no cell is reserved
    pub fn is_idle(&self) -> bool {
        self.cells.is_empty() && self.resources.iter().all(|r| r.allocated() == 0)
    }

    fn check_record(&self, record: &ResourceAllocationRecord) -> Result<&Resource> {
        let resource = self.resource(record.resource)?;
        if !resource.fits(record) {
            return Err(ResourceError::OutOfRange {
                resource: record.resource,
                start: record.start as usize,
                len: record.len as usize,
            });
        }
        Ok(resource)
    }
}

/// Move every draw and cell of `set` from `source` to `target`
///
/// Nothing is mutated unless the whole set fits: if `target` already holds
/// any of the set's cells or any element of its ranges, the call fails with
/// [`ResourceError::Conflict`] and both pools are untouched.
pub fn move_resources(
    set: &ResourceAllocationSet,
    source: &mut ResourcePool,
    target: &mut ResourcePool,
) -> Result<()> {
    if target.cells.intersects(set.cells()) {
        log::debug!(
            "move rejected: cells {:#x} busy in target",
            target.cells.bits() & set.cells().bits()
        );
        return Err(ResourceError::Conflict);
    }

    for record in set.records() {
        source.check_record(record)?;
        if !target.check_record(record)?.is_free(record) {
            log::debug!(
                "move rejected: resource {} range {}+{} busy in target",
                record.resource,
                record.start,
                record.len
            );
            return Err(ResourceError::Conflict);
        }
    }

    for record in set.records() {
        source.resource_mut(record.resource)?.free(record);
        target.resource_mut(record.resource)?.claim(record);
    }
    source.release_cells(set.cells());
    target.cells = target.cells.union(set.cells());
    Ok(())
}

/// Release every draw and cell of `set` back to `pool`, then empty the set
pub fn free_resources(set: &mut ResourceAllocationSet, pool: &mut ResourcePool) {
    pool.release_cells(set.cells());
    for record in set.records() {
        if let Ok(resource) = pool.resource_mut(record.resource) {
            resource.free(record);
        }
    }
    set.clear();
}

/// A [`ResourcePool`] behind a spinlock
///
/// The lock never sleeps, so it may be taken from interrupt-adjacent paths;
/// every operation under it is a bounded bitmap scan.
pub struct LockedPool {
    name: &'static str,
    inner: Mutex<ResourcePool>,
}

impl LockedPool {
    pub fn new(name: &'static str, pool: ResourcePool) -> Self {
        Self {
            name,
            inner: Mutex::new(pool),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, ResourcePool> {
        self.inner.lock()
    }

    /// [`move_resources`] with both pools held for the whole move
    ///
    /// Locks are taken in address order so concurrent moves in opposite
    /// directions cannot deadlock.
    pub fn transfer(
        set: &ResourceAllocationSet,
        source: &LockedPool,
        target: &LockedPool,
    ) -> Result<()> {
        if core::ptr::eq(source, target) {
            return Ok(());
        }

        let source_first = (source as *const LockedPool) < (target as *const LockedPool);
        let (mut src, mut dst) = if source_first {
            let src = source.lock();
            let dst = target.lock();
            (src, dst)
        } else {
            let dst = target.lock();
            let src = source.lock();
            (src, dst)
        };

        move_resources(set, &mut src, &mut dst)?;
        log::debug!("moved allocation from {} to {} pool", source.name, target.name);
        Ok(())
    }

    /// [`free_resources`] under the pool lock
    pub fn free(&self, set: &mut ResourceAllocationSet) {
        free_resources(set, &mut self.lock());
    }
}
