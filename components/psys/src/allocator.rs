//! Drawing a process group's cells and channels from a pool
//!
//! [`allocate_resources`] is all-or-nothing: on any failure every cell and
//! channel drawn by the call goes back, and the pool, the allocation set and
//! the process group all read exactly as they did before.

use psys_resources::{
    CellId, CellMask, ResourceAllocationSet, ResourceDefs, ResourceError, ResourceId,
    ResourcePool,
};

use crate::error::{PsysError, Result};
use crate::manifest::{CellRequirement, ProgramGroupManifest, ProgramManifest};
use crate::pg::ProcessGroup;

/// Reserve every process's cell and channel draws in `pool`
///
/// The chosen cell and each channel's start offset are written into the
/// process entries of `pg`; the draws are appended to `set` and the cells
/// added to its mask.
///
/// # Errors
/// Exhaustion (`CellBusy`, `NoFreeCell`, `Exhausted`) is retryable; a
/// missing program, unknown cell or full set is not.
pub fn allocate_resources(
    pg: &mut ProcessGroup,
    manifest: &ProgramGroupManifest,
    set: &mut ResourceAllocationSet,
    pool: &mut ResourcePool,
    defs: &ResourceDefs,
) -> Result<()> {
    let snapshot = pg.clone();
    let mark = set.len();
    let mut cells = CellMask::EMPTY;

    let result = (0..pg.process_count()).try_for_each(|index| {
        let program_id = pg
            .process(index)
            .map(|p| p.program_id)
            .ok_or(PsysError::InvalidProcessGroup {
                reason: "process index out of range",
            })?;
        let program = manifest
            .program(program_id)
            .ok_or(PsysError::MissingProgram { program_id })?;

        if let Some(cell) = select_cell(program, pool, defs, cells)? {
            cells.insert(cell);
            pg.set_process_cell(index, cell)?;
        }
        draw_channels(pg, index, program, set, pool)
    });

    let result = result.and_then(|()| {
        pool.reserve_cells(cells)?;
        Ok(())
    });

    match result {
        Ok(()) => {
            set.add_cells(cells);
            pg.set_resource_bitmap(set.cells().bits());
            log::debug!(
                "pg {}: cells {:#x}, {} channel draws",
                pg.id(),
                cells.bits(),
                set.len() - mark
            );
            Ok(())
        }
        Err(err) => {
            while set.len() > mark {
                if let Some(record) = set.pop() {
                    if let Ok(resource) = pool.resource_mut(record.resource) {
                        resource.free(&record);
                    }
                }
            }
            *pg = snapshot;
            log::debug!("allocation rolled back: {}", err);
            Err(err)
        }
    }
}

fn select_cell(
    program: &ProgramManifest,
    pool: &ResourcePool,
    defs: &ResourceDefs,
    taken: CellMask,
) -> Result<Option<CellId>> {
    let held = |cell: CellId| pool.is_cell_reserved(cell) || taken.contains(cell);
    match program.cell {
        CellRequirement::None => Ok(None),
        CellRequirement::Fixed(cell) => {
            if cell as usize >= pool.num_cells() {
                return Err(ResourceError::UnknownCell { cell }.into());
            }
            if held(cell) {
                return Err(ResourceError::CellBusy { cell }.into());
            }
            Ok(Some(cell))
        }
        CellRequirement::Type(cell_type) => defs
            .cells_of_type(cell_type)
            .find(|&cell| !held(cell))
            .map(Some)
            .ok_or_else(|| ResourceError::NoFreeCell { cell_type }.into()),
    }
}

fn draw_channels(
    pg: &mut ProcessGroup,
    index: usize,
    program: &ProgramManifest,
    set: &mut ResourceAllocationSet,
    pool: &mut ResourcePool,
) -> Result<()> {
    for (kind, channel) in program.channels.iter().enumerate() {
        if channel.size == 0 {
            continue;
        }

        let resource = pool.resource_mut(kind as ResourceId)?;
        let record = match channel.offset {
            Some(offset) => resource.allocate_at(offset as usize, channel.size as usize)?,
            None => resource.allocate(channel.size as usize)?,
        };
        if let Err(err) = set.push(record) {
            resource.free(&record);
            return Err(err.into());
        }
        pg.set_process_channel_offset(index, kind, record.start)?;
    }
    Ok(())
}
