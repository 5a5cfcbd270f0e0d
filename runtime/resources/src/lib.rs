//! Process-System Resources - Cell and channel pools for IPU jobs
//!
//! # Purpose
//! Tracks ownership of the hardware compute cells and DMA channels that the
//! IPU firmware schedules process groups onto. Every job draws its cells and
//! channel ranges from a [`ResourcePool`] and records them in a fixed-capacity
//! [`ResourceAllocationSet`] so they can be released, rolled back, or promoted
//! to another pool deterministically.
//!
//! # Integration Points
//! - Depends on: nothing beyond `alloc`
//! - Provides to: the process-system job layer (`ipu-psys`)
//! - Locking: [`LockedPool`] serializes all mutation of one pool
//!
//! # Architecture
//! A [`Resource`] is a bitmap over the elements of one channel kind. A
//! [`ResourcePool`] owns one resource per kind, indexed by [`ResourceId`], plus
//! a pool-wide [`CellMask`]. Allocation records are plain
//! `(resource, start, length)` tuples, never references into the pool, which
//! keeps rollback and promotion free of aliasing concerns.
//!
//! Two pools exist at runtime: "started" holds reservations made ahead of
//! hardware execution, "running" holds those of jobs the firmware is executing.
//! [`move_resources`] promotes a set between them all-or-nothing.
//!
//! # Testing Strategy
//! - Unit tests: bitmap scans, draws, frees, move/free semantics
//! - Integration tests: multi-job pool scenarios across two pools
//! - Benchmarks: first-fit scan cost (`benches/pool_bench.rs`)

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod bitmap;
mod defs;
mod pool;
mod resource;
mod set;

pub use bitmap::Bitmap;
pub use defs::{channel, ResourceDefs, MAX_CELLS};
pub use pool::{free_resources, move_resources, LockedPool, ResourcePool};
pub use resource::{Resource, ResourceAllocationRecord};
pub use set::{CellMask, ResourceAllocationSet, MAX_RESOURCES};

use thiserror::Error;

/// Channel kind index within a pool
pub type ResourceId = u8;

/// Compute cell index within a pool
pub type CellId = u8;

/// Error types for pool operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Resource {resource} exhausted ({requested} elements requested)")]
    Exhausted { resource: ResourceId, requested: usize },

    #[error("Cell {cell} already reserved")]
    CellBusy { cell: CellId },

    #[error("No free cell of type {cell_type}")]
    NoFreeCell { cell_type: u8 },

    #[error("Target pool already holds part of the allocation")]
    Conflict,

    #[error("Allocation set full ({capacity} records)")]
    CapacityOverflow { capacity: usize },

    #[error("Unknown cell {cell}")]
    UnknownCell { cell: CellId },

    #[error("Unknown resource {resource}")]
    UnknownResource { resource: ResourceId },

    #[error("Range {start}+{len} outside resource {resource}")]
    OutOfRange {
        resource: ResourceId,
        start: usize,
        len: usize,
    },

    #[error("Too many cells: {count} (max {max})")]
    TooManyCells { count: usize, max: usize },
}

impl ResourceError {
    /// True when the failure only means "not now": the caller may retry once
    /// other jobs release their reservations.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            ResourceError::Exhausted { .. }
                | ResourceError::CellBusy { .. }
                | ResourceError::NoFreeCell { .. }
                | ResourceError::Conflict
        )
    }
}

pub type Result<T> = core::result::Result<T, ResourceError>;
