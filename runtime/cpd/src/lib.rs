//! IPU CPD - Firmware package directory validation and device tables
//!
//! # Purpose
//! The process-system firmware ships as a CPD blob: a directory header and
//! entry array pointing at a manifest, a metadata block and a module-data
//! block, the last of which embeds a second directory listing the firmware
//! components. Before the firmware can boot, the host validates the blob and
//! builds a fixed-layout package directory in device memory telling the
//! firmware where each component lives.
//!
//! # Integration Points
//! - Depends on: a [`DeviceMemory`] allocator for the package directory
//! - Provides to: firmware load in `ipu-psys`, plus the little-endian
//!   field helpers in [`bytes`] that its process-group codecs share
//!
//! # Architecture
//! Validation is a pure pass over the blob returning borrowed views
//! ([`Directory`], [`Metadata`], [`ModuleData`], [`FirmwareImage`]). Every
//! offset/length pair is checked with subtraction, never addition, so
//! wrapping values are rejected. [`build_device_table`] consumes a validated
//! [`FirmwareImage`] and releases its buffer on any failure.
//!
//! Component `i` of the nested directory is paired with metadata record `i`
//! purely by position.
//!
//! # Testing Strategy
//! - Unit tests: record layout, each validation rule, table packing
//! - Integration tests: full blobs produced by [`FirmwareBuilder`]

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod bytes;
mod layout;
mod pkg_dir;
mod validate;
mod writer;

pub use layout::{CpdEntry, CpdHeader, MetadataComponent, MetadataExtension, ModuleDataHeader};
pub use pkg_dir::{build_device_table, DeviceBuffer, DeviceMemory, PackageDirectory};
pub use validate::{
    validate, validate_metadata, validate_module_data, validate_top_level, Directory,
    FirmwareImage, Metadata, ModuleData,
};
pub use writer::{ComponentImage, FirmwareBuilder};

use thiserror::Error;

/// "$CPD"
pub const CPD_HDR_MARK: u32 = 0x4450_4324;

/// "_IUPKDR_"
pub const PKG_DIR_HDR_MARK: u64 = 0x5f49_5550_4b44_525f;

/// Entries in the device package directory, header included
pub const PKG_DIR_ENTRIES: usize = 16;

/// 64-bit words per package directory entry
pub const PKG_DIR_ENT_LEN: usize = 2;

/// Bytes occupied by the package directory entry table
pub const PKG_DIR_SIZE: usize = PKG_DIR_ENTRIES * PKG_DIR_ENT_LEN * 8;

/// Components a package directory can describe
pub const MAX_COMPONENTS: usize = PKG_DIR_ENTRIES - 1;

pub const MAX_COMPONENT_ID: u32 = 127;
pub const MAX_COMPONENT_VERSION: u32 = 0xffff;
pub const MAX_COMPONENT_SIZE: u32 = 0x00ff_ffff;

pub const MAX_MANIFEST_SIZE: usize = 2048 * 4;
pub const MAX_METADATA_SIZE: usize = 64 * 1024;

pub const METADATA_EXTN_TYPE_IUNIT: u32 = 0x10;
pub const METADATA_IMAGE_TYPE_MAIN_FIRMWARE: u32 = 1;

pub const MANIFEST_IDX: usize = 0;
pub const METADATA_IDX: usize = 1;
pub const MODULEDATA_IDX: usize = 2;

/// Error types for firmware blob handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpdError {
    #[error("Blob too short for a directory header ({size} bytes)")]
    Truncated { size: usize },

    #[error("Declared header length {hdr_len} invalid for {size}-byte blob")]
    BadHeaderLength { hdr_len: usize, size: usize },

    #[error("{count} entries do not fit in {size}-byte blob")]
    EntryTableOverflow { count: u32, size: usize },

    #[error("Entry {index} ({offset:#x}+{len:#x}) exceeds data size {data_size:#x}")]
    EntryOutOfBounds {
        index: usize,
        offset: u32,
        len: u32,
        data_size: usize,
    },

    #[error("Bad directory marker {mark:#x}")]
    BadMarker { mark: u32 },

    #[error("Directory has {count} entries, need {needed}")]
    MissingEntries { count: u32, needed: u32 },

    #[error("Manifest too large ({len} bytes)")]
    ManifestTooLarge { len: usize },

    #[error("Metadata size {len} invalid")]
    BadMetadataSize { len: usize },

    #[error("Metadata type mismatch (extension {extn_type:#x}, image {img_type:#x})")]
    BadMetadataType { extn_type: u32, img_type: u32 },

    #[error("Module data too short ({len} bytes)")]
    ModuleDataTruncated { len: usize },

    #[error("Firmware library version {found:#x} does not match expected {expected:#x}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Too many components ({count}, max {max})")]
    TooManyComponents { count: usize, max: usize },

    #[error("No metadata record for component {index}")]
    MissingComponent { index: usize },

    #[error("Component id {id} out of range")]
    InvalidComponentId { id: u32 },

    #[error("Component version {version:#x} out of range")]
    InvalidComponentVersion { version: u32 },

    #[error("Component size {size:#x} out of range")]
    InvalidComponentSize { size: u32 },

    #[error("Component address {base:#x}+{offset:#x} overflows")]
    AddressOverflow { base: u64, offset: u64 },

    #[error("Device memory allocation of {size} bytes failed")]
    AllocationFailed { size: usize },
}

impl CpdError {
    /// True for malformed blobs; such firmware must never be retried
    pub fn is_structural(&self) -> bool {
        !matches!(self, CpdError::AllocationFailed { .. })
    }
}

pub type Result<T> = core::result::Result<T, CpdError>;
