//! Blob validation
//!
//! Each validator returns a borrowed view over the checked bytes; views only
//! exist for blobs that passed.

use crate::layout::{CpdEntry, CpdHeader, MetadataComponent, MetadataExtension, ModuleDataHeader};
use crate::{
    CpdError, Result, CPD_HDR_MARK, MANIFEST_IDX, MAX_MANIFEST_SIZE, MAX_METADATA_SIZE,
    METADATA_EXTN_TYPE_IUNIT, METADATA_IDX, METADATA_IMAGE_TYPE_MAIN_FIRMWARE, MODULEDATA_IDX,
};

/// A directory whose entry table and entry ranges have been checked
#[derive(Debug, Clone, Copy)]
pub struct Directory<'a> {
    bytes: &'a [u8],
    header: CpdHeader,
}

impl<'a> Directory<'a> {
    pub fn header(&self) -> &CpdHeader {
        &self.header
    }

    pub fn entry_count(&self) -> usize {
        self.header.ent_cnt as usize
    }

    pub fn entry(&self, index: usize) -> Option<CpdEntry> {
        if index >= self.entry_count() {
            return None;
        }
        let start = self.header.hdr_len as usize + index * CpdEntry::SIZE;
        CpdEntry::decode(self.bytes.get(start..)?)
    }

    pub fn entries(&self) -> impl Iterator<Item = CpdEntry> + '_ {
        (0..self.entry_count()).filter_map(move |index| self.entry(index))
    }
}

/// Check a directory's structure
///
/// `cpd` holds the header and entry table; entry ranges are checked against
/// `data_size`, the size of the region their offsets are relative to.
pub fn validate(cpd: &[u8], data_size: usize) -> Result<Directory<'_>> {
    let header = CpdHeader::decode(cpd).ok_or(CpdError::Truncated { size: cpd.len() })?;

    let hdr_len = header.hdr_len as usize;
    if hdr_len < CpdHeader::SIZE || cpd.len() < hdr_len {
        return Err(CpdError::BadHeaderLength {
            hdr_len,
            size: cpd.len(),
        });
    }

    if ((cpd.len() - hdr_len) / CpdEntry::SIZE) < header.ent_cnt as usize {
        return Err(CpdError::EntryTableOverflow {
            count: header.ent_cnt,
            size: cpd.len(),
        });
    }

    let directory = Directory { bytes: cpd, header };
    for (index, entry) in directory.entries().enumerate() {
        let offset = entry.offset as usize;
        let len = entry.len as usize;
        if data_size < offset || data_size - offset < len {
            return Err(CpdError::EntryOutOfBounds {
                index,
                offset: entry.offset,
                len: entry.len,
                data_size,
            });
        }
    }

    Ok(directory)
}

/// Validated metadata block
#[derive(Debug, Clone, Copy)]
pub struct Metadata<'a> {
    bytes: &'a [u8],
    extension: MetadataExtension,
}

impl<'a> Metadata<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn extension(&self) -> &MetadataExtension {
        &self.extension
    }

    pub fn component_count(&self) -> usize {
        (self.bytes.len() - MetadataExtension::SIZE) / MetadataComponent::SIZE
    }

    pub fn component(&self, index: usize) -> Option<MetadataComponent> {
        if index >= self.component_count() {
            return None;
        }
        let start = MetadataExtension::SIZE + index * MetadataComponent::SIZE;
        MetadataComponent::decode(&self.bytes[start..])
    }
}

pub fn validate_metadata(bytes: &[u8]) -> Result<Metadata<'_>> {
    if bytes.len() > MAX_METADATA_SIZE {
        return Err(CpdError::BadMetadataSize { len: bytes.len() });
    }
    let extension =
        MetadataExtension::decode(bytes).ok_or(CpdError::BadMetadataSize { len: bytes.len() })?;

    if extension.extn_type != METADATA_EXTN_TYPE_IUNIT
        || extension.img_type != METADATA_IMAGE_TYPE_MAIN_FIRMWARE
    {
        return Err(CpdError::BadMetadataType {
            extn_type: extension.extn_type,
            img_type: extension.img_type,
        });
    }

    if (bytes.len() - MetadataExtension::SIZE) % MetadataComponent::SIZE != 0 {
        return Err(CpdError::BadMetadataSize { len: bytes.len() });
    }

    Ok(Metadata { bytes, extension })
}

/// Validated module-data block with its nested component directory
#[derive(Debug, Clone, Copy)]
pub struct ModuleData<'a> {
    bytes: &'a [u8],
    header: ModuleDataHeader,
    directory: Directory<'a>,
}

impl<'a> ModuleData<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn header(&self) -> &ModuleDataHeader {
        &self.header
    }

    /// Component directory; entry offsets are relative to module data
    pub fn components(&self) -> &Directory<'a> {
        &self.directory
    }
}

/// Check module data and its nested directory
///
/// The firmware package version must equal `expected_version` exactly.
pub fn validate_module_data(bytes: &[u8], expected_version: u32) -> Result<ModuleData<'_>> {
    let header =
        ModuleDataHeader::decode(bytes).ok_or(CpdError::ModuleDataTruncated { len: bytes.len() })?;

    let hdr_len = header.hdr_len as usize;
    if bytes.len() < hdr_len {
        return Err(CpdError::ModuleDataTruncated { len: bytes.len() });
    }

    if header.fw_pkg_date != expected_version {
        return Err(CpdError::VersionMismatch {
            expected: expected_version,
            found: header.fw_pkg_date,
        });
    }

    let directory = validate(&bytes[hdr_len..], bytes.len())?;
    Ok(ModuleData {
        bytes,
        header,
        directory,
    })
}

/// A fully validated firmware blob
#[derive(Debug, Clone, Copy)]
pub struct FirmwareImage<'a> {
    directory: Directory<'a>,
    manifest: &'a [u8],
    metadata: Metadata<'a>,
    module_data: ModuleData<'a>,
    module_data_offset: u32,
}

impl<'a> FirmwareImage<'a> {
    pub fn directory(&self) -> &Directory<'a> {
        &self.directory
    }

    pub fn manifest(&self) -> &'a [u8] {
        self.manifest
    }

    pub fn metadata(&self) -> &Metadata<'a> {
        &self.metadata
    }

    pub fn module_data(&self) -> &ModuleData<'a> {
        &self.module_data
    }

    /// Offset of module data within the blob
    pub fn module_data_offset(&self) -> u32 {
        self.module_data_offset
    }

    pub fn fw_version(&self) -> u32 {
        self.module_data.header.fw_pkg_date
    }
}

fn entry_bytes<'a>(
    file: &'a [u8],
    directory: &Directory<'a>,
    index: usize,
) -> Result<(CpdEntry, &'a [u8])> {
    let entry = directory.entry(index).ok_or(CpdError::MissingEntries {
        count: directory.header.ent_cnt,
        needed: index as u32 + 1,
    })?;
    let start = entry.offset as usize;
    Ok((entry, &file[start..start + entry.len as usize]))
}

/// Validate a complete firmware file
pub fn validate_top_level(file: &[u8], expected_version: u32) -> Result<FirmwareImage<'_>> {
    let directory = validate(file, file.len())?;

    if directory.header.hdr_mark != CPD_HDR_MARK {
        return Err(CpdError::BadMarker {
            mark: directory.header.hdr_mark,
        });
    }

    let needed = MODULEDATA_IDX as u32 + 1;
    if directory.header.ent_cnt < needed {
        return Err(CpdError::MissingEntries {
            count: directory.header.ent_cnt,
            needed,
        });
    }

    let (_, manifest) = entry_bytes(file, &directory, MANIFEST_IDX)?;
    if manifest.len() > MAX_MANIFEST_SIZE {
        return Err(CpdError::ManifestTooLarge {
            len: manifest.len(),
        });
    }

    let (_, metadata) = entry_bytes(file, &directory, METADATA_IDX)?;
    let metadata = validate_metadata(metadata)?;

    let (module_entry, module_data) = entry_bytes(file, &directory, MODULEDATA_IDX)?;
    let module_data = validate_module_data(module_data, expected_version)?;

    Ok(FirmwareImage {
        directory,
        manifest,
        metadata,
        module_data,
        module_data_offset: module_entry.offset,
    })
}
