//! Device package directory
//!
//! Layout, all little-endian 64-bit words:
//! - entry 0: `{PKG_DIR_HDR_MARK, component count + 1}`
//! - entry i: `{device address, size[23:0] | version[47:32] | id[54:48]}`
//! - unused entries up to [`PKG_DIR_ENTRIES`] are zero
//! - then the manifest bytes, then the metadata bytes

use alloc::boxed::Box;

use crate::bytes::{read_u64, write_u64};
use crate::validate::FirmwareImage;
use crate::{
    CpdError, Result, MAX_COMPONENTS, MAX_COMPONENT_ID, MAX_COMPONENT_SIZE,
    MAX_COMPONENT_VERSION, PKG_DIR_ENTRIES, PKG_DIR_ENT_LEN, PKG_DIR_HDR_MARK, PKG_DIR_SIZE,
};

const SIZE_MASK: u64 = 0x00ff_ffff;
const VERSION_SHIFT: u32 = 32;
const VERSION_MASK: u64 = 0xffff;
const TYPE_SHIFT: u32 = 48;
const TYPE_MASK: u64 = 0x7f;

/// Device-addressable memory with a host view
#[derive(Debug)]
pub struct DeviceBuffer {
    device_address: u64,
    host: Box<[u8]>,
}

impl DeviceBuffer {
    pub fn new(device_address: u64, host: Box<[u8]>) -> Self {
        Self {
            device_address,
            host,
        }
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.host
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.host
    }
}

/// Allocator for memory the firmware can address
pub trait DeviceMemory {
    /// Allocate `size` bytes; `None` when memory is exhausted
    fn alloc(&mut self, size: usize) -> Option<DeviceBuffer>;

    fn free(&mut self, buffer: DeviceBuffer);
}

/// Package directory built in device memory
#[derive(Debug)]
pub struct PackageDirectory {
    buffer: DeviceBuffer,
    manifest_len: usize,
    metadata_len: usize,
}

impl PackageDirectory {
    pub fn device_address(&self) -> u64 {
        self.buffer.device_address()
    }

    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    fn word(&self, index: usize) -> u64 {
        read_u64(self.buffer.as_slice(), index * 8)
    }

    fn component_word(&self, component: usize, word: usize) -> Option<u64> {
        (component < MAX_COMPONENTS).then(|| self.word((component + 1) * PKG_DIR_ENT_LEN + word))
    }

    pub fn header_mark(&self) -> u64 {
        self.word(0)
    }

    /// Entry count as written in the header, header entry included
    pub fn entry_count(&self) -> u64 {
        self.word(1)
    }

    /// Device address of component `component`
    pub fn entry_address(&self, component: usize) -> Option<u64> {
        self.component_word(component, 0)
    }

    pub fn entry_size(&self, component: usize) -> Option<u32> {
        self.component_word(component, 1)
            .map(|word| (word & SIZE_MASK) as u32)
    }

    pub fn entry_version(&self, component: usize) -> Option<u16> {
        self.component_word(component, 1)
            .map(|word| ((word >> VERSION_SHIFT) & VERSION_MASK) as u16)
    }

    /// Component id ("type") of component `component`
    pub fn entry_type(&self, component: usize) -> Option<u8> {
        self.component_word(component, 1)
            .map(|word| ((word >> TYPE_SHIFT) & TYPE_MASK) as u8)
    }

    pub fn manifest(&self) -> &[u8] {
        &self.bytes()[PKG_DIR_SIZE..PKG_DIR_SIZE + self.manifest_len]
    }

    pub fn metadata(&self) -> &[u8] {
        let start = PKG_DIR_SIZE + self.manifest_len;
        &self.bytes()[start..start + self.metadata_len]
    }

    /// Hand the buffer back to the allocator it came from
    pub fn release(self, memory: &mut dyn DeviceMemory) {
        memory.free(self.buffer);
    }
}

fn pack_entry(size: u32, id: u32, version: u32) -> u64 {
    (size as u64 & SIZE_MASK)
        | ((version as u64 & VERSION_MASK) << VERSION_SHIFT)
        | ((id as u64 & TYPE_MASK) << TYPE_SHIFT)
}

fn put_word(bytes: &mut [u8], index: usize, value: u64) {
    write_u64(bytes, index * 8, value);
}

/// Build the package directory for a validated firmware image
///
/// `src_device_address` is where the firmware blob itself is visible to the
/// device; component addresses are computed from it. The buffer is released
/// again if any component fails its range checks.
pub fn build_device_table(
    image: &FirmwareImage<'_>,
    src_device_address: u64,
    memory: &mut dyn DeviceMemory,
) -> Result<PackageDirectory> {
    let components = image.module_data().components();
    if components.entry_count() > MAX_COMPONENTS {
        return Err(CpdError::TooManyComponents {
            count: components.entry_count(),
            max: MAX_COMPONENTS,
        });
    }

    let manifest = image.manifest();
    let metadata = image.metadata().bytes();
    let size = PKG_DIR_SIZE + manifest.len() + metadata.len();

    let mut buffer = memory.alloc(size).ok_or(CpdError::AllocationFailed { size })?;
    if buffer.len() < size {
        memory.free(buffer);
        return Err(CpdError::AllocationFailed { size });
    }

    if let Err(err) = fill_table(image, src_device_address, buffer.as_mut_slice()) {
        log::error!("package directory build failed: {}", err);
        memory.free(buffer);
        return Err(err);
    }

    log::debug!(
        "package directory at {:#x}: {} components, {} bytes",
        buffer.device_address(),
        components.entry_count(),
        size
    );
    Ok(PackageDirectory {
        buffer,
        manifest_len: manifest.len(),
        metadata_len: metadata.len(),
    })
}

fn fill_table(image: &FirmwareImage<'_>, src_device_address: u64, out: &mut [u8]) -> Result<()> {
    let components = image.module_data().components();
    let metadata = image.metadata();
    let module_base = device_offset(src_device_address, image.module_data_offset() as u64)?;

    out[..PKG_DIR_SIZE].fill(0);
    put_word(out, 0, PKG_DIR_HDR_MARK);
    put_word(out, 1, components.entry_count() as u64 + 1);

    for (index, entry) in components.entries().enumerate() {
        let record = metadata
            .component(index)
            .ok_or(CpdError::MissingComponent { index })?;
        if record.id > MAX_COMPONENT_ID {
            return Err(CpdError::InvalidComponentId { id: record.id });
        }
        if record.ver > MAX_COMPONENT_VERSION {
            return Err(CpdError::InvalidComponentVersion {
                version: record.ver,
            });
        }
        if entry.len > MAX_COMPONENT_SIZE {
            return Err(CpdError::InvalidComponentSize { size: entry.len });
        }

        let slot = (index + 1) * PKG_DIR_ENT_LEN;
        debug_assert!(index + 1 < PKG_DIR_ENTRIES);
        put_word(out, slot, device_offset(module_base, entry.offset as u64)?);
        put_word(out, slot + 1, pack_entry(entry.len, record.id, record.ver));
    }

    let manifest = image.manifest();
    let metadata = metadata.bytes();
    out[PKG_DIR_SIZE..PKG_DIR_SIZE + manifest.len()].copy_from_slice(manifest);
    let start = PKG_DIR_SIZE + manifest.len();
    out[start..start + metadata.len()].copy_from_slice(metadata);
    Ok(())
}

fn device_offset(base: u64, offset: u64) -> Result<u64> {
    base.checked_add(offset)
        .ok_or(CpdError::AddressOverflow { base, offset })
}
