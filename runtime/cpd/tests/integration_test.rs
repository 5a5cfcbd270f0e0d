//! Integration tests for firmware blob validation and package directories
//!
//! Blobs come from `FirmwareBuilder` and are then corrupted byte by byte
//! where a test needs a malformed image.

use ipu_cpd::*;

const FW_VERSION: u32 = 0x2023_1005;
const SRC_ADDR: u64 = 0x8000_0000;

/// Bump allocator that tracks live buffers
struct TestMemory {
    next: u64,
    live: usize,
    exhausted: bool,
}

impl TestMemory {
    fn new() -> Self {
        Self {
            next: 0x1000_0000,
            live: 0,
            exhausted: false,
        }
    }
}

impl DeviceMemory for TestMemory {
    fn alloc(&mut self, size: usize) -> Option<DeviceBuffer> {
        if self.exhausted {
            return None;
        }
        let address = self.next;
        self.next += (size as u64 + 0xfff) & !0xfff;
        self.live += 1;
        Some(DeviceBuffer::new(address, vec![0xcc; size].into_boxed_slice()))
    }

    fn free(&mut self, _buffer: DeviceBuffer) {
        self.live -= 1;
    }
}

fn firmware(components: usize) -> Vec<u8> {
    let mut builder = FirmwareBuilder::new(FW_VERSION).manifest(vec![0x5a; 64]);
    for i in 0..components {
        builder = builder.component(i as u32 + 1, 0x100 + i as u32, vec![i as u8; 32 + i * 8]);
    }
    builder.build()
}

fn set_u32(blob: &mut [u8], offset: usize, value: u32) {
    blob[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Offset of top-level entry `index` within the blob
fn entry_offset(index: usize) -> usize {
    CpdHeader::SIZE + index * CpdEntry::SIZE
}

#[test]
fn test_valid_firmware_accepted() {
    let blob = firmware(3);
    let image = validate_top_level(&blob, FW_VERSION).expect("valid blob rejected");
    assert_eq!(image.metadata().component_count(), 3);
    assert_eq!(image.module_data().components().entry_count(), 3);
}

#[test]
fn test_rejects_blob_shorter_than_header_length() {
    let blob = firmware(1);
    assert!(matches!(
        validate_top_level(&blob[..12], FW_VERSION),
        Err(CpdError::Truncated { size: 12 })
    ));

    let mut blob = firmware(1);
    blob[10] = 0xff;
    let short = &blob[..0x80];
    assert!(matches!(
        validate_top_level(short, FW_VERSION),
        Err(CpdError::BadHeaderLength { hdr_len: 0xff, .. })
    ));
}

#[test]
fn test_rejects_entry_beyond_data_size() {
    let mut blob = firmware(1);
    let len = blob.len() as u32;
    set_u32(&mut blob, entry_offset(METADATA_IDX) + 12, len - 4);
    set_u32(&mut blob, entry_offset(METADATA_IDX) + 16, 8);
    assert!(matches!(
        validate_top_level(&blob, FW_VERSION),
        Err(CpdError::EntryOutOfBounds { index: 1, .. })
    ));
}

#[test]
fn test_rejects_wrapping_entry() {
    let mut blob = firmware(1);
    set_u32(&mut blob, entry_offset(MANIFEST_IDX) + 12, u32::MAX - 1);
    set_u32(&mut blob, entry_offset(MANIFEST_IDX) + 16, 2);
    assert!(matches!(
        validate_top_level(&blob, FW_VERSION),
        Err(CpdError::EntryOutOfBounds { index: 0, .. })
    ));
}

#[test]
fn test_rejects_bad_marker() {
    let mut blob = firmware(1);
    set_u32(&mut blob, 0, 0x1234_5678);
    let result = validate_top_level(&blob, FW_VERSION);
    assert!(matches!(result, Err(CpdError::BadMarker { mark: 0x1234_5678 })));
    assert!(result.unwrap_err().is_structural());
}

#[test]
fn test_rejects_oversized_manifest() {
    let blob = FirmwareBuilder::new(FW_VERSION)
        .manifest(vec![0; MAX_MANIFEST_SIZE + 1])
        .build();
    assert!(matches!(
        validate_top_level(&blob, FW_VERSION),
        Err(CpdError::ManifestTooLarge { .. })
    ));
}

#[test]
fn test_rejects_version_mismatch() {
    let blob = firmware(2);
    assert!(matches!(
        validate_top_level(&blob, FW_VERSION + 1),
        Err(CpdError::VersionMismatch { found: FW_VERSION, .. })
    ));
}

#[test]
fn test_rejects_bad_nested_directory() {
    let blob = firmware(2);
    let image = validate_top_level(&blob, FW_VERSION).unwrap();
    let module_offset = image.module_data_offset() as usize;
    let module_len = image.module_data().bytes().len() as u32;

    // Second component entry points past the end of module data
    let mut blob = blob.clone();
    let nested_entry = module_offset + ModuleDataHeader::SIZE + CpdHeader::SIZE + CpdEntry::SIZE;
    set_u32(&mut blob, nested_entry + 12, module_len);
    set_u32(&mut blob, nested_entry + 16, 1);
    assert!(matches!(
        validate_top_level(&blob, FW_VERSION),
        Err(CpdError::EntryOutOfBounds { index: 1, .. })
    ));
}

fn check_table(components: usize) {
    let blob = firmware(components);
    let image = validate_top_level(&blob, FW_VERSION).unwrap();
    let mut memory = TestMemory::new();

    let table = build_device_table(&image, SRC_ADDR, &mut memory).expect("build failed");
    assert_eq!(table.header_mark(), PKG_DIR_HDR_MARK);
    assert_eq!(table.entry_count(), components as u64 + 1);
    assert_eq!(table.bytes().len(), PKG_DIR_SIZE + 64 + image.metadata().bytes().len());

    let directory = image.module_data().components();
    for i in 0..components {
        let entry = directory.entry(i).unwrap();
        let expected = SRC_ADDR + image.module_data_offset() as u64 + entry.offset as u64;
        assert_eq!(table.entry_address(i), Some(expected));
        assert_eq!(table.entry_size(i), Some(entry.len));
        assert_eq!(table.entry_type(i), Some(i as u8 + 1));
        assert_eq!(table.entry_version(i), Some(0x100 + i as u16));
    }
    if components < MAX_COMPONENTS {
        assert_eq!(table.entry_address(components), Some(0));
    }

    assert_eq!(table.manifest(), &[0x5a; 64][..]);
    assert_eq!(table.metadata(), image.metadata().bytes());

    table.release(&mut memory);
    assert_eq!(memory.live, 0);
}

#[test]
fn test_device_table_no_components() {
    check_table(0);
}

#[test]
fn test_device_table_one_component() {
    check_table(1);
}

#[test]
fn test_device_table_max_components() {
    check_table(MAX_COMPONENTS);
}

#[test]
fn test_device_table_too_many_components() {
    let blob = firmware(MAX_COMPONENTS + 1);
    let image = validate_top_level(&blob, FW_VERSION).unwrap();
    let mut memory = TestMemory::new();
    assert!(matches!(
        build_device_table(&image, SRC_ADDR, &mut memory),
        Err(CpdError::TooManyComponents { count: 16, max: 15 })
    ));
    assert_eq!(memory.live, 0);
}

#[test]
fn test_device_table_bad_component_id_releases_buffer() {
    let blob = FirmwareBuilder::new(FW_VERSION)
        .component(1, 1, vec![0; 8])
        .component(MAX_COMPONENT_ID + 1, 1, vec![0; 8])
        .build();
    let image = validate_top_level(&blob, FW_VERSION).unwrap();
    let mut memory = TestMemory::new();

    assert!(matches!(
        build_device_table(&image, SRC_ADDR, &mut memory),
        Err(CpdError::InvalidComponentId { id: 128 })
    ));
    assert_eq!(memory.live, 0);
}

#[test]
fn test_device_table_bad_component_version_releases_buffer() {
    let blob = FirmwareBuilder::new(FW_VERSION)
        .component(1, MAX_COMPONENT_VERSION + 1, vec![0; 8])
        .build();
    let image = validate_top_level(&blob, FW_VERSION).unwrap();
    let mut memory = TestMemory::new();

    assert!(matches!(
        build_device_table(&image, SRC_ADDR, &mut memory),
        Err(CpdError::InvalidComponentVersion { version: 0x10000 })
    ));
    assert_eq!(memory.live, 0);
}

#[test]
fn test_device_table_address_overflow_releases_buffer() {
    let blob = firmware(2);
    let image = validate_top_level(&blob, FW_VERSION).unwrap();
    let mut memory = TestMemory::new();

    let err = build_device_table(&image, u64::MAX - 1, &mut memory).unwrap_err();
    assert!(matches!(err, CpdError::AddressOverflow { .. }));
    assert!(err.is_structural());
    assert_eq!(memory.live, 0);
}

#[test]
fn test_device_table_allocation_failure() {
    let blob = firmware(1);
    let image = validate_top_level(&blob, FW_VERSION).unwrap();
    let mut memory = TestMemory::new();
    memory.exhausted = true;

    let result = build_device_table(&image, SRC_ADDR, &mut memory);
    assert!(matches!(result, Err(CpdError::AllocationFailed { .. })));
    assert!(!result.err().map_or(true, |e| e.is_structural()));
}
