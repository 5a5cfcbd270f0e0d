//! Little-endian wire layout of firmware blob records
//!
//! Each record mirrors a `#[repr(C)]` struct whose size is pinned at compile
//! time; decoding goes field by field so no alignment is assumed of the blob.

use static_assertions::const_assert_eq;

use crate::bytes::{read_u32, write_u32};

/// Directory header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CpdHeader {
    pub hdr_mark: u32,
    pub ent_cnt: u32,
    pub hdr_ver: u8,
    pub ent_ver: u8,
    pub hdr_len: u8,
    pub chksm: u8,
    pub name: u32,
}

const_assert_eq!(core::mem::size_of::<CpdHeader>(), CpdHeader::SIZE);

impl CpdHeader {
    pub const SIZE: usize = 16;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            hdr_mark: read_u32(bytes, 0),
            ent_cnt: read_u32(bytes, 4),
            hdr_ver: bytes[8],
            ent_ver: bytes[9],
            hdr_len: bytes[10],
            chksm: bytes[11],
            name: read_u32(bytes, 12),
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        write_u32(out, 0, self.hdr_mark);
        write_u32(out, 4, self.ent_cnt);
        out[8] = self.hdr_ver;
        out[9] = self.ent_ver;
        out[10] = self.hdr_len;
        out[11] = self.chksm;
        write_u32(out, 12, self.name);
    }
}

/// Directory entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CpdEntry {
    pub name: [u8; 12],
    pub offset: u32,
    pub len: u32,
    pub rsvd: [u8; 4],
}

const_assert_eq!(core::mem::size_of::<CpdEntry>(), CpdEntry::SIZE);

impl CpdEntry {
    pub const SIZE: usize = 24;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut name = [0u8; 12];
        name.copy_from_slice(&bytes[..12]);
        let mut rsvd = [0u8; 4];
        rsvd.copy_from_slice(&bytes[20..24]);
        Some(Self {
            name,
            offset: read_u32(bytes, 12),
            len: read_u32(bytes, 16),
            rsvd,
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[..12].copy_from_slice(&self.name);
        write_u32(out, 12, self.offset);
        write_u32(out, 16, self.len);
        out[20..24].copy_from_slice(&self.rsvd);
    }

    /// Entry name up to the first NUL
    pub fn name(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        &self.name[..end]
    }

    pub fn with_name(name: &str, offset: u32, len: u32) -> Self {
        let mut raw = [0u8; 12];
        let bytes = name.as_bytes();
        let n = bytes.len().min(raw.len());
        raw[..n].copy_from_slice(&bytes[..n]);
        Self {
            name: raw,
            offset,
            len,
            rsvd: [0; 4],
        }
    }
}

/// Metadata extension header preceding the component records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MetadataExtension {
    pub extn_type: u32,
    pub len: u32,
    pub img_type: u32,
    pub rsvd: [u32; 16],
}

const_assert_eq!(core::mem::size_of::<MetadataExtension>(), MetadataExtension::SIZE);

impl MetadataExtension {
    pub const SIZE: usize = 76;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut rsvd = [0u32; 16];
        for (i, word) in rsvd.iter_mut().enumerate() {
            *word = read_u32(bytes, 12 + i * 4);
        }
        Some(Self {
            extn_type: read_u32(bytes, 0),
            len: read_u32(bytes, 4),
            img_type: read_u32(bytes, 8),
            rsvd,
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        write_u32(out, 0, self.extn_type);
        write_u32(out, 4, self.len);
        write_u32(out, 8, self.img_type);
        for (i, word) in self.rsvd.iter().enumerate() {
            write_u32(out, 12 + i * 4, *word);
        }
    }
}

/// Per-component metadata record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MetadataComponent {
    pub id: u32,
    pub size: u32,
    pub ver: u32,
    pub sha2_hash: [u8; 32],
    pub entry_point: u32,
    pub icache_base_offs: u32,
    pub attrs: [u8; 16],
    pub rsvd: [u8; 4],
}

const_assert_eq!(core::mem::size_of::<MetadataComponent>(), MetadataComponent::SIZE);

impl MetadataComponent {
    pub const SIZE: usize = 72;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut sha2_hash = [0u8; 32];
        sha2_hash.copy_from_slice(&bytes[12..44]);
        let mut attrs = [0u8; 16];
        attrs.copy_from_slice(&bytes[52..68]);
        let mut rsvd = [0u8; 4];
        rsvd.copy_from_slice(&bytes[68..72]);
        Some(Self {
            id: read_u32(bytes, 0),
            size: read_u32(bytes, 4),
            ver: read_u32(bytes, 8),
            sha2_hash,
            entry_point: read_u32(bytes, 44),
            icache_base_offs: read_u32(bytes, 48),
            attrs,
            rsvd,
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        write_u32(out, 0, self.id);
        write_u32(out, 4, self.size);
        write_u32(out, 8, self.ver);
        out[12..44].copy_from_slice(&self.sha2_hash);
        write_u32(out, 44, self.entry_point);
        write_u32(out, 48, self.icache_base_offs);
        out[52..68].copy_from_slice(&self.attrs);
        out[68..72].copy_from_slice(&self.rsvd);
    }
}

/// Header at the start of the module-data entry
///
/// `hdr_len` gives the offset of the nested directory inside module data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ModuleDataHeader {
    pub hdr_len: u32,
    pub endian: u32,
    pub fw_pkg_date: u32,
    pub hive_sdk_date: u32,
    pub compiler_date: u32,
    pub target_platform: u32,
}

const_assert_eq!(core::mem::size_of::<ModuleDataHeader>(), ModuleDataHeader::SIZE);

impl ModuleDataHeader {
    pub const SIZE: usize = 24;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            hdr_len: read_u32(bytes, 0),
            endian: read_u32(bytes, 4),
            fw_pkg_date: read_u32(bytes, 8),
            hive_sdk_date: read_u32(bytes, 12),
            compiler_date: read_u32(bytes, 16),
            target_platform: read_u32(bytes, 20),
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        write_u32(out, 0, self.hdr_len);
        write_u32(out, 4, self.endian);
        write_u32(out, 8, self.fw_pkg_date);
        write_u32(out, 12, self.hive_sdk_date);
        write_u32(out, 16, self.compiler_date);
        write_u32(out, 20, self.target_platform);
    }
}
