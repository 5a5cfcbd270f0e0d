//! Firmware blob writer
//!
//! Produces blobs in the layout [`validate_top_level`](crate::validate_top_level)
//! accepts. Used by packaging tools and by simulators that need a bootable
//! image.

use alloc::vec;
use alloc::vec::Vec;

use crate::layout::{CpdEntry, CpdHeader, MetadataComponent, MetadataExtension, ModuleDataHeader};
use crate::{CPD_HDR_MARK, METADATA_EXTN_TYPE_IUNIT, METADATA_IMAGE_TYPE_MAIN_FIRMWARE};

/// One firmware component: its metadata identity and its payload
#[derive(Debug, Clone)]
pub struct ComponentImage {
    pub id: u32,
    pub version: u32,
    pub payload: Vec<u8>,
}

/// Builder for a top-level CPD blob
#[derive(Debug, Clone, Default)]
pub struct FirmwareBuilder {
    manifest: Vec<u8>,
    components: Vec<ComponentImage>,
    fw_version: u32,
}

impl FirmwareBuilder {
    pub fn new(fw_version: u32) -> Self {
        Self {
            fw_version,
            ..Default::default()
        }
    }

    pub fn manifest(mut self, manifest: Vec<u8>) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn component(mut self, id: u32, version: u32, payload: Vec<u8>) -> Self {
        self.components.push(ComponentImage {
            id,
            version,
            payload,
        });
        self
    }

    /// Metadata block: extension header followed by one record per component
    pub fn build_metadata(&self) -> Vec<u8> {
        let len = MetadataExtension::SIZE + self.components.len() * MetadataComponent::SIZE;
        let mut out = vec![0u8; len];
        MetadataExtension {
            extn_type: METADATA_EXTN_TYPE_IUNIT,
            len: len as u32,
            img_type: METADATA_IMAGE_TYPE_MAIN_FIRMWARE,
            rsvd: [0; 16],
        }
        .encode(&mut out);

        for (index, component) in self.components.iter().enumerate() {
            let start = MetadataExtension::SIZE + index * MetadataComponent::SIZE;
            MetadataComponent {
                id: component.id,
                size: component.payload.len() as u32,
                ver: component.version,
                ..Default::default()
            }
            .encode(&mut out[start..]);
        }
        out
    }

    /// Module data: header, nested directory, then component payloads
    pub fn build_module_data(&self) -> Vec<u8> {
        let dir_len = CpdHeader::SIZE + self.components.len() * CpdEntry::SIZE;
        let mut out = vec![0u8; ModuleDataHeader::SIZE + dir_len];
        ModuleDataHeader {
            hdr_len: ModuleDataHeader::SIZE as u32,
            fw_pkg_date: self.fw_version,
            ..Default::default()
        }
        .encode(&mut out);

        let entries: Vec<CpdEntry> = {
            let mut offset = out.len() as u32;
            self.components
                .iter()
                .map(|component| {
                    let len = component.payload.len() as u32;
                    let entry = CpdEntry::with_name("cmpnt", offset, len);
                    offset += len;
                    entry
                })
                .collect()
        };
        write_directory(&mut out[ModuleDataHeader::SIZE..], &entries);

        for component in &self.components {
            out.extend_from_slice(&component.payload);
        }
        out
    }

    /// The complete blob: manifest, metadata and module data entries
    pub fn build(&self) -> Vec<u8> {
        let metadata = self.build_metadata();
        let module_data = self.build_module_data();

        let header_len = CpdHeader::SIZE + 3 * CpdEntry::SIZE;
        let manifest_offset = header_len as u32;
        let metadata_offset = manifest_offset + self.manifest.len() as u32;
        let module_offset = metadata_offset + metadata.len() as u32;

        let mut out = vec![0u8; header_len];
        write_directory(
            &mut out,
            &[
                CpdEntry::with_name("manifest", manifest_offset, self.manifest.len() as u32),
                CpdEntry::with_name("metadata", metadata_offset, metadata.len() as u32),
                CpdEntry::with_name("moduledata", module_offset, module_data.len() as u32),
            ],
        );
        out.extend_from_slice(&self.manifest);
        out.extend_from_slice(&metadata);
        out.extend_from_slice(&module_data);
        out
    }
}

fn write_directory(out: &mut [u8], entries: &[CpdEntry]) {
    CpdHeader {
        hdr_mark: CPD_HDR_MARK,
        ent_cnt: entries.len() as u32,
        hdr_ver: 1,
        ent_ver: 1,
        hdr_len: CpdHeader::SIZE as u8,
        chksm: 0,
        name: 0,
    }
    .encode(out);
    for (index, entry) in entries.iter().enumerate() {
        entry.encode(&mut out[CpdHeader::SIZE + index * CpdEntry::SIZE..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate_top_level;

    #[test]
    fn test_built_blob_validates() {
        let blob = FirmwareBuilder::new(7)
            .manifest(vec![0xaa; 32])
            .component(1, 2, vec![1; 10])
            .component(3, 4, vec![2; 20])
            .build();

        let image = validate_top_level(&blob, 7).unwrap();
        assert_eq!(image.manifest(), &[0xaa; 32][..]);
        assert_eq!(image.metadata().component_count(), 2);
        assert_eq!(image.module_data().components().entry_count(), 2);
        assert_eq!(image.fw_version(), 7);

        let second = image.module_data().components().entry(1).unwrap();
        let start = (image.module_data_offset() + second.offset) as usize;
        assert_eq!(&blob[start..start + second.len as usize], &[2; 20][..]);
    }
}
