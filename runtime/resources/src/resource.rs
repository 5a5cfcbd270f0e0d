//! Single channel-kind allocator

use crate::bitmap::Bitmap;
use crate::{ResourceError, ResourceId, Result};

/// One draw from a [`Resource`]
///
/// Records identify the resource by kind index rather than by reference so a
/// set of them can be replayed against any pool built from the same
/// definitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceAllocationRecord {
    pub resource: ResourceId,
    pub start: u16,
    pub len: u16,
}

impl ResourceAllocationRecord {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn range(&self) -> (usize, usize) {
        (self.start as usize, self.len as usize)
    }
}

/// Bitmap allocator for the elements of one channel kind
#[derive(Debug, Clone)]
pub struct Resource {
    id: ResourceId,
    bitmap: Bitmap,
}

impl Resource {
    /// Create a resource of `elements` free elements
    ///
    /// Zero elements is valid: such a resource only accepts zero-length draws.
    pub fn new(id: ResourceId, elements: u16) -> Self {
        Self {
            id,
            bitmap: Bitmap::new(elements as usize),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Total element count
    pub fn elements(&self) -> usize {
        self.bitmap.len()
    }

    /// Elements currently drawn
    pub fn allocated(&self) -> usize {
        self.bitmap.count_set()
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Draw `count` consecutive elements, first fit
    ///
    /// A zero-length draw always succeeds and owns nothing.
    pub fn allocate(&mut self, count: usize) -> Result<ResourceAllocationRecord> {
        if count == 0 {
            return Ok(ResourceAllocationRecord {
                resource: self.id,
                start: 0,
                len: 0,
            });
        }

        let start = self
            .bitmap
            .find_zero_area(count)
            .ok_or(ResourceError::Exhausted {
                resource: self.id,
                requested: count,
            })?;
        self.bitmap.set_range(start, count);

        log::debug!("resource {}: drew {}+{}", self.id, start, count);
        Ok(ResourceAllocationRecord {
            resource: self.id,
            start: start as u16,
            len: count as u16,
        })
    }

    /// Draw exactly `start..start + count`
    ///
    /// Used for programs that pin a channel to a fixed position.
    pub fn allocate_at(&mut self, start: usize, count: usize) -> Result<ResourceAllocationRecord> {
        if count == 0 {
            return self.allocate(0);
        }

        if start.checked_add(count).map_or(true, |end| end > self.elements()) {
            return Err(ResourceError::OutOfRange {
                resource: self.id,
                start,
                len: count,
            });
        }

        if !self.bitmap.range_is_clear(start, count) {
            return Err(ResourceError::Exhausted {
                resource: self.id,
                requested: count,
            });
        }
        self.bitmap.set_range(start, count);

        log::debug!("resource {}: drew fixed {}+{}", self.id, start, count);
        Ok(ResourceAllocationRecord {
            resource: self.id,
            start: start as u16,
            len: count as u16,
        })
    }

    /// Release a draw
    ///
    /// Zero-length records are ignored. Freeing a range that was not drawn
    /// from this resource is a caller bug and is not detected.
    pub fn free(&mut self, record: &ResourceAllocationRecord) {
        if record.is_empty() {
            return;
        }
        let (start, len) = record.range();
        if self.contains(start, len) {
            self.bitmap.clear_range(start, len);
        }
    }

    /// True when the record's range is inside this resource and fully free
    pub fn is_free(&self, record: &ResourceAllocationRecord) -> bool {
        let (start, len) = record.range();
        len == 0 || self.bitmap.range_is_clear(start, len)
    }

    /// True when the record's range is inside this resource
    pub fn fits(&self, record: &ResourceAllocationRecord) -> bool {
        let (start, len) = record.range();
        len == 0 || self.contains(start, len)
    }

    /// Mark a record's range as drawn without searching
    pub(crate) fn claim(&mut self, record: &ResourceAllocationRecord) {
        if record.is_empty() {
            return;
        }
        let (start, len) = record.range();
        self.bitmap.set_range(start, len);
    }

    fn contains(&self, start: usize, len: usize) -> bool {
        start + len <= self.elements()
    }
}
