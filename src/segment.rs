//! Shared memory segments and the per-process view of where they live.
//!
//! Every process attaches to a segment at its own base address. The
//! [`SegmentRegistry`] is that process' table from segment id to local base
//! and is the only place where [`RelativePtr`]s and local addresses are
//! converted into each other.

use std::fs::{File, OpenOptions};
use std::mem::{align_of, size_of};
use std::path::Path;
use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};

use crate::relative_ptr::{RelativePtr, SegmentId, MAX_VALID_ID, MAX_VALID_OFFSET};
use crate::{Error, Result};

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct CacheLine([u8; 64]);

enum Backing {
    Heap { _lines: Vec<CacheLine> },
    Mapped { file: File, map: MmapMut },
}

pub struct Segment {
    id: SegmentId,
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the segment owns its memory. Everything placed inside it is
// either atomic or written once before being shared.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Heap backed segment, zero filled and cache-line aligned. Behaves like
    /// a mapped segment for everything except crossing a process boundary.
    pub fn heap(id: SegmentId, len: usize) -> Result<Self> {
        check_bounds(id, len)?;
        let mut lines = vec![CacheLine([0u8; 64]); len.div_ceil(64)];
        let base = NonNull::from(lines.as_mut_slice()).cast::<u8>();
        Ok(Self {
            id,
            base,
            len,
            backing: Backing::Heap { _lines: lines },
        })
    }

    /// Creates (or truncates) the file at `path` to `len` bytes and maps it
    /// shared. Every mapping of the same file gets its own base address.
    pub fn create_file(id: SegmentId, path: &Path, len: usize) -> Result<Self> {
        check_bounds(id, len)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Self::map(id, file, len)
    }

    /// Maps an existing segment file, e.g. one formatted by another process.
    pub fn open_file(id: SegmentId, path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::Corrupt("segment file larger than the address space"))?;
        check_bounds(id, len)?;
        Self::map(id, file, len)
    }

    fn map(id: SegmentId, file: File, len: usize) -> Result<Self> {
        // SAFETY: other processes may map the same file. Everything placed
        // in it is atomic or written before being published.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = NonNull::new(map.as_mut_ptr()).ok_or(Error::Corrupt("null mapping"))?;
        log::debug!("mapped segment {id}: {len} bytes at {:p}", base.as_ptr());
        Ok(Self {
            id,
            base,
            len,
            backing: Backing::Mapped { file, map },
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr - start < self.len
    }

    pub fn sync(&self) -> Result<()> {
        match &self.backing {
            Backing::Heap { .. } => Ok(()),
            Backing::Mapped { file, map } => {
                map.flush()?;
                file.sync_all()?;
                Ok(())
            }
        }
    }
}

fn check_bounds(id: SegmentId, len: usize) -> Result<()> {
    if id > MAX_VALID_ID {
        return Err(Error::InvalidConfig(format!(
            "segment id {id} exceeds {MAX_VALID_ID}"
        )));
    }
    if len == 0 {
        return Err(Error::InvalidConfig("segment length must be non-zero".into()));
    }
    if len as u64 > MAX_VALID_OFFSET {
        return Err(Error::InvalidConfig(format!(
            "segment length {len} exceeds the addressable offset range"
        )));
    }
    Ok(())
}

/// Process-local table of attached segments.
#[derive(Default)]
pub struct SegmentRegistry {
    segments: Vec<Segment>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, segment: Segment) -> Result<()> {
        if self.segment(segment.id).is_some() {
            return Err(Error::DuplicateSegment(segment.id));
        }
        log::debug!(
            "registered segment {} at {:p} ({} bytes)",
            segment.id,
            segment.base.as_ptr(),
            segment.len
        );
        self.segments.push(segment);
        Ok(())
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.id == id)
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|segment| segment.id == id)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Portable form of a local address, or `None` if the address is not
    /// inside any registered segment.
    pub fn to_relative<T>(&self, ptr: *const T) -> Option<RelativePtr> {
        let addr = ptr as usize;
        let segment = self.segments.iter().find(|segment| segment.contains(addr))?;
        let offset = (addr - segment.base.as_ptr() as usize) as u64;
        Some(RelativePtr::new(segment.id, offset))
    }

    /// Local address of `ptr`, viewed as a `T`.
    ///
    /// Returns `None` for the logical null, for unknown segment ids, and for
    /// offsets where a `T` would not fit or would be misaligned. Any bit
    /// pattern can be passed in without faulting.
    pub fn resolve<T>(&self, ptr: RelativePtr) -> Option<NonNull<T>> {
        if ptr.is_logical_null() {
            return None;
        }
        let segment = self.segment(ptr.id())?;
        let offset = usize::try_from(ptr.offset()).ok()?;
        let end = offset.checked_add(size_of::<T>())?;
        if end > segment.len {
            return None;
        }
        // SAFETY: offset + size_of::<T>() is within the segment.
        let addr = unsafe { segment.base.as_ptr().add(offset) };
        if (addr as usize) % align_of::<T>() != 0 {
            return None;
        }
        NonNull::new(addr.cast::<T>())
    }
}
