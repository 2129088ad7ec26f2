// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The mmap-backed heap: open/create, bump allocation, commit/abort, and the
//! copying collector (spec.md §4.1, §4.5).

mod gc;
pub mod header;

use crate::coding::{Decode, Encode};
use crate::error::{Error, Result};
use crate::object::{self, Kind};
use crate::word::Ref;
use header::HeapHeader;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::cell::{Ref as CellRef, RefCell};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::rc::Weak;

/// How a heap file is opened (spec.md §4.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapOpenMode {
    /// Map the file read-only. Fails if the file doesn't exist.
    Read,
    /// Map the file read-write and take the writer lock. Fails if the file
    /// doesn't exist.
    Write,
    /// Truncate (or create) the file, initialize a fresh empty heap, then
    /// behave like `Write`.
    Trunc,
}

const INITIAL_SIZE: u32 = 64 * 1024;

enum Backing {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl Backing {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::ReadOnly(m) => m,
            Self::Writable(m) => m,
        }
    }

    fn is_writable(&self) -> bool {
        matches!(self, Self::Writable(_))
    }
}

/// A callback the GC invokes on every registered transient builder: report
/// additional live roots, then patch in-memory `Old` refs once the trace is
/// done (spec.md §4.5/§9, "builder liveness during GC").
pub(crate) trait GcRoot {
    /// Every heap reference this builder currently holds, to be traced as
    /// additional strong roots before the collection proceeds.
    fn gc_roots(&self) -> Vec<Ref>;

    /// Rewrites the builder's own `Old(Ref)` pointers through the forwarding
    /// table built by the just-completed collection.
    fn gc_rewrite(&self, forward: &dyn Fn(Ref) -> Ref);
}

struct HeapInner {
    file: File,
    path: PathBuf,
    backing: Backing,
    used_bytes: u32,
    committed_used_bytes: u32,
}

/// A single-writer, mmap-backed heap of immutable typed records.
///
/// All mutable state lives behind a `RefCell`: methods take `&self` so that
/// table/dict builders (which hold a plain borrow of the heap) can keep
/// allocating across calls, and so `gc` can rewrite the heap's own backing
/// in place without invalidating those borrows (spec.md §4.5 step 6: "clients
/// that held a ref across gc must re-read it via the handle").
pub struct Heap {
    inner: RefCell<HeapInner>,
    roots: RefCell<Vec<Weak<dyn GcRoot>>>,
}

impl Heap {
    /// Opens (or creates, for `Trunc`) the heap file at `path`.
    pub fn open(path: impl AsRef<Path>, mode: HeapOpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        log::debug!("opening heap {} ({mode:?})", path.display());

        let file = match mode {
            HeapOpenMode::Read => OpenOptions::new().read(true).open(&path)?,
            HeapOpenMode::Write => OpenOptions::new().read(true).write(true).open(&path)?,
            HeapOpenMode::Trunc => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
        };

        if mode != HeapOpenMode::Read {
            use fs4::fs_std::FileExt;
            file.try_lock_exclusive()
                .map_err(|e| Error::Lock(path.clone(), e))?;
        }

        if mode == HeapOpenMode::Trunc {
            file.set_len(u64::from(INITIAL_SIZE))?;
            let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
            let bytes = HeapHeader::fresh().encode_into_vec();
            mmap[..bytes.len()].copy_from_slice(&bytes);
            mmap.flush()?;

            return Ok(Self {
                inner: RefCell::new(HeapInner {
                    file,
                    path,
                    backing: Backing::Writable(mmap),
                    used_bytes: header::HEADER_BYTES,
                    committed_used_bytes: header::HEADER_BYTES,
                }),
                roots: RefCell::new(Vec::new()),
            });
        }

        let backing = if mode == HeapOpenMode::Read {
            Backing::ReadOnly(unsafe { MmapOptions::new().map(&file)? })
        } else {
            Backing::Writable(unsafe { MmapOptions::new().map_mut(&file)? })
        };

        let header = HeapHeader::decode_from(&mut &backing.as_bytes()[..header::HEADER_BYTES as usize])?;

        Ok(Self {
            inner: RefCell::new(HeapInner {
                file,
                path,
                backing,
                used_bytes: header.used_bytes,
                committed_used_bytes: header.used_bytes,
            }),
            roots: RefCell::new(Vec::new()),
        })
    }

    /// Registers a transient builder to be traced and patched across future
    /// GCs (spec.md §4.6). The registration is weak: a dropped builder is
    /// silently skipped.
    pub(crate) fn register_root(&self, root: Weak<dyn GcRoot>) {
        self.roots.borrow_mut().push(root);
    }

    fn header(&self) -> Result<HeapHeader> {
        let inner = self.inner.borrow();
        HeapHeader::decode_from(&mut &inner.backing.as_bytes()[..header::HEADER_BYTES as usize])
    }

    /// The persistent root reference, or `Ref::NIL` if none has been set.
    pub fn get_root(&self) -> Result<Ref> {
        Ok(Ref::from_raw(self.header()?.root))
    }

    /// Updates the in-memory root. Not durable until [`Heap::commit`].
    pub fn set_root(&self, r: Ref) -> Result<()> {
        let mut inner = self.inner.borrow_mut();

        if !inner.backing.is_writable() {
            return Err(Error::Schema("set_root on a read-only heap".into()));
        }

        let used_bytes = inner.used_bytes;
        let header = HeapHeader {
            format_version: header::FORMAT_VERSION,
            used_bytes,
            root: r.raw(),
        };
        write_header(&mut inner, &header)
    }

    /// Allocates a new record with the given tag and fields.
    pub fn alloc_record(&self, tag: u8, fields: &[Ref]) -> Result<Ref> {
        let len = u32::try_from(fields.len()).expect("record field count fits in u32");
        let header_word = object::encode_header(Kind::Record, tag, len);
        let offset = self.alloc_bytes(object::object_size(header_word))?;

        let mut inner = self.inner.borrow_mut();
        write_u32(&mut inner, offset, header_word);
        for (i, f) in fields.iter().enumerate() {
            let field_offset = offset + object::HEADER_BYTES + (i as u32) * 4;
            write_u32(&mut inner, field_offset, f.raw());
        }

        Ok(Ref::from_offset(offset))
    }

    /// Allocates a new blob with the given tag and payload.
    pub fn alloc_blob(&self, tag: u8, bytes: &[u8]) -> Result<Ref> {
        let len = u32::try_from(bytes.len()).expect("blob length fits in u32");
        let header_word = object::encode_header(Kind::Blob, tag, len);
        let offset = self.alloc_bytes(object::object_size(header_word))?;

        let mut inner = self.inner.borrow_mut();
        write_u32(&mut inner, offset, header_word);
        let start = (offset + object::HEADER_BYTES) as usize;
        inner.backing_mut()[start..start + bytes.len()].copy_from_slice(bytes);

        Ok(Ref::from_offset(offset))
    }

    fn alloc_bytes(&self, size: u32) -> Result<u32> {
        loop {
            let mut inner = self.inner.borrow_mut();
            let offset = inner.used_bytes;
            let needed = offset
                .checked_add(size)
                .ok_or(Error::OutOfSpace)?;

            let capacity = inner.backing.as_bytes().len() as u32;
            if needed <= capacity {
                inner.used_bytes = needed;
                return Ok(offset);
            }

            let new_capacity = capacity.checked_mul(2).ok_or(Error::OutOfSpace)?.max(needed);
            grow(&mut inner, new_capacity)?;
        }
    }

    /// Flushes the memory map and fsyncs the file. All allocations and the
    /// current root become durable (spec.md §4.1: "root update must be the
    /// last thing flushed").
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();

        if !inner.backing.is_writable() {
            return Err(Error::Schema("commit on a read-only heap".into()));
        }

        let used_bytes = inner.used_bytes;
        let root = HeapHeader::decode_from(
            &mut &inner.backing.as_bytes()[..header::HEADER_BYTES as usize],
        )?
        .root;

        let header = HeapHeader {
            format_version: header::FORMAT_VERSION,
            used_bytes,
            root,
        };

        write_header(&mut inner, &header)?;

        if let Backing::Writable(mmap) = &inner.backing {
            mmap.flush()?;
        }
        inner.file.sync_all()?;
        inner.committed_used_bytes = used_bytes;

        log::debug!("committed heap at {} bytes", used_bytes);
        Ok(())
    }

    /// Discards uncommitted allocations, restoring `used_bytes` to the value
    /// recorded at the last commit.
    pub fn abort(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.used_bytes = inner.committed_used_bytes;
    }

    /// Runs the copying collector: copies the live closure from the current
    /// root (plus every registered builder's live refs) into a fresh file,
    /// rebuilds registered weak structures, and atomically swaps the new
    /// file into place (spec.md §4.5).
    pub fn gc(&self) -> Result<()> {
        gc::collect(self)
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.inner.borrow().backing.as_bytes())
    }

    /// The object's tag (0..127). See [`crate::object::tag`].
    ///
    /// # Panics
    ///
    /// Panics if `r` is nil or an immediate.
    #[must_use]
    pub fn tag(&self, r: Ref) -> u8 {
        self.with_bytes(|b| object::tag(b, r))
    }

    /// The object's length: fields for a record, bytes for a blob. See
    /// [`crate::object::len`].
    ///
    /// # Panics
    ///
    /// Panics if `r` is nil or an immediate.
    #[must_use]
    pub fn len(&self, r: Ref) -> u32 {
        self.with_bytes(|b| object::len(b, r))
    }

    /// The `i`-th field of a record. See [`crate::object::field`].
    ///
    /// # Panics
    ///
    /// Panics if `r` is not a record, or `i` is out of range.
    #[must_use]
    pub fn field(&self, r: Ref, i: u32) -> Ref {
        self.with_bytes(|b| object::field(b, r, i))
    }

    /// Whether `r` is a blob.
    #[must_use]
    pub fn is_blob(&self, r: Ref) -> bool {
        self.with_bytes(|b| object::is_blob(b, r))
    }

    /// Whether `r` is a record.
    #[must_use]
    pub fn is_record(&self, r: Ref) -> bool {
        self.with_bytes(|b| object::is_record(b, r))
    }

    /// A copy of a blob's payload. See [`crate::object::blob_bytes`].
    ///
    /// # Panics
    ///
    /// Panics if `r` is not a blob.
    #[must_use]
    pub fn blob_bytes(&self, r: Ref) -> Vec<u8> {
        self.with_bytes(|b| object::blob_bytes(b, r).to_vec())
    }

    /// The path this heap was opened from.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.inner.borrow().path.clone()
    }

    /// Total bytes currently in use (including uncommitted allocations).
    #[must_use]
    pub fn used_bytes(&self) -> u32 {
        self.inner.borrow().used_bytes
    }

    /// Snapshot of every builder registered via [`Heap::register_root`].
    pub(crate) fn registered_roots(&self) -> Vec<Weak<dyn GcRoot>> {
        self.roots.borrow().clone()
    }

    /// Overwrites a single field of an already-allocated record.
    ///
    /// Only sound while the record has not yet been exposed past the current
    /// heap (i.e. before `commit`): [`crate::heap::gc`] uses this to fill in
    /// fields whose value depends on the rest of the trace.
    pub(crate) fn patch_field(&self, r: Ref, i: u32, value: Ref) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let field_offset = r.offset() + object::HEADER_BYTES + i * 4;
        write_u32(&mut inner, field_offset, value.raw());
        Ok(())
    }

    /// Replaces this heap's backing file and mapping with `other`'s, renaming
    /// `other`'s file over this heap's path first. Used by `gc` to swap the
    /// compacted heap into place while existing `&Heap` borrows stay valid.
    pub(crate) fn adopt(&self, other: Heap) -> Result<()> {
        let other_path = other.path();
        let final_path = self.path();
        crate::fs::rename_into_place(&other_path, &final_path)?;

        let mut other_inner = other.inner.into_inner();
        other_inner.path = final_path;
        *self.inner.borrow_mut() = other_inner;

        Ok(())
    }
}

fn write_u32(inner: &mut HeapInner, offset: u32, value: u32) {
    let offset = offset as usize;
    inner.backing_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_header(inner: &mut HeapInner, header: &HeapHeader) -> Result<()> {
    let bytes = header.encode_into_vec();
    let slice = inner.backing_mut();
    slice[..bytes.len()].copy_from_slice(&bytes);
    Ok(())
}

fn grow(inner: &mut HeapInner, new_capacity: u32) -> Result<()> {
    log::trace!("growing heap {} to {new_capacity} bytes", inner.path.display());
    inner.file.set_len(u64::from(new_capacity))?;
    inner.backing = Backing::Writable(unsafe { MmapOptions::new().map_mut(&inner.file)? });
    Ok(())
}

impl HeapInner {
    fn backing_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Writable(m) => m,
            Backing::ReadOnly(_) => panic!("mutation of a read-only heap"),
        }
    }
}

/// Borrows the heap's byte arena directly, for callers (the `hamt`/`gc`
/// modules) that want to avoid repeated borrow/copy overhead across a single
/// read-only pass.
pub(crate) fn arena(heap: &Heap) -> CellRef<'_, [u8]> {
    CellRef::map(heap.inner.borrow(), |inner| inner.backing.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn fresh_heap_has_nil_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("heap.dpm");

        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;
        assert!(heap.get_root()?.is_nil());

        Ok(())
    }

    #[test]
    fn alloc_blob_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("heap.dpm");

        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;
        let r = heap.alloc_blob(0, b"foo")?;
        assert_eq!(heap.blob_bytes(r), b"foo");

        Ok(())
    }

    #[test]
    fn commit_and_reopen_preserves_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("heap.dpm");

        {
            let heap = Heap::open(&path, HeapOpenMode::Trunc)?;
            let r = heap.alloc_blob(0, b"foo")?;
            heap.set_root(r)?;
            heap.commit()?;
        }

        let heap = Heap::open(&path, HeapOpenMode::Read)?;
        let root = heap.get_root()?;
        assert_eq!(heap.blob_bytes(root), b"foo");

        Ok(())
    }

    #[test]
    fn write_lock_excludes_second_writer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("heap.dpm");

        let _first = Heap::open(&path, HeapOpenMode::Trunc)?;
        let second = Heap::open(&path, HeapOpenMode::Write);
        assert!(matches!(second, Err(Error::Lock(_, _))));

        Ok(())
    }

    #[test]
    fn abort_discards_uncommitted_allocations() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("heap.dpm");

        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;
        heap.commit()?;
        let before = heap.used_bytes();

        heap.alloc_blob(0, b"scratch")?;
        assert!(heap.used_bytes() > before);

        heap.abort();
        assert_eq!(heap.used_bytes(), before);

        Ok(())
    }

    #[test]
    fn growth_preserves_existing_objects() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("heap.dpm");

        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;
        let mut refs = Vec::new();
        for i in 0..10_000u32 {
            refs.push(heap.alloc_blob(0, &i.to_le_bytes())?);
        }

        for (i, r) in refs.iter().enumerate() {
            assert_eq!(heap.blob_bytes(*r), (i as u32).to_le_bytes());
        }

        Ok(())
    }
}
