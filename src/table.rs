// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Content-addressed interning table: a set of blobs keyed by their own
//! bytes, persisted as a HAMT whose leaves are blob refs (spec.md §4.3).

use crate::hamt::{self, BuilderState, LeafRoots, Node, Shape};
use crate::hash::blob_hash32;
use crate::heap::Heap;
use crate::word::Ref;
use crate::Result;
use std::cell::RefCell;
use std::rc::Rc;

const SHAPE: Shape = Shape {
    branch_tag: hamt::tag::TABLE_BRANCH,
    collision_tag: hamt::tag::TABLE_COLLISION,
};

/// A HAMT leaf for the interning table: either an already-allocated blob
/// (`Stored`, the on-disk leaf shape — the blob itself, no wrapper record),
/// or a not-yet-allocated byte string used only to probe for an existing
/// entry (`Probe`, so `intern_soft` can look a key up without allocating).
#[derive(Clone)]
enum BlobLeaf {
    Stored(Ref),
    Probe(Vec<u8>),
}

impl BlobLeaf {
    fn bytes(&self, heap: &Heap) -> Vec<u8> {
        match self {
            Self::Stored(r) => heap.blob_bytes(*r),
            Self::Probe(b) => b.clone(),
        }
    }
}

impl hamt::Leaf for BlobLeaf {
    fn hash(&self, heap: &Heap) -> u32 {
        blob_hash32(&self.bytes(heap))
    }

    fn same_slot(&self, heap: &Heap, other: &Self) -> bool {
        self.bytes(heap) == other.bytes(heap)
    }

    fn alloc(&self, heap: &Heap) -> Result<Ref> {
        match self {
            Self::Stored(r) => Ok(*r),
            Self::Probe(b) => heap.alloc_blob(0, b),
        }
    }

    fn from_ref(_heap: &Heap, r: Ref) -> Self {
        Self::Stored(r)
    }
}

impl LeafRoots for BlobLeaf {
    fn embedded_refs(&self, out: &mut Vec<Ref>) {
        if let Self::Stored(r) = self {
            out.push(*r);
        }
    }

    fn rewrite_refs(&mut self, forward: &dyn Fn(Ref) -> Ref) {
        if let Self::Stored(r) = self {
            *r = forward(*r);
        }
    }
}

type Inner<'h> = BuilderState<'h, BlobLeaf>;

/// Transient builder for the interning table (spec.md §4.3).
///
/// Registers itself as a GC root for as long as it's alive: any blob it has
/// interned but not yet `finish`ed must survive a concurrent collection.
pub struct Table<'h> {
    inner: Rc<RefCell<Inner<'h>>>,
}

impl<'h> Table<'h> {
    /// Initializes a builder from a prior `finish`ed root, or from
    /// `Ref::NIL` for a fresh, empty table.
    #[must_use]
    pub fn init(heap: &'h Heap, root: Ref) -> Self {
        let inner = Rc::new(RefCell::new(BuilderState {
            heap,
            overlay: Node::from_root(root),
        }));

        hamt::register_builder(heap, &inner);

        Self { inner }
    }

    fn heap(&self) -> &'h Heap {
        self.inner.borrow().heap
    }

    /// Interns `bytes`, allocating a new blob only if no equal-content blob
    /// already exists in the table.
    pub fn intern(&self, bytes: &[u8]) -> Result<Ref> {
        if let Some(existing) = self.intern_soft(bytes) {
            return Ok(existing);
        }

        let heap = self.heap();
        let blob = heap.alloc_blob(0, bytes)?;
        let hash = blob_hash32(bytes);

        let mut inner = self.inner.borrow_mut();
        let overlay = std::mem::replace(&mut inner.overlay, Node::Empty);
        inner.overlay = hamt::insert(overlay, heap, &SHAPE, 0, hash, BlobLeaf::Stored(blob));

        Ok(blob)
    }

    /// Looks up `bytes` without allocating; `None` if not already interned.
    #[must_use]
    pub fn intern_soft(&self, bytes: &[u8]) -> Option<Ref> {
        let inner = self.inner.borrow();
        let heap = inner.heap;
        let hash = blob_hash32(bytes);
        let probe = BlobLeaf::Probe(bytes.to_vec());

        match hamt::get(&inner.overlay, heap, &SHAPE, 0, hash, &probe)? {
            BlobLeaf::Stored(r) => Some(r),
            BlobLeaf::Probe(_) => unreachable!("stored leaves are always BlobLeaf::Stored"),
        }
    }

    /// All interned blob refs, in deterministic (trie) order.
    #[must_use]
    pub fn iter_entries(&self) -> Vec<Ref> {
        let inner = self.inner.borrow();
        let mut out = Vec::new();
        hamt::iter_leaves(&inner.overlay, inner.heap, &SHAPE, &mut out);
        out.into_iter()
            .map(|l| match l {
                BlobLeaf::Stored(r) => r,
                BlobLeaf::Probe(_) => unreachable!("stored leaves are always BlobLeaf::Stored"),
            })
            .collect()
    }

    /// Serializes the overlay into the heap and returns the new persistent
    /// root (unchanged from the input root if nothing was interned).
    pub fn finish(self) -> Result<Ref> {
        let inner = Rc::try_unwrap(self.inner)
            .unwrap_or_else(|_| panic!("Table::finish called while another handle is alive"))
            .into_inner();
        hamt::finish(inner.overlay, inner.heap, &SHAPE)
    }

    /// Discards the builder without persisting anything.
    pub fn abort(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapOpenMode;
    use test_log::test;

    #[test]
    fn intern_uniqueness() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let heap = Heap::open(dir.path().join("h.dpm"), HeapOpenMode::Trunc)?;

        let table = Table::init(&heap, Ref::NIL);
        let a = table.intern(b"hello")?;
        let b = table.intern(b"hello")?;
        let c = table.intern(b"world")?;

        assert_eq!(a, b);
        assert_ne!(a, c);

        Ok(())
    }

    #[test]
    fn intern_soft_never_allocates() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let heap = Heap::open(dir.path().join("h.dpm"), HeapOpenMode::Trunc)?;

        let table = Table::init(&heap, Ref::NIL);
        assert_eq!(table.intern_soft(b"nope"), None);
        let before = heap.used_bytes();
        assert_eq!(table.intern_soft(b"nope"), None);
        assert_eq!(heap.used_bytes(), before);

        Ok(())
    }

    #[test]
    fn finish_and_reopen_round_trips() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("h.dpm");
        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;

        let words: Vec<String> = (0..200).map(|i| format!("word-{i}")).collect();
        let mut refs = Vec::new();

        {
            let table = Table::init(&heap, Ref::NIL);
            for w in &words {
                refs.push(table.intern(w.as_bytes())?);
            }
            let root = table.finish()?;
            heap.set_root(root)?;
            heap.commit()?;
        }

        let table = Table::init(&heap, heap.get_root()?);
        for (w, r) in words.iter().zip(refs.iter()) {
            assert_eq!(table.intern_soft(w.as_bytes()), Some(*r));
        }

        let entries = table.iter_entries();
        assert_eq!(entries.len(), words.len());

        Ok(())
    }

    #[test]
    fn intern_survives_across_many_collisions_at_depth() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let heap = Heap::open(dir.path().join("h.dpm"), HeapOpenMode::Trunc)?;

        let table = Table::init(&heap, Ref::NIL);
        let words: Vec<String> = (0..2000).map(|i| format!("tok{i}")).collect();
        for w in &words {
            table.intern(w.as_bytes())?;
        }

        // Mix of untouched (Old, after a reopen) and freshly-inserted
        // overlay leaves at varying depths must all still resolve.
        let root = table.finish()?;
        heap.set_root(root)?;
        heap.commit()?;

        let table = Table::init(&heap, heap.get_root()?);
        for w in &words {
            assert!(table.intern_soft(w.as_bytes()).is_some());
        }
        table.intern(b"one-more")?;
        for w in &words {
            assert!(table.intern_soft(w.as_bytes()).is_some());
        }

        Ok(())
    }

    #[test]
    fn entries_pruned_without_another_root() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("h.dpm");
        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;

        let words: Vec<String> = (0..300).map(|i| format!("tok-{i}")).collect();

        {
            let table = Table::init(&heap, Ref::NIL);
            for w in &words {
                table.intern(w.as_bytes())?;
            }
            let root = table.finish()?;
            heap.set_root(root)?;
            heap.commit()?;
        }

        heap.gc()?;

        // Nothing outside the table itself keeps any interned blob
        // reachable, so the whole trie collapses to nil (spec.md §9 S3).
        let root = heap.get_root()?;
        assert!(root.is_nil());

        Ok(())
    }

    #[test]
    fn entries_survive_when_independently_referenced() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("h.dpm");
        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;

        let words: Vec<String> = (0..300).map(|i| format!("tok-{i}")).collect();
        let pinned_word = "tok-7";

        {
            let table = Table::init(&heap, Ref::NIL);
            let mut pinned = None;
            for w in &words {
                let r = table.intern(w.as_bytes())?;
                if w == pinned_word {
                    pinned = Some(r);
                }
            }
            let table_root = table.finish()?;
            let root = heap.alloc_record(0, &[table_root, pinned.expect("word present")])?;
            heap.set_root(root)?;
            heap.commit()?;
        }

        heap.gc()?;

        let root = heap.get_root()?;
        let table = Table::init(&heap, heap.field(root, 0));

        // The root holds a second, direct reference to the pinned word's
        // blob, so it survives even though the table itself is the only
        // thing keeping every other entry alive.
        assert!(table.intern_soft(pinned_word.as_bytes()).is_some());
        for w in &words {
            if w != pinned_word {
                assert!(table.intern_soft(w.as_bytes()).is_none());
            }
        }

        Ok(())
    }

    #[test]
    fn random_byte_strings_round_trip() -> crate::Result<()> {
        use rand::{rng, Rng};

        let dir = tempfile::tempdir()?;
        let heap = Heap::open(dir.path().join("h.dpm"), HeapOpenMode::Trunc)?;
        let table = Table::init(&heap, Ref::NIL);

        let mut rng = rng();
        let mut blobs: Vec<Vec<u8>> = Vec::new();
        for _ in 0..500 {
            let len = rng.random_range(0..64);
            blobs.push((0..len).map(|_| rng.random::<u8>()).collect());
        }

        let refs: Vec<Ref> = blobs.iter().map(|b| table.intern(b)).collect::<Result<_>>()?;
        for (blob, r) in blobs.iter().zip(refs.iter()) {
            assert_eq!(table.intern_soft(blob), Some(*r));
        }

        // Interning the same bytes again, in a different order, must not
        // grow the table.
        let before = heap.used_bytes();
        for blob in blobs.iter().rev() {
            table.intern(blob)?;
        }
        assert_eq!(heap.used_bytes(), before);

        Ok(())
    }
}
