// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Persistent dictionary: a map from a heap reference to a heap reference
//! (`STRONG`, `WEAK_KEYS`) or to a set of heap references (`WEAK_SETS`),
//! persisted as a HAMT atop the shared [`crate::hamt`] machinery
//! (spec.md §4.4).
//!
//! All three flavors share one builder type, [`Dict`], the way the original
//! `ss_dict` does: the flavor is fixed at [`Dict::init`] and determines
//! which tags the trie nodes use (so [`crate::heap::gc`] can recognize
//! `WEAK_KEYS`/`WEAK_SETS` shapes and prune them) and which of `set`/`add`
//! is the valid mutator. Calling `set` on a `WEAK_SETS` dict, or `add` on a
//! `STRONG`/`WEAK_KEYS` one, is a program error (spec.md §9: "mixing them on
//! the same dict is undefined").

use crate::hamt::{self, BuilderState, LeafRoots, Node, Shape};
use crate::hash::key_hash32;
use crate::heap::Heap;
use crate::object::equal_shallow;
use crate::word::Ref;
use crate::Result;
use std::cell::RefCell;
use std::rc::Rc;

/// Which liveness policy a dict's entries follow (spec.md §4.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DictKind {
    /// Keys and values are strong references; entries survive GC unless
    /// explicitly deleted.
    Strong,
    /// Like `Strong`, but an entry is dropped during GC if its key is not
    /// otherwise reachable (spec.md §8 property 8).
    WeakKeys,
    /// Values are sets of references; individual members are dropped during
    /// GC if not otherwise reachable, and an entry whose set empties out is
    /// dropped entirely (spec.md §8 property 9).
    WeakSets,
}

fn shape_for(kind: DictKind) -> Shape {
    match kind {
        DictKind::Strong => Shape {
            branch_tag: hamt::tag::STRONG_DICT_BRANCH,
            collision_tag: hamt::tag::STRONG_DICT_COLLISION,
        },
        DictKind::WeakKeys => Shape {
            branch_tag: hamt::tag::WEAK_KEYS_BRANCH,
            collision_tag: hamt::tag::WEAK_KEYS_COLLISION,
        },
        DictKind::WeakSets => Shape {
            branch_tag: hamt::tag::WEAK_SETS_BRANCH,
            collision_tag: hamt::tag::WEAK_SETS_COLLISION,
        },
    }
}

fn leaf_tag_for(kind: DictKind) -> u8 {
    match kind {
        DictKind::Strong => hamt::tag::STRONG_DICT_LEAF,
        DictKind::WeakKeys => hamt::tag::WEAK_KEYS_LEAF,
        DictKind::WeakSets => unreachable!("WEAK_SETS uses SetLeaf, not PairLeaf"),
    }
}

/// A key/value leaf shared by `Strong` and `WeakKeys` dicts. They differ
/// only in what [`crate::heap::gc`] does with an entry whose key turns out
/// unreachable, not in on-disk layout or builder behavior.
#[derive(Clone)]
struct PairLeaf {
    tag: u8,
    key: Ref,
    value: Ref,
}

impl hamt::Leaf for PairLeaf {
    fn hash(&self, heap: &Heap) -> u32 {
        key_hash32(heap, self.key)
    }

    fn same_slot(&self, _heap: &Heap, other: &Self) -> bool {
        equal_shallow(self.key, other.key)
    }

    fn alloc(&self, heap: &Heap) -> Result<Ref> {
        heap.alloc_record(self.tag, &[self.key, self.value])
    }

    fn from_ref(heap: &Heap, r: Ref) -> Self {
        Self {
            tag: heap.tag(r),
            key: heap.field(r, 0),
            value: heap.field(r, 1),
        }
    }
}

impl LeafRoots for PairLeaf {
    fn embedded_refs(&self, out: &mut Vec<Ref>) {
        out.push(self.key);
        out.push(self.value);
    }

    fn rewrite_refs(&mut self, forward: &dyn Fn(Ref) -> Ref) {
        self.key = forward(self.key);
        self.value = forward(self.value);
    }
}

/// A key/member-set leaf for `WeakSets` dicts. The member set is expanded
/// into a plain `Vec<Ref>` in RAM; `alloc` re-serializes it as a
/// `WEAK_SETS_MEMBER_SET` record every time the leaf is written, so a
/// builder session never needs to mutate an already-allocated set in place.
#[derive(Clone)]
struct SetLeaf {
    key: Ref,
    members: Vec<Ref>,
}

impl hamt::Leaf for SetLeaf {
    fn hash(&self, heap: &Heap) -> u32 {
        key_hash32(heap, self.key)
    }

    fn same_slot(&self, _heap: &Heap, other: &Self) -> bool {
        equal_shallow(self.key, other.key)
    }

    fn alloc(&self, heap: &Heap) -> Result<Ref> {
        let set_ref = heap.alloc_record(hamt::tag::WEAK_SETS_MEMBER_SET, &self.members)?;
        heap.alloc_record(hamt::tag::WEAK_SETS_LEAF, &[self.key, set_ref])
    }

    fn from_ref(heap: &Heap, r: Ref) -> Self {
        let key = heap.field(r, 0);
        let set_ref = heap.field(r, 1);
        let members = (0..heap.len(set_ref)).map(|i| heap.field(set_ref, i)).collect();
        Self { key, members }
    }
}

impl LeafRoots for SetLeaf {
    fn embedded_refs(&self, out: &mut Vec<Ref>) {
        out.push(self.key);
        out.extend_from_slice(&self.members);
    }

    fn rewrite_refs(&mut self, forward: &dyn Fn(Ref) -> Ref) {
        self.key = forward(self.key);
        for m in &mut self.members {
            *m = forward(*m);
        }
    }
}

enum Inner<'h> {
    Pair {
        tag: u8,
        shape: Shape,
        state: Rc<RefCell<BuilderState<'h, PairLeaf>>>,
    },
    Set {
        shape: Shape,
        state: Rc<RefCell<BuilderState<'h, SetLeaf>>>,
    },
}

/// Transient builder for a persistent dictionary (spec.md §4.4).
///
/// Registers itself as a GC root for as long as it's alive, the same way
/// [`crate::table::Table`] does: entries staged but not yet `finish`ed must
/// survive a concurrent collection.
pub struct Dict<'h> {
    kind: DictKind,
    inner: Inner<'h>,
}

impl<'h> Dict<'h> {
    /// Initializes a builder from a prior `finish`ed root, or from
    /// `Ref::NIL` for a fresh, empty dict, fixing its flavor.
    #[must_use]
    pub fn init(heap: &'h Heap, root: Ref, kind: DictKind) -> Self {
        let shape = shape_for(kind);

        let inner = match kind {
            DictKind::Strong | DictKind::WeakKeys => {
                let state = Rc::new(RefCell::new(BuilderState {
                    heap,
                    overlay: Node::from_root(root),
                }));
                hamt::register_builder(heap, &state);
                Inner::Pair {
                    tag: leaf_tag_for(kind),
                    shape,
                    state,
                }
            }
            DictKind::WeakSets => {
                let state = Rc::new(RefCell::new(BuilderState {
                    heap,
                    overlay: Node::from_root(root),
                }));
                hamt::register_builder(heap, &state);
                Inner::Set { shape, state }
            }
        };

        Self { kind, inner }
    }

    /// The flavor this builder was initialized with.
    #[must_use]
    pub fn kind(&self) -> DictKind {
        self.kind
    }

    /// Sets `key`'s value, overwriting any existing entry.
    ///
    /// # Panics
    ///
    /// Panics if called on a `WEAK_SETS` dict (use [`Dict::add`] instead).
    pub fn set(&self, key: Ref, value: Ref) -> Result<()> {
        match &self.inner {
            Inner::Pair { tag, shape, state } => {
                let mut inner = state.borrow_mut();
                let heap = inner.heap;
                let hash = key_hash32(heap, key);
                let overlay = std::mem::replace(&mut inner.overlay, Node::Empty);
                inner.overlay = hamt::insert(
                    overlay,
                    heap,
                    shape,
                    0,
                    hash,
                    PairLeaf {
                        tag: *tag,
                        key,
                        value,
                    },
                );
                Ok(())
            }
            Inner::Set { .. } => panic!("Dict::set on a WEAK_SETS dict; use Dict::add"),
        }
    }

    /// Adds `member` to the set stored at `key`, creating the entry if
    /// absent. Idempotent: adding the same member twice is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if called on a `STRONG`/`WEAK_KEYS` dict (use [`Dict::set`]).
    pub fn add(&self, key: Ref, member: Ref) -> Result<()> {
        match &self.inner {
            Inner::Set { shape, state } => {
                let mut inner = state.borrow_mut();
                let heap = inner.heap;
                let hash = key_hash32(heap, key);
                let overlay = std::mem::replace(&mut inner.overlay, Node::Empty);

                let probe = SetLeaf {
                    key,
                    members: Vec::new(),
                };
                let mut members = hamt::get(&overlay, heap, shape, 0, hash, &probe)
                    .map(|l| l.members)
                    .unwrap_or_default();

                if !members.iter().any(|m| equal_shallow(*m, member)) {
                    members.push(member);
                }

                inner.overlay = hamt::insert(overlay, heap, shape, 0, hash, SetLeaf { key, members });
                Ok(())
            }
            Inner::Pair { .. } => panic!("Dict::add on a non-WEAK_SETS dict; use Dict::set"),
        }
    }

    /// Returns `key`'s value (`STRONG`/`WEAK_KEYS`) or its member set as a
    /// freshly allocated record (`WEAK_SETS`), or `Ref::NIL` if absent.
    #[must_use]
    pub fn get(&self, key: Ref) -> Result<Ref> {
        match &self.inner {
            Inner::Pair { shape, state, .. } => {
                let inner = state.borrow();
                let heap = inner.heap;
                let hash = key_hash32(heap, key);
                let probe = PairLeaf {
                    tag: 0,
                    key,
                    value: Ref::NIL,
                };
                Ok(hamt::get(&inner.overlay, heap, shape, 0, hash, &probe)
                    .map(|l| l.value)
                    .unwrap_or(Ref::NIL))
            }
            Inner::Set { shape, state } => {
                let inner = state.borrow();
                let heap = inner.heap;
                let hash = key_hash32(heap, key);
                let probe = SetLeaf {
                    key,
                    members: Vec::new(),
                };
                match hamt::get(&inner.overlay, heap, shape, 0, hash, &probe) {
                    Some(l) if !l.members.is_empty() => {
                        heap.alloc_record(hamt::tag::WEAK_SETS_MEMBER_SET, &l.members)
                    }
                    _ => Ok(Ref::NIL),
                }
            }
        }
    }

    /// Removes `key`'s entry; a no-op if absent.
    ///
    /// # Panics
    ///
    /// Panics if called on a `WEAK_SETS` dict.
    pub fn del(&self, key: Ref) -> Result<()> {
        match &self.inner {
            Inner::Pair { shape, state, .. } => {
                let mut inner = state.borrow_mut();
                let heap = inner.heap;
                let hash = key_hash32(heap, key);
                let probe = PairLeaf {
                    tag: 0,
                    key,
                    value: Ref::NIL,
                };
                let overlay = std::mem::replace(&mut inner.overlay, Node::Empty);
                inner.overlay = hamt::remove(overlay, heap, shape, 0, hash, &probe);
                Ok(())
            }
            Inner::Set { .. } => panic!("Dict::del on a WEAK_SETS dict"),
        }
    }

    /// All (key, value) pairs. For `WEAK_SETS`, `value` is a freshly
    /// allocated record holding that key's full member set.
    pub fn iter_entries(&self) -> Result<Vec<(Ref, Ref)>> {
        match &self.inner {
            Inner::Pair { shape, state, .. } => {
                let inner = state.borrow();
                let mut leaves = Vec::new();
                hamt::iter_leaves(&inner.overlay, inner.heap, shape, &mut leaves);
                Ok(leaves.into_iter().map(|l| (l.key, l.value)).collect())
            }
            Inner::Set { shape, state } => {
                let inner = state.borrow();
                let heap = inner.heap;
                let mut leaves = Vec::new();
                hamt::iter_leaves(&inner.overlay, heap, shape, &mut leaves);
                leaves
                    .into_iter()
                    .map(|l| {
                        let set_ref = heap.alloc_record(hamt::tag::WEAK_SETS_MEMBER_SET, &l.members)?;
                        Ok((l.key, set_ref))
                    })
                    .collect()
            }
        }
    }

    /// All (key, member) pairs, expanding each `WEAK_SETS` set into one pair
    /// per member. For `STRONG`/`WEAK_KEYS`, identical to
    /// [`Dict::iter_entries`] (each entry has exactly one member, its
    /// value).
    pub fn iter_entry_members(&self) -> Vec<(Ref, Ref)> {
        match &self.inner {
            Inner::Pair { shape, state, .. } => {
                let inner = state.borrow();
                let mut leaves = Vec::new();
                hamt::iter_leaves(&inner.overlay, inner.heap, shape, &mut leaves);
                leaves.into_iter().map(|l| (l.key, l.value)).collect()
            }
            Inner::Set { shape, state } => {
                let inner = state.borrow();
                let mut leaves = Vec::new();
                hamt::iter_leaves(&inner.overlay, inner.heap, shape, &mut leaves);
                leaves
                    .into_iter()
                    .flat_map(|l| l.members.into_iter().map(move |m| (l.key, m)))
                    .collect()
            }
        }
    }

    /// Serializes the overlay into the heap and returns the new persistent
    /// root (unchanged from the input root if nothing was mutated).
    pub fn finish(self) -> Result<Ref> {
        match self.inner {
            Inner::Pair { shape, state, .. } => {
                let inner = Rc::try_unwrap(state)
                    .unwrap_or_else(|_| panic!("Dict::finish called while another handle is alive"))
                    .into_inner();
                hamt::finish(inner.overlay, inner.heap, &shape)
            }
            Inner::Set { shape, state } => {
                let inner = Rc::try_unwrap(state)
                    .unwrap_or_else(|_| panic!("Dict::finish called while another handle is alive"))
                    .into_inner();
                hamt::finish(inner.overlay, inner.heap, &shape)
            }
        }
    }

    /// Discards the builder without persisting anything.
    pub fn abort(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapOpenMode;
    use crate::table::Table;
    use test_log::test;

    #[test]
    fn dict_laws() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let heap = Heap::open(dir.path().join("h.dpm"), HeapOpenMode::Trunc)?;
        let table = Table::init(&heap, Ref::NIL);

        let k = table.intern(b"origin")?;
        let v1 = table.intern(b"debian")?;
        let v2 = table.intern(b"ubuntu")?;

        let dict = Dict::init(&heap, Ref::NIL, DictKind::Strong);
        dict.set(k, v1)?;
        assert_eq!(dict.get(k)?, v1);

        dict.set(k, v2)?;
        assert_eq!(dict.get(k)?, v2);

        dict.del(k)?;
        assert!(dict.get(k)?.is_nil());

        Ok(())
    }

    #[test]
    fn del_missing_key_is_a_no_op() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let heap = Heap::open(dir.path().join("h.dpm"), HeapOpenMode::Trunc)?;
        let dict = Dict::init(&heap, Ref::NIL, DictKind::Strong);
        dict.del(Ref::from_int(42))?;
        assert!(dict.get(Ref::from_int(42))?.is_nil());
        Ok(())
    }

    #[test]
    fn strong_dict_survives_gc() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("h.dpm");
        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;

        let words: Vec<String> = (0..500).map(|i| format!("pkg-{i}")).collect();

        {
            let table = Table::init(&heap, Ref::NIL);
            let dict = Dict::init(&heap, Ref::NIL, DictKind::Strong);

            for (i, w) in words.iter().enumerate() {
                let key = table.intern(w.as_bytes())?;
                #[allow(clippy::cast_possible_wrap)]
                dict.set(key, Ref::from_int(i as i32))?;
            }

            let root = heap.alloc_record(0, &[table.finish()?, dict.finish()?])?;
            heap.set_root(root)?;
            heap.commit()?;
        }

        heap.gc()?;

        let root = heap.get_root()?;
        let table = Table::init(&heap, heap.field(root, 0));
        let dict = Dict::init(&heap, heap.field(root, 1), DictKind::Strong);

        for (i, w) in words.iter().enumerate() {
            let key = table.intern_soft(w.as_bytes()).expect("word still interned");
            #[allow(clippy::cast_possible_wrap)]
            let expected = Ref::from_int(i as i32);
            assert_eq!(dict.get(key)?, expected);
        }

        Ok(())
    }

    #[test]
    fn weak_keys_dict_drops_unreachable_keys() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("h.dpm");
        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;

        let words: Vec<String> = (0..300).map(|i| format!("word-{i}")).collect();

        {
            let table = Table::init(&heap, Ref::NIL);
            let dict = Dict::init(&heap, Ref::NIL, DictKind::WeakKeys);

            for (i, w) in words.iter().enumerate() {
                let key = table.intern(w.as_bytes())?;
                #[allow(clippy::cast_possible_wrap)]
                dict.set(key, Ref::from_int(i as i32))?;
            }

            // Table is rooted (keeping the blobs reachable), but the dict is
            // *not* rooted through anything that keeps those same blobs
            // reachable a second, independent way; it's the only root.
            let root = dict.finish()?;
            heap.set_root(root)?;
            heap.commit()?;
        }

        heap.gc()?;

        // A WEAK_KEYS dict's own keys are not a strong path to themselves:
        // with nothing else holding them live, every entry is pruned.
        let root = heap.get_root()?;
        assert!(root.is_nil());

        Ok(())
    }

    #[test]
    fn weak_keys_dict_keeps_pinned_entries() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("h.dpm");
        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;

        let words: Vec<String> = (0..300).map(|i| format!("word-{i}")).collect();
        const PINNED: usize = 20;

        {
            let table = Table::init(&heap, Ref::NIL);
            let dict = Dict::init(&heap, Ref::NIL, DictKind::WeakKeys);
            let mut pins = Vec::new();

            for (i, w) in words.iter().enumerate() {
                let key = table.intern(w.as_bytes())?;
                #[allow(clippy::cast_possible_wrap)]
                dict.set(key, Ref::from_int(i as i32))?;
                if i < PINNED {
                    pins.push(key);
                }
            }

            let pin_vec = heap.alloc_record(0, &pins)?;
            let root = heap.alloc_record(0, &[dict.finish()?, pin_vec])?;
            heap.set_root(root)?;
            heap.commit()?;
        }

        heap.gc()?;

        let root = heap.get_root()?;
        let dict = Dict::init(&heap, heap.field(root, 0), DictKind::WeakKeys);
        let pin_vec = heap.field(root, 1);

        assert_eq!(heap.len(pin_vec), PINNED as u32);

        for i in 0..PINNED {
            let key = heap.field(pin_vec, i as u32);
            #[allow(clippy::cast_possible_wrap)]
            let expected = Ref::from_int(i as i32);
            assert_eq!(dict.get(key)?, expected);
        }

        Ok(())
    }

    /// Adjacency pairs of contiguous US states (two-letter postal codes),
    /// mirroring the original implementation's `contiguous_usa` test fixture
    /// (spec.md §8, scenario S6).
    const CONTIGUOUS_USA_BORDERS: &[(&str, &str)] = &[
        ("AL", "FL"),
        ("AL", "GA"),
        ("AL", "MS"),
        ("AL", "TN"),
        ("AR", "LA"),
        ("AR", "MS"),
        ("AR", "MO"),
        ("AR", "OK"),
        ("AR", "TN"),
        ("AR", "TX"),
        ("AZ", "CA"),
        ("AZ", "NV"),
        ("AZ", "NM"),
        ("AZ", "UT"),
        ("CA", "NV"),
        ("CA", "OR"),
        ("CO", "KS"),
        ("CO", "NE"),
        ("CO", "NM"),
        ("CO", "OK"),
        ("CO", "UT"),
        ("CO", "WY"),
        ("CT", "MA"),
        ("CT", "NY"),
        ("CT", "RI"),
        ("DE", "MD"),
        ("DE", "NJ"),
        ("DE", "PA"),
        ("FL", "GA"),
        ("GA", "NC"),
        ("GA", "SC"),
        ("GA", "TN"),
        ("IA", "IL"),
        ("IA", "MN"),
        ("IA", "MO"),
        ("IA", "NE"),
        ("IA", "SD"),
        ("IA", "WI"),
        ("ID", "MT"),
        ("ID", "NV"),
        ("ID", "OR"),
        ("ID", "UT"),
        ("ID", "WA"),
        ("ID", "WY"),
        ("IL", "IN"),
        ("IL", "KY"),
        ("IL", "MO"),
        ("IL", "WI"),
        ("IN", "KY"),
        ("IN", "MI"),
        ("IN", "OH"),
        ("KS", "MO"),
        ("KS", "NE"),
        ("KS", "OK"),
        ("KY", "MO"),
        ("KY", "OH"),
        ("KY", "TN"),
        ("KY", "VA"),
        ("KY", "WV"),
        ("LA", "MS"),
        ("LA", "TX"),
        ("MA", "NH"),
        ("MA", "NY"),
        ("MA", "RI"),
        ("MA", "VT"),
        ("MD", "PA"),
        ("MD", "VA"),
        ("MD", "WV"),
        ("ME", "NH"),
        ("MI", "OH"),
        ("MI", "WI"),
        ("MN", "ND"),
        ("MN", "SD"),
        ("MN", "WI"),
        ("MO", "NE"),
        ("MO", "OK"),
        ("MO", "TN"),
        ("MS", "TN"),
        ("MT", "ND"),
        ("MT", "SD"),
        ("MT", "WY"),
        ("NC", "SC"),
        ("NC", "TN"),
        ("NC", "VA"),
        ("ND", "SD"),
        ("NE", "SD"),
        ("NE", "WY"),
        ("NH", "VT"),
        ("NJ", "NY"),
        ("NJ", "PA"),
        ("NM", "OK"),
        ("NM", "TX"),
        ("NV", "OR"),
        ("NV", "UT"),
        ("NY", "PA"),
        ("NY", "VT"),
        ("OH", "PA"),
        ("OH", "WV"),
        ("OK", "TX"),
        ("OR", "WA"),
        ("PA", "WV"),
        ("SD", "WY"),
        ("TN", "VA"),
        ("UT", "WY"),
        ("VA", "WV"),
        ("DC", "MD"),
        ("DC", "VA"),
    ];

    #[test]
    fn weak_sets_dict_prunes_members_and_empty_entries() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("h.dpm");
        let heap = Heap::open(&path, HeapOpenMode::Trunc)?;
        const PINNED: usize = 20;

        {
            let table = Table::init(&heap, Ref::NIL);
            let dict = Dict::init(&heap, Ref::NIL, DictKind::WeakSets);
            let mut pins = Vec::new();

            for (i, (a, b)) in CONTIGUOUS_USA_BORDERS.iter().enumerate() {
                let a_ref = table.intern(a.as_bytes())?;
                let b_ref = table.intern(b.as_bytes())?;
                dict.add(a_ref, b_ref)?;
                if i < PINNED {
                    pins.push(b_ref);
                }
            }

            let pin_vec = heap.alloc_record(0, &pins)?;
            let root = heap.alloc_record(0, &[dict.finish()?, pin_vec])?;
            heap.set_root(root)?;
            heap.commit()?;
        }

        heap.gc()?;

        let root = heap.get_root()?;
        let dict = Dict::init(&heap, heap.field(root, 0), DictKind::WeakSets);
        let pin_vec = heap.field(root, 1);
        assert_eq!(heap.len(pin_vec), PINNED as u32);

        let pinned_members: Vec<Vec<u8>> = (0..PINNED)
            .map(|i| heap.blob_bytes(heap.field(pin_vec, i as u32)))
            .collect();

        // Every pair whose "b" side was pinned must still show up in *some*
        // surviving key's set (the member survived the collection).
        for bytes in &pinned_members {
            let found = dict
                .iter_entry_members()
                .iter()
                .any(|(_, m)| heap.is_blob(*m) && heap.blob_bytes(*m) == *bytes);
            assert!(found, "pinned member {:?} missing after gc", String::from_utf8_lossy(bytes));
        }

        // No surviving entry's set contains an unpinned member, and no
        // surviving entry is empty (an empty entry is always dropped).
        for (_, member_set) in dict.iter_entries()? {
            assert!(!member_set.is_nil());
            let n = heap.len(member_set);
            assert!(n > 0, "empty member set leaked past gc pruning");
            for i in 0..n {
                let member = heap.field(member_set, i);
                let bytes = heap.blob_bytes(member);
                assert!(
                    pinned_members.iter().any(|p| p == &bytes),
                    "unpinned member {:?} survived gc",
                    String::from_utf8_lossy(&bytes)
                );
            }
        }

        Ok(())
    }

    #[test]
    fn iter_entry_members_expands_weak_sets() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let heap = Heap::open(dir.path().join("h.dpm"), HeapOpenMode::Trunc)?;
        let table = Table::init(&heap, Ref::NIL);
        let dict = Dict::init(&heap, Ref::NIL, DictKind::WeakSets);

        let mut total = 0;
        for (a, b) in CONTIGUOUS_USA_BORDERS {
            let a_ref = table.intern(a.as_bytes())?;
            let b_ref = table.intern(b.as_bytes())?;
            dict.add(a_ref, b_ref)?;
            total += 1;
        }

        let members = dict.iter_entry_members();
        assert_eq!(members.len(), total);

        let entries = dict.iter_entries()?;
        let summed: u32 = entries.iter().map(|(_, set)| heap.len(*set)).sum();
        assert_eq!(summed as usize, total);

        Ok(())
    }

    #[test]
    fn add_is_idempotent_on_identical_members() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let heap = Heap::open(dir.path().join("h.dpm"), HeapOpenMode::Trunc)?;
        let table = Table::init(&heap, Ref::NIL);
        let dict = Dict::init(&heap, Ref::NIL, DictKind::WeakSets);

        let k = table.intern(b"CA")?;
        let m = table.intern(b"NV")?;
        dict.add(k, m)?;
        dict.add(k, m)?;
        dict.add(k, m)?;

        let set = dict.get(k)?;
        assert_eq!(heap.len(set), 1);

        Ok(())
    }
}
