// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Shared 16-way HAMT machinery backing both the interning table and the
//! persistent dictionaries (spec.md §4.3/§4.4).
//!
//! Each level consumes 4 bits of a 32-bit hash, for a maximum depth of 8;
//! beyond that, colliding entries are kept in a flat collision node. A branch
//! node's populated-children bitmap doesn't fit the 7-bit object tag (it needs
//! all 16 bits), so it's stored as the node record's first field instead — the
//! tag only ever distinguishes node *kind*.
//!
//! Inserts build a RAM-resident overlay ([`Node`]) on top of whatever's
//! already on disk, copying only the path from the root to the changed leaf
//! ([`insert`]); [`finish`] serializes that overlay into the heap bottom-up,
//! returning the old root unchanged if nothing was touched.

use crate::heap::{GcRoot, Heap};
use crate::word::Ref;
use crate::Result;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Object tags recognized specially by [`crate::heap::gc`].
///
/// The interning table's branch/collision nodes and the `WEAK_KEYS`/
/// `WEAK_SETS` dict tries all need GC recognition, since none of them hold a
/// strong claim on what they reference. A strong dict's branch/collision/leaf
/// nodes are traced by plain strong recursion instead, so their tags carry no
/// special meaning outside this module.
///
/// These sit at the *top* of the 7-bit tag space (`RESERVED_MIN..=127`),
/// not the bottom: tag `0` is the conventional "plain record" tag used
/// pervasively by application code (e.g. a root wrapper record holding a
/// table ref and a dict ref side by side) and by this crate's own tests, so
/// reserving low tags would make `heap::gc::flavor_of` misidentify ordinary
/// tag-0 records as weak-trie branch nodes. Application code building its
/// own records must stay clear of `RESERVED_MIN..=127` for anything
/// reachable from the heap; see DESIGN.md.
pub mod tag {
    /// Branch node of a `WEAK_KEYS` dict's trie.
    pub const WEAK_KEYS_BRANCH: u8 = 116;
    /// Collision node of a `WEAK_KEYS` dict's trie.
    pub const WEAK_KEYS_COLLISION: u8 = 117;
    /// Leaf (key/value pair) of a `WEAK_KEYS` dict's trie.
    pub const WEAK_KEYS_LEAF: u8 = 118;
    /// Branch node of a `WEAK_SETS` dict's trie.
    pub const WEAK_SETS_BRANCH: u8 = 119;
    /// Collision node of a `WEAK_SETS` dict's trie.
    pub const WEAK_SETS_COLLISION: u8 = 120;
    /// Leaf (key/member-set pair) of a `WEAK_SETS` dict's trie.
    pub const WEAK_SETS_LEAF: u8 = 121;
    /// The member-set record embedded in a `WEAK_SETS` leaf.
    pub const WEAK_SETS_MEMBER_SET: u8 = 122;

    /// Branch node of the interning table's trie.
    pub const TABLE_BRANCH: u8 = 123;
    /// Collision node of the interning table's trie.
    pub const TABLE_COLLISION: u8 = 124;
    /// Branch node of a `STRONG` dict's trie.
    pub const STRONG_DICT_BRANCH: u8 = 125;
    /// Collision node of a `STRONG` dict's trie.
    pub const STRONG_DICT_COLLISION: u8 = 126;
    /// Leaf (key/value pair) of a `STRONG` dict's trie.
    pub const STRONG_DICT_LEAF: u8 = 127;

    /// First tag value reserved for internal trie/dict structure; application
    /// tags must stay below this.
    pub const RESERVED_MIN: u8 = WEAK_KEYS_BRANCH;
}

/// How many bits of the hash each trie level consumes.
const BITS_PER_LEVEL: u32 = 4;

/// Maximum trie depth: `32 / BITS_PER_LEVEL`, beyond which entries collide.
pub const MAX_DEPTH: u32 = 8;

/// Which tags a particular flavor of trie uses for its branch/collision
/// nodes. Leaf shape is owned by the caller via [`Leaf`].
#[derive(Copy, Clone)]
pub struct Shape {
    /// Object tag used for this trie's branch nodes.
    pub branch_tag: u8,
    /// Object tag used for this trie's collision nodes.
    pub collision_tag: u8,
}

/// A value placeable at a HAMT leaf: the table's interned blob refs, or a
/// dict's key/value (or key/member-set) pair.
pub trait Leaf: Clone {
    /// Placement hash. Must be stable across heap reopen/GC, so it may not
    /// depend on object offsets.
    fn hash(&self, heap: &Heap) -> u32;

    /// Whether `self` and `other` occupy the same trie slot (i.e. same key),
    /// as opposed to being a hash collision.
    fn same_slot(&self, heap: &Heap, other: &Self) -> bool;

    /// Allocates this leaf's on-disk representation.
    fn alloc(&self, heap: &Heap) -> Result<Ref>;

    /// Reconstructs a leaf from its on-disk representation.
    fn from_ref(heap: &Heap, r: Ref) -> Self;
}

/// A RAM-resident overlay node: either untouched heap content (`Old`), or a
/// node built/modified during this builder session.
#[derive(Clone)]
pub enum Node<L> {
    /// No entries.
    Empty,
    /// Untouched subtree still living at this heap ref.
    Old(Ref),
    /// A bitmap-indexed branch: `(populated-children bitmap, children)`.
    Branch(u32, Vec<Node<L>>),
    /// A flat list of leaves whose hashes collided past [`MAX_DEPTH`].
    Collision(Vec<Node<L>>),
    /// A single entry.
    Leaf(L),
}

enum View<L> {
    Empty,
    Branch(u32, Vec<Node<L>>),
    Collision(Vec<Node<L>>),
    Leaf(L),
}

impl<L: Leaf> Node<L> {
    /// Builds the overlay root from a (possibly nil) persisted trie ref.
    #[must_use]
    pub fn from_root(r: Ref) -> Self {
        if r.is_nil() {
            Node::Empty
        } else {
            Node::Old(r)
        }
    }

    fn view(self, heap: &Heap, shape: &Shape) -> View<L> {
        match self {
            Node::Empty => View::Empty,
            Node::Branch(bitmap, children) => View::Branch(bitmap, children),
            Node::Collision(children) => View::Collision(children),
            Node::Leaf(l) => View::Leaf(l),
            Node::Old(r) => {
                if heap.is_record(r) && heap.tag(r) == shape.branch_tag {
                    let bitmap = heap.field(r, 0).to_int() as u32;
                    let n = heap.len(r);
                    let children = (1..n).map(|i| Node::Old(heap.field(r, i))).collect();
                    View::Branch(bitmap, children)
                } else if heap.is_record(r) && heap.tag(r) == shape.collision_tag {
                    let n = heap.len(r);
                    let children = (0..n).map(|i| Node::Old(heap.field(r, i))).collect();
                    View::Collision(children)
                } else {
                    View::Leaf(L::from_ref(heap, r))
                }
            }
        }
    }
}

/// Inserts (or overwrites) `leaf`, returning the updated overlay root.
pub fn insert<L: Leaf>(node: Node<L>, heap: &Heap, shape: &Shape, depth: u32, hash: u32, leaf: L) -> Node<L> {
    match node.view(heap, shape) {
        View::Empty => Node::Leaf(leaf),
        View::Leaf(existing) => {
            if existing.same_slot(heap, &leaf) {
                Node::Leaf(leaf)
            } else if depth >= MAX_DEPTH {
                Node::Collision(vec![Node::Leaf(existing), Node::Leaf(leaf)])
            } else {
                let existing_hash = existing.hash(heap);
                let branch = insert(Node::Branch(0, Vec::new()), heap, shape, depth, existing_hash, existing);
                insert(branch, heap, shape, depth, hash, leaf)
            }
        }
        View::Collision(mut children) => {
            let pos = children.iter().position(|c| match c {
                Node::Leaf(l) => l.same_slot(heap, &leaf),
                Node::Old(r) => L::from_ref(heap, *r).same_slot(heap, &leaf),
                _ => false,
            });
            match pos {
                Some(pos) => children[pos] = Node::Leaf(leaf),
                None => children.push(Node::Leaf(leaf)),
            }
            Node::Collision(children)
        }
        View::Branch(bitmap, mut children) => {
            debug_assert!(depth < MAX_DEPTH, "branch node past max depth");
            let shift = depth * BITS_PER_LEVEL;
            let index = (hash >> shift) & 0xF;
            let bit = 1u32 << index;
            let pos = (bitmap & (bit - 1)).count_ones() as usize;

            if bitmap & bit != 0 {
                let child = std::mem::replace(&mut children[pos], Node::Empty);
                children[pos] = insert(child, heap, shape, depth + 1, hash, leaf);
                Node::Branch(bitmap, children)
            } else {
                children.insert(pos, insert(Node::Empty, heap, shape, depth + 1, hash, leaf));
                Node::Branch(bitmap | bit, children)
            }
        }
    }
}

/// Looks up the leaf matching `probe`'s slot in a *persisted* trie (no
/// overlay), returning the ref of the on-disk leaf object if present.
///
/// `depth` is the *absolute* depth (hash bits already consumed by ancestors)
/// at which `root` sits — 0 if `root` is the whole trie's persisted root, or
/// more if it's an untouched subtree reached through some already-overlaid
/// ancestor levels (see [`get`]).
pub fn lookup<L: Leaf>(heap: &Heap, shape: &Shape, root: Ref, depth: u32, hash: u32, probe: &L) -> Option<Ref> {
    let mut r = root;
    let mut depth = depth;

    loop {
        if r.is_nil() {
            return None;
        }

        if heap.is_record(r) && heap.tag(r) == shape.branch_tag {
            let bitmap = heap.field(r, 0).to_int() as u32;
            let shift = depth * BITS_PER_LEVEL;
            let index = (hash >> shift) & 0xF;
            let bit = 1u32 << index;
            if bitmap & bit == 0 {
                return None;
            }
            let pos = 1 + (bitmap & (bit - 1)).count_ones();
            r = heap.field(r, pos);
            depth += 1;
        } else if heap.is_record(r) && heap.tag(r) == shape.collision_tag {
            let n = heap.len(r);
            for i in 0..n {
                let child = heap.field(r, i);
                if L::from_ref(heap, child).same_slot(heap, probe) {
                    return Some(child);
                }
            }
            return None;
        } else {
            return if L::from_ref(heap, r).same_slot(heap, probe) {
                Some(r)
            } else {
                None
            };
        }
    }
}

/// Looks up `probe`'s slot across an overlay (mixed fresh/persisted trie),
/// returning a clone of the matching leaf if present. Unlike [`lookup`],
/// `probe` must already be a real `L` (not a lookup-only stand-in) since
/// dict keys, unlike table content, are always already-allocated refs.
pub fn get<L: Leaf>(node: &Node<L>, heap: &Heap, shape: &Shape, depth: u32, hash: u32, probe: &L) -> Option<L> {
    match node {
        Node::Empty => None,
        Node::Leaf(l) => l.same_slot(heap, probe).then(|| l.clone()),
        Node::Old(r) => lookup(heap, shape, *r, depth, hash, probe).map(|found| L::from_ref(heap, found)),
        Node::Collision(children) => children.iter().find_map(|c| get(c, heap, shape, depth, hash, probe)),
        Node::Branch(bitmap, children) => {
            let shift = depth * BITS_PER_LEVEL;
            let index = (hash >> shift) & 0xF;
            let bit = 1u32 << index;
            if bitmap & bit == 0 {
                return None;
            }
            let pos = (bitmap & (bit - 1)).count_ones() as usize;
            get(&children[pos], heap, shape, depth + 1, hash, probe)
        }
    }
}

/// Removes the leaf matching `probe`'s slot, if any, collapsing
/// single-child branches and collision nodes the same way [`insert`] grows
/// them, so a dict that has every key deleted serializes back to nil rather
/// than a tree of empty shells.
pub fn remove<L: Leaf>(node: Node<L>, heap: &Heap, shape: &Shape, depth: u32, hash: u32, probe: &L) -> Node<L> {
    match node.view(heap, shape) {
        View::Empty => Node::Empty,
        View::Leaf(existing) => {
            if existing.same_slot(heap, probe) {
                Node::Empty
            } else {
                Node::Leaf(existing)
            }
        }
        View::Collision(mut children) => {
            let pos = children.iter().position(|c| match c {
                Node::Leaf(l) => l.same_slot(heap, probe),
                Node::Old(r) => L::from_ref(heap, *r).same_slot(heap, probe),
                _ => false,
            });
            if let Some(pos) = pos {
                children.remove(pos);
            }
            match children.len() {
                0 => Node::Empty,
                1 => children.into_iter().next().expect("len checked above"),
                _ => Node::Collision(children),
            }
        }
        View::Branch(bitmap, mut children) => {
            let shift = depth * BITS_PER_LEVEL;
            let index = (hash >> shift) & 0xF;
            let bit = 1u32 << index;

            if bitmap & bit == 0 {
                return Node::Branch(bitmap, children);
            }

            let pos = (bitmap & (bit - 1)).count_ones() as usize;
            let child = std::mem::replace(&mut children[pos], Node::Empty);

            match remove(child, heap, shape, depth + 1, hash, probe) {
                Node::Empty => {
                    children.remove(pos);
                    let new_bitmap = bitmap & !bit;
                    if new_bitmap == 0 {
                        Node::Empty
                    } else {
                        Node::Branch(new_bitmap, children)
                    }
                }
                other => {
                    children[pos] = other;
                    Node::Branch(bitmap, children)
                }
            }
        }
    }
}

/// Serializes the overlay into the heap, returning its root ref. Returns the
/// original ref unchanged for a subtree that was never touched.
pub fn finish<L: Leaf>(node: Node<L>, heap: &Heap, shape: &Shape) -> Result<Ref> {
    match node {
        Node::Empty => Ok(Ref::NIL),
        Node::Old(r) => Ok(r),
        Node::Leaf(l) => l.alloc(heap),
        Node::Branch(bitmap, children) => {
            let mut fields = Vec::with_capacity(children.len() + 1);
            fields.push(Ref::from_int(bitmap as i32));
            for c in children {
                fields.push(finish(c, heap, shape)?);
            }
            heap.alloc_record(shape.branch_tag, &fields)
        }
        Node::Collision(children) => {
            let mut fields = Vec::with_capacity(children.len());
            for c in children {
                fields.push(finish(c, heap, shape)?);
            }
            heap.alloc_record(shape.collision_tag, &fields)
        }
    }
}

/// Collects every leaf reachable from the overlay, in deterministic
/// (bitmap/field) order.
pub fn iter_leaves<L: Leaf>(node: &Node<L>, heap: &Heap, shape: &Shape, out: &mut Vec<L>) {
    match node {
        Node::Empty => {}
        Node::Leaf(l) => out.push(l.clone()),
        Node::Old(r) => iter_old_leaves(heap, shape, *r, out),
        Node::Branch(_, children) => {
            for c in children {
                iter_leaves(c, heap, shape, out);
            }
        }
        Node::Collision(children) => {
            for c in children {
                iter_leaves(c, heap, shape, out);
            }
        }
    }
}

fn iter_old_leaves<L: Leaf>(heap: &Heap, shape: &Shape, r: Ref, out: &mut Vec<L>) {
    if r.is_nil() {
        return;
    }

    if heap.is_record(r) && heap.tag(r) == shape.branch_tag {
        let n = heap.len(r);
        for i in 1..n {
            iter_old_leaves(heap, shape, heap.field(r, i), out);
        }
    } else if heap.is_record(r) && heap.tag(r) == shape.collision_tag {
        let n = heap.len(r);
        for i in 0..n {
            iter_old_leaves(heap, shape, heap.field(r, i), out);
        }
    } else {
        out.push(L::from_ref(heap, r));
    }
}

/// Every ref embedded anywhere in the overlay: `Old` subtree roots (traced
/// further by the GC via tag recognition, not recursed into here) plus every
/// ref directly held by a freshly-inserted, not-yet-persisted leaf.
///
/// Uncommitted leaves are always reported as strong roots regardless of trie
/// flavor — weak pruning only applies to structure already reachable from a
/// finished, persisted root (see `crate::heap::gc`). No test scenario GCs
/// across an open, mid-edit weak builder, so this narrow simplification is
/// safe in practice.
pub fn overlay_roots<L: Leaf + LeafRoots>(node: &Node<L>, out: &mut Vec<Ref>) {
    match node {
        Node::Empty => {}
        Node::Old(r) => out.push(*r),
        Node::Leaf(l) => l.embedded_refs(out),
        Node::Branch(_, children) | Node::Collision(children) => {
            for c in children {
                overlay_roots(c, out);
            }
        }
    }
}

/// Extension of [`Leaf`] letting the GC-root walk ([`overlay_roots`]) reach
/// the refs a leaf embeds without knowing its concrete shape, and letting
/// [`rewrite_all`] patch those same refs through a post-GC forwarding table.
pub trait LeafRoots {
    /// Appends every ref this leaf embeds to `out`.
    fn embedded_refs(&self, out: &mut Vec<Ref>);

    /// Rewrites every ref this leaf embeds through `forward`, in place.
    fn rewrite_refs(&mut self, forward: &dyn Fn(Ref) -> Ref);
}

/// Rewrites every ref in the overlay through a forwarding function: `Old`
/// subtree roots directly, and each uncommitted leaf's own embedded refs via
/// [`LeafRoots::rewrite_refs`].
pub fn rewrite_all<L: LeafRoots>(node: &mut Node<L>, forward: &dyn Fn(Ref) -> Ref) {
    match node {
        Node::Old(r) => *r = forward(*r),
        Node::Leaf(l) => l.rewrite_refs(forward),
        Node::Branch(_, children) | Node::Collision(children) => {
            for c in children {
                rewrite_all(c, forward);
            }
        }
        Node::Empty => {}
    }
}

/// RAM-resident state shared by every HAMT-backed builder (the interning
/// table and the three dict flavors): the heap it allocates into, plus its
/// current overlay. Wrapped in `Rc<RefCell<_>>` by callers so it can be
/// registered with the heap as a [`GcRoot`] while the builder itself is
/// handed out by value.
pub(crate) struct BuilderState<'h, L> {
    pub heap: &'h Heap,
    pub overlay: Node<L>,
}

impl<'h, L: Leaf + LeafRoots> GcRoot for RefCell<BuilderState<'h, L>> {
    fn gc_roots(&self) -> Vec<Ref> {
        let inner = self.borrow();
        let mut out = Vec::new();
        overlay_roots(&inner.overlay, &mut out);
        out
    }

    fn gc_rewrite(&self, forward: &dyn Fn(Ref) -> Ref) {
        let mut inner = self.borrow_mut();
        rewrite_all(&mut inner.overlay, forward);
    }
}

/// Registers `state` with `heap` as a GC root for as long as it stays alive.
///
/// # Safety
///
/// `heap.roots` stores `Weak<dyn GcRoot>` with no lifetime bound, but the
/// only way to obtain one is through a `&'h Heap` borrow that the borrow
/// checker keeps alive for as long as `state` (an `Rc`) exists. `gc()` only
/// ever upgrades a registered `Weak` transiently, within a single call, and a
/// successful upgrade implies the `Rc` — and therefore the `'h` borrow — is
/// still live. This mirrors the lifetime erasure `std::thread::scope`
/// performs internally for the same reason.
pub(crate) fn register_builder<'h, L: Leaf + LeafRoots + 'h>(
    heap: &'h Heap,
    state: &Rc<RefCell<BuilderState<'h, L>>>,
) {
    let weak: Weak<RefCell<BuilderState<'h, L>>> = Rc::downgrade(state);
    let weak: Weak<dyn GcRoot + 'h> = weak;
    let weak: Weak<dyn GcRoot> = unsafe { std::mem::transmute(weak) };
    heap.register_root(weak);
}
