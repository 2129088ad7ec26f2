// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The copying collector (spec.md §4.5, §9).
//!
//! Strategy: allocate every live object into a fresh heap file in a single
//! depth-first, fields-in-index-order pass, then atomically swap the new file
//! into place. Because the heap is append-only and a record can only ever
//! reference earlier-allocated objects, the live graph is acyclic and plain
//! recursion terminates without a visited-set beyond the forwarding table
//! itself.
//!
//! Weak dicts, and the interning table, need a second pass: a
//! `WEAK_KEYS`/`WEAK_SETS` leaf must only survive if its key (for
//! `WEAK_KEYS`) or each of its members (for `WEAK_SETS`) turns out to be
//! reachable through some *other*, possibly later-visited, strong path, and a
//! table entry must only survive if the blob it names is reachable some other
//! way too — the table itself holds no strong claim on its contents (spec.md
//! §4.3, §9 S3). None of this is known until the strong trace is complete. So
//! [`resolve`] never recurses into a weak-flavored ref directly; it defers it
//! (remembering where the result needs to be written back) and fills in a
//! temporary nil. Once the strong trace finishes, every deferred subtree is
//! rebuilt by walking the *old* heap and keeping only what ended up
//! forwarded, and the deferred write-back sites are patched.
//!
//! This trades the spec's suggested in-object forwarding-pointer encoding
//! (stealing header bits to mark a forwarded object and overwrite it in
//! place) for a plain side table. The header-bit trick can't represent
//! forwarding for a zero-field record or zero-byte blob without clobbering
//! the next object's header, and since the old heap is only ever read here,
//! never mutated, a side table has no compactness advantage to give up for
//! that correctness hole.

use super::{GcRoot, Heap, HeapOpenMode};
use crate::hamt;
use crate::word::Ref;
use crate::Result;
use scopeguard::guard;
use std::collections::{HashMap, VecDeque};
use std::rc::Weak;

#[derive(Copy, Clone)]
enum Flavor {
    WeakKeys,
    WeakSets,
    Table,
}

fn flavor_of(heap: &Heap, r: Ref) -> Option<Flavor> {
    if r.is_nil() || r.is_immediate() || !heap.is_record(r) {
        return None;
    }

    match heap.tag(r) {
        hamt::tag::WEAK_KEYS_BRANCH | hamt::tag::WEAK_KEYS_COLLISION | hamt::tag::WEAK_KEYS_LEAF => {
            Some(Flavor::WeakKeys)
        }
        hamt::tag::WEAK_SETS_BRANCH | hamt::tag::WEAK_SETS_COLLISION | hamt::tag::WEAK_SETS_LEAF => {
            Some(Flavor::WeakSets)
        }
        hamt::tag::TABLE_BRANCH | hamt::tag::TABLE_COLLISION => Some(Flavor::Table),
        _ => None,
    }
}

struct State {
    /// Old object offset -> new ref. A weak-flavored key mapping to
    /// `Ref::NIL` means "visited and pruned", distinct from "not yet visited"
    /// (absent).
    forward: HashMap<u32, Ref>,
    pending_weak: VecDeque<(Ref, Flavor)>,
    /// (new parent ref, field index, old child ref) write-backs to apply once
    /// every pending weak subtree has been rebuilt.
    field_patches: Vec<(Ref, u32, Ref)>,
}

fn enqueue_weak(state: &mut State, heap: &Heap, r: Ref) {
    let flavor = flavor_of(heap, r).expect("enqueue_weak on a non-weak ref");
    state.pending_weak.push_back((r, flavor));
}

/// Copies an object (and everything strongly reachable from it) into `new`,
/// memoizing by old offset so shared substructure stays shared. Must not be
/// called directly on a weak-flavored ref — callers check `flavor_of` first
/// and defer instead (see the per-field handling below, and [`collect`]'s
/// root/builder-root handling).
fn resolve(old: &Heap, new: &Heap, state: &mut State, r: Ref) -> Result<Ref> {
    if r.is_nil() || r.is_immediate() {
        return Ok(r);
    }

    debug_assert!(
        flavor_of(old, r).is_none(),
        "resolve() called directly on a weak-flavored ref"
    );

    if let Some(&done) = state.forward.get(&r.offset()) {
        return Ok(done);
    }

    if old.is_blob(r) {
        let tag = old.tag(r);
        let bytes = old.blob_bytes(r);
        let new_ref = new.alloc_blob(tag, &bytes)?;
        state.forward.insert(r.offset(), new_ref);
        return Ok(new_ref);
    }

    let tag = old.tag(r);
    let n = old.len(r);
    let placeholders = vec![Ref::NIL; n as usize];
    let new_ref = new.alloc_record(tag, &placeholders)?;
    // Inserted before recursing: shared substructure (a record field by more
    // than one parent, e.g. an interned blob) must resolve to one copy.
    state.forward.insert(r.offset(), new_ref);

    for i in 0..n {
        let child = old.field(r, i);

        if child.is_nil() || child.is_immediate() {
            new.patch_field(new_ref, i, child)?;
            continue;
        }

        if flavor_of(old, child).is_some() {
            enqueue_weak(state, old, child);
            state.field_patches.push((new_ref, i, child));
            continue;
        }

        let resolved = resolve(old, new, state, child)?;
        new.patch_field(new_ref, i, resolved)?;
    }

    Ok(new_ref)
}

/// Shared branch/collision walk over the *old* heap for a weak trie: the
/// structural part is identical between `WEAK_KEYS` and `WEAK_SETS`, only the
/// leaf shape (and thus what "survives" means) differs.
fn rebuild_weak_trie(
    old: &Heap,
    new: &Heap,
    state: &mut State,
    r: Ref,
    branch_tag: u8,
    collision_tag: u8,
    rebuild_leaf: &mut dyn FnMut(&Heap, &Heap, &mut State, Ref) -> Result<Ref>,
) -> Result<Ref> {
    if r.is_nil() {
        return Ok(Ref::NIL);
    }

    let tag = old.tag(r);

    if tag == branch_tag {
        let bitmap_field = old.field(r, 0).to_int() as u32;
        let n = old.len(r);
        let mut new_bitmap = 0u32;
        let mut new_fields = vec![Ref::NIL];
        let mut bit_index = 0u32;
        let mut remaining = bitmap_field;

        for i in 1..n {
            while remaining & 1 == 0 {
                remaining >>= 1;
                bit_index += 1;
            }
            let bit = 1u32 << bit_index;

            let child = rebuild_weak_trie(
                old,
                new,
                state,
                old.field(r, i),
                branch_tag,
                collision_tag,
                rebuild_leaf,
            )?;
            if !child.is_nil() {
                new_bitmap |= bit;
                new_fields.push(child);
            }

            remaining >>= 1;
            bit_index += 1;
        }

        if new_bitmap == 0 {
            Ok(Ref::NIL)
        } else {
            new_fields[0] = Ref::from_int(new_bitmap as i32);
            new.alloc_record(branch_tag, &new_fields)
        }
    } else if tag == collision_tag {
        let n = old.len(r);
        let mut survivors = Vec::new();

        for i in 0..n {
            let child = rebuild_weak_trie(
                old,
                new,
                state,
                old.field(r, i),
                branch_tag,
                collision_tag,
                rebuild_leaf,
            )?;
            if !child.is_nil() {
                survivors.push(child);
            }
        }

        match survivors.len() {
            0 => Ok(Ref::NIL),
            1 => Ok(survivors[0]),
            _ => new.alloc_record(collision_tag, &survivors),
        }
    } else {
        rebuild_leaf(old, new, state, r)
    }
}

fn is_alive(state: &State, r: Ref) -> bool {
    r.is_nil() || r.is_immediate() || state.forward.contains_key(&r.offset())
}

/// A `WEAK_KEYS` leaf survives iff its key is otherwise reachable; its value
/// is strong once the entry survives.
fn weak_keys_leaf(old: &Heap, new: &Heap, state: &mut State, r: Ref) -> Result<Ref> {
    let key_old = old.field(r, 0);
    if !is_alive(state, key_old) {
        return Ok(Ref::NIL);
    }
    let new_key = resolve(old, new, state, key_old)?;
    let new_value = resolve(old, new, state, old.field(r, 1))?;
    new.alloc_record(hamt::tag::WEAK_KEYS_LEAF, &[new_key, new_value])
}

fn rebuild_weak_keys(old: &Heap, new: &Heap, state: &mut State, r: Ref) -> Result<Ref> {
    rebuild_weak_trie(
        old,
        new,
        state,
        r,
        hamt::tag::WEAK_KEYS_BRANCH,
        hamt::tag::WEAK_KEYS_COLLISION,
        &mut weak_keys_leaf,
    )
}

/// A `WEAK_SETS` leaf's key is always strong (the dict keeps its own keys
/// alive); only individual members are weak, and an entry whose member set
/// empties out entirely is dropped.
fn weak_sets_leaf(old: &Heap, new: &Heap, state: &mut State, r: Ref) -> Result<Ref> {
    let key_old = old.field(r, 0);
    let set_old = old.field(r, 1);
    let n = old.len(set_old);

    let mut survivors = Vec::new();
    for i in 0..n {
        let member = old.field(set_old, i);
        if is_alive(state, member) {
            survivors.push(resolve(old, new, state, member)?);
        }
    }

    if survivors.is_empty() {
        return Ok(Ref::NIL);
    }

    let new_key = resolve(old, new, state, key_old)?;
    let new_set = new.alloc_record(hamt::tag::WEAK_SETS_MEMBER_SET, &survivors)?;
    new.alloc_record(hamt::tag::WEAK_SETS_LEAF, &[new_key, new_set])
}

fn rebuild_weak_sets(old: &Heap, new: &Heap, state: &mut State, r: Ref) -> Result<Ref> {
    rebuild_weak_trie(
        old,
        new,
        state,
        r,
        hamt::tag::WEAK_SETS_BRANCH,
        hamt::tag::WEAK_SETS_COLLISION,
        &mut weak_sets_leaf,
    )
}

/// A table entry's leaf *is* the interned blob itself (no wrapper record);
/// it survives iff that blob turns out to be reachable through some other
/// strong path. The table holds no strong claim on its own contents.
fn table_leaf(old: &Heap, new: &Heap, state: &mut State, r: Ref) -> Result<Ref> {
    if is_alive(state, r) {
        resolve(old, new, state, r)
    } else {
        Ok(Ref::NIL)
    }
}

fn rebuild_table(old: &Heap, new: &Heap, state: &mut State, r: Ref) -> Result<Ref> {
    rebuild_weak_trie(
        old,
        new,
        state,
        r,
        hamt::tag::TABLE_BRANCH,
        hamt::tag::TABLE_COLLISION,
        &mut table_leaf,
    )
}

/// Runs a full collection of `heap`, swapping its backing file in place.
pub(crate) fn collect(heap: &Heap) -> Result<()> {
    let original_path = heap.path();
    let dir = original_path
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_default();
    let tmp_name = format!(
        ".{}.gc-tmp",
        original_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("heap")
    );
    let tmp_path = dir.join(tmp_name);

    let new_heap = Heap::open(&tmp_path, HeapOpenMode::Trunc)?;
    // If collection fails partway through, the half-built tmp file must not
    // linger next to the original heap.
    let cleanup_tmp = guard(tmp_path.clone(), |p| {
        let _ = std::fs::remove_file(p);
    });
    let mut state = State {
        forward: HashMap::new(),
        pending_weak: VecDeque::new(),
        field_patches: Vec::new(),
    };

    let old_root = heap.get_root()?;
    let root_is_weak = flavor_of(heap, old_root).is_some();
    let mut new_root = old_root;

    if root_is_weak {
        enqueue_weak(&mut state, heap, old_root);
    } else if old_root.is_reference() && !old_root.is_nil() {
        new_root = resolve(heap, &new_heap, &mut state, old_root)?;
    }

    let roots_snapshot: Vec<Weak<dyn GcRoot>> = heap.registered_roots();

    for weak in &roots_snapshot {
        let Some(root) = weak.upgrade() else { continue };
        for r in root.gc_roots() {
            if r.is_nil() || r.is_immediate() {
                continue;
            }
            if flavor_of(heap, r).is_some() {
                enqueue_weak(&mut state, heap, r);
            } else {
                resolve(heap, &new_heap, &mut state, r)?;
            }
        }
    }

    while let Some((old_ref, flavor)) = state.pending_weak.pop_front() {
        if state.forward.contains_key(&old_ref.offset()) {
            continue;
        }
        let resolved = match flavor {
            Flavor::WeakKeys => rebuild_weak_keys(heap, &new_heap, &mut state, old_ref)?,
            Flavor::WeakSets => rebuild_weak_sets(heap, &new_heap, &mut state, old_ref)?,
            Flavor::Table => rebuild_table(heap, &new_heap, &mut state, old_ref)?,
        };
        state.forward.insert(old_ref.offset(), resolved);
    }

    for (parent, idx, old_child) in std::mem::take(&mut state.field_patches) {
        let value = if old_child.is_nil() || old_child.is_immediate() {
            old_child
        } else {
            state
                .forward
                .get(&old_child.offset())
                .copied()
                .unwrap_or(Ref::NIL)
        };
        new_heap.patch_field(parent, idx, value)?;
    }

    if root_is_weak {
        new_root = state
            .forward
            .get(&old_root.offset())
            .copied()
            .unwrap_or(Ref::NIL);
    }

    new_heap.set_root(new_root)?;
    new_heap.commit()?;

    log::debug!(
        "gc: {} bytes -> {} bytes",
        heap.used_bytes(),
        new_heap.used_bytes()
    );

    let resolve_fn = |old: Ref| -> Ref {
        if old.is_nil() || old.is_immediate() {
            old
        } else {
            state.forward.get(&old.offset()).copied().unwrap_or(Ref::NIL)
        }
    };

    for weak in &roots_snapshot {
        if let Some(root) = weak.upgrade() {
            root.gc_rewrite(&resolve_fn);
        }
    }

    let result = heap.adopt(new_heap);
    if result.is_ok() {
        // The rename inside `adopt` already moved the tmp file into place.
        scopeguard::ScopeGuard::into_inner(cleanup_tmp);
    }
    result
}
