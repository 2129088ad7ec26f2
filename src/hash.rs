// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Deterministic hashing. Used both generically and, in `blob_hash32`, to
//! place interning-table leaves in the HAMT (spec.md §4.3, §9 — "any
//! deterministic 32-bit hash is acceptable provided it is fixed per format
//! version").

/// General-purpose 64-bit content hash.
#[must_use]
pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// 32-bit content hash used to place a blob in the interning HAMT.
///
/// Fixed for format version 1: truncates `xxh3_64`. Must never change
/// without bumping the on-disk format version, since it determines trie
/// shape (not the file's byte layout, but the layout test fixtures assume).
#[must_use]
pub fn blob_hash32(bytes: &[u8]) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let truncated = hash64(bytes) as u32;
    truncated
}

/// 32-bit content hash used to place a dict key in its HAMT.
///
/// Dict key equality is [`crate::object::equal_shallow`]: the same
/// reference, or equal immediates. This hash must agree with that — it's
/// computed from content (immediate value, blob bytes, or a record's tag and
/// its fields' own content hashes) rather than from a ref's offset, so it
/// stays stable across a `gc` compaction that changes every offset but
/// preserves content. For the common case (an interned blob key), this is
/// exactly [`blob_hash32`] of the key's bytes.
#[must_use]
pub fn key_hash32(heap: &crate::heap::Heap, r: crate::word::Ref) -> u32 {
    if r.is_nil() {
        return 0;
    }

    if r.is_immediate() {
        return hash32(&r.to_int().to_le_bytes());
    }

    if heap.is_blob(r) {
        return blob_hash32(&heap.blob_bytes(r));
    }

    let mut buf = vec![heap.tag(r)];
    for i in 0..heap.len(r) {
        buf.extend_from_slice(&key_hash32(heap, heap.field(r, i)).to_le_bytes());
    }
    hash32(&buf)
}

fn hash32(bytes: &[u8]) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let truncated = hash64(bytes) as u32;
    truncated
}
