// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Object headers and field/byte access.
//!
//! Pure functions over a heap's byte arena and [`Ref`]s into it, per the
//! bit-exact layout in the file format: a 4-byte header (kind bit, 7-bit tag,
//! 24-bit length) followed by `length` record fields or `length` blob bytes,
//! padded up to a word boundary.

use crate::word::Ref;

/// Size in bytes of an object header.
pub const HEADER_BYTES: u32 = 4;

/// Maximum tag value (7 bits).
pub const MAX_TAG: u8 = 0x7F;

/// Maximum length representable (24 bits).
pub const MAX_LEN: u32 = 0x00FF_FFFF;

/// Discriminates the two object shapes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    /// A fixed-length vector of fields (immediates or references).
    Record,
    /// An immutable byte array.
    Blob,
}

fn read_u32(bytes: &[u8], offset: u32) -> u32 {
    let offset = offset as usize;
    u32::from_le_bytes(
        bytes
            .get(offset..offset + 4)
            .expect("object header out of bounds")
            .try_into()
            .expect("slice is 4 bytes"),
    )
}

/// Reads the raw header word of the object at `r`.
///
/// # Panics
///
/// Panics if `r` is nil or an immediate (program error, per spec taxonomy).
#[must_use]
pub fn header(bytes: &[u8], r: Ref) -> u32 {
    read_u32(bytes, r.offset())
}

/// Encodes a header word from its three components.
///
/// # Panics
///
/// Panics if `tag` or `len` don't fit in their allotted bits.
#[must_use]
pub fn encode_header(kind: Kind, tag: u8, len: u32) -> u32 {
    assert!(tag <= MAX_TAG, "tag {tag} exceeds 7 bits");
    assert!(len <= MAX_LEN, "length {len} exceeds 24 bits");

    let kind_bit: u32 = match kind {
        Kind::Record => 0,
        Kind::Blob => 1,
    };

    kind_bit | (u32::from(tag) << 1) | (len << 8)
}

/// Decodes the kind bit out of a raw header word.
#[must_use]
pub fn kind_of(header_word: u32) -> Kind {
    if header_word & 1 == 0 {
        Kind::Record
    } else {
        Kind::Blob
    }
}

/// Decodes the 7-bit tag out of a raw header word.
#[must_use]
pub fn tag_of(header_word: u32) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    (((header_word >> 1) & u32::from(MAX_TAG)) as u8)
}

/// Decodes the length field out of a raw header word.
#[must_use]
pub fn len_of(header_word: u32) -> u32 {
    header_word >> 8
}

/// Total size in bytes of the object (header + payload, word-aligned).
#[must_use]
pub fn object_size(header_word: u32) -> u32 {
    let len = len_of(header_word);

    let payload_bytes = match kind_of(header_word) {
        Kind::Record => len * 4,
        Kind::Blob => (len + 3) & !3,
    };

    HEADER_BYTES + payload_bytes
}

/// Whether `r` is a blob (false for nil and immediates).
#[must_use]
pub fn is_blob(bytes: &[u8], r: Ref) -> bool {
    !r.is_immediate() && !r.is_nil() && kind_of(header(bytes, r)) == Kind::Blob
}

/// Whether `r` is a record (false for nil and immediates).
#[must_use]
pub fn is_record(bytes: &[u8], r: Ref) -> bool {
    !r.is_immediate() && !r.is_nil() && kind_of(header(bytes, r)) == Kind::Record
}

/// Returns the object's tag (0..127).
///
/// # Panics
///
/// Panics if `r` is nil or an immediate.
#[must_use]
pub fn tag(bytes: &[u8], r: Ref) -> u8 {
    tag_of(header(bytes, r))
}

/// Returns the object's length: fields for a record, bytes for a blob.
///
/// # Panics
///
/// Panics if `r` is nil or an immediate.
#[must_use]
pub fn len(bytes: &[u8], r: Ref) -> u32 {
    len_of(header(bytes, r))
}

/// Returns the `i`-th field of a record.
///
/// # Panics
///
/// Panics if `r` is not a record, or `i` is out of range (program error).
#[must_use]
pub fn field(bytes: &[u8], r: Ref, i: u32) -> Ref {
    assert!(is_record(bytes, r), "field() on a non-record");
    assert!(i < len(bytes, r), "field index {i} out of range");

    let offset = r.offset() + HEADER_BYTES + i * 4;
    Ref::from_raw(read_u32(bytes, offset))
}

/// Returns an immutable view of a blob's payload.
///
/// # Panics
///
/// Panics if `r` is not a blob.
#[must_use]
pub fn blob_bytes(bytes: &[u8], r: Ref) -> &[u8] {
    assert!(is_blob(bytes, r), "blob_bytes() on a non-blob");

    let start = (r.offset() + HEADER_BYTES) as usize;
    let end = start + len(bytes, r) as usize;

    bytes.get(start..end).expect("blob payload out of bounds")
}

/// Reference identity, or immediates of equal value.
///
/// Does not inspect blob/record content; after interning, content-equal
/// blobs are the same reference, so this is sufficient for interned data.
#[must_use]
pub fn equal_shallow(a: Ref, b: Ref) -> bool {
    if a.is_immediate() && b.is_immediate() {
        a.to_int() == b.to_int()
    } else {
        a == b
    }
}

/// Structural equality: blobs compared byte-wise, records field-wise.
#[must_use]
pub fn equal_deep(bytes: &[u8], a: Ref, b: Ref) -> bool {
    if equal_shallow(a, b) {
        return true;
    }

    if a.is_nil() || b.is_nil() || a.is_immediate() || b.is_immediate() {
        return false;
    }

    match (is_blob(bytes, a), is_blob(bytes, b)) {
        (true, true) => blob_bytes(bytes, a) == blob_bytes(bytes, b),
        (false, false) => {
            is_record(bytes, a)
                && is_record(bytes, b)
                && tag(bytes, a) == tag(bytes, b)
                && len(bytes, a) == len(bytes, b)
                && (0..len(bytes, a))
                    .all(|i| equal_deep(bytes, field(bytes, a, i), field(bytes, b, i)))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_record(bytes: &mut Vec<u8>, tag: u8, fields: &[Ref]) -> Ref {
        let offset = bytes.len() as u32;
        let header_word = encode_header(Kind::Record, tag, fields.len() as u32);
        bytes.extend_from_slice(&header_word.to_le_bytes());
        for f in fields {
            bytes.extend_from_slice(&f.raw().to_le_bytes());
        }
        Ref::from_offset(offset)
    }

    fn push_blob(bytes: &mut Vec<u8>, tag: u8, payload: &[u8]) -> Ref {
        let offset = bytes.len() as u32;
        let header_word = encode_header(Kind::Blob, tag, payload.len() as u32);
        bytes.extend_from_slice(&header_word.to_le_bytes());
        bytes.extend_from_slice(payload);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        Ref::from_offset(offset)
    }

    #[test]
    fn blob_round_trip() {
        let mut heap = vec![0u8; 4]; // offset 0 reserved, unused in this test arena
        let r = push_blob(&mut heap, 5, b"foo");
        assert!(is_blob(&heap, r));
        assert_eq!(tag(&heap, r), 5);
        assert_eq!(len(&heap, r), 3);
        assert_eq!(blob_bytes(&heap, r), b"foo");
    }

    #[test]
    fn record_round_trip() {
        let mut heap = vec![0u8; 4];
        let a = Ref::from_int(7);
        let b = push_blob(&mut heap, 0, b"hi");
        let r = push_record(&mut heap, 2, &[a, b]);
        assert!(is_record(&heap, r));
        assert_eq!(len(&heap, r), 2);
        assert_eq!(field(&heap, r, 0), a);
        assert_eq!(field(&heap, r, 1), b);
    }

    #[test]
    fn equal_deep_compares_structurally() {
        let mut heap = vec![0u8; 4];
        let b1 = push_blob(&mut heap, 0, b"abc");
        let b2 = push_blob(&mut heap, 0, b"abc");
        let b3 = push_blob(&mut heap, 0, b"abd");
        assert!(equal_deep(&heap, b1, b2));
        assert!(!equal_deep(&heap, b1, b3));
        assert!(!equal_shallow(b1, b2));
    }

    #[test]
    fn object_size_is_word_aligned() {
        let h = encode_header(Kind::Blob, 0, 3);
        assert_eq!(object_size(h), 8); // 4-byte header + 4-byte padded payload

        let h = encode_header(Kind::Record, 0, 2);
        assert_eq!(object_size(h), 12);
    }
}
