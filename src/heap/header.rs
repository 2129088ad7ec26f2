// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The 32-byte heap file header (spec.md §6, bit-exact).

use crate::coding::{Decode, Encode, EncodeError};
use crate::error::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// `0xB5C0BEEF`, little-endian.
pub const MAGIC: u32 = 0xB5C0_BEEF;

/// The only format version this crate understands.
pub const FORMAT_VERSION: u32 = 1;

/// Total size of the header, and the offset the object arena starts at.
pub const HEADER_BYTES: u32 = 32;

const RESERVED_BYTES: usize = 16;

/// The heap file's fixed-size header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapHeader {
    /// On-disk format version; currently always [`FORMAT_VERSION`].
    pub format_version: u32,
    /// Total bytes in use from offset 0, including this header.
    pub used_bytes: u32,
    /// Raw root word: `0` (nil) or an offset into the arena.
    pub root: u32,
}

impl HeapHeader {
    /// A fresh, empty, nil-rooted header for a newly truncated file.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            used_bytes: HEADER_BYTES,
            root: 0,
        }
    }
}

impl Encode for HeapHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(MAGIC)?;
        writer.write_u32::<LittleEndian>(self.format_version)?;
        writer.write_u32::<LittleEndian>(self.used_bytes)?;
        writer.write_u32::<LittleEndian>(self.root)?;
        writer.write_all(&[0u8; RESERVED_BYTES])?;
        Ok(())
    }
}

impl Decode for HeapHeader {
    fn decode_from<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;

        if magic != MAGIC {
            return Err(Error::Format(format!(
                "bad magic number: expected {MAGIC:#010x}, got {magic:#010x}"
            )));
        }

        let format_version = reader.read_u32::<LittleEndian>()?;

        if format_version != FORMAT_VERSION {
            return Err(Error::Format(format!(
                "unsupported format version {format_version}, expected {FORMAT_VERSION}"
            )));
        }

        let used_bytes = reader.read_u32::<LittleEndian>()?;
        let root = reader.read_u32::<LittleEndian>()?;

        let mut reserved = [0u8; RESERVED_BYTES];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            format_version,
            used_bytes,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips() {
        let header = HeapHeader {
            format_version: FORMAT_VERSION,
            used_bytes: 1234,
            root: 64,
        };

        let bytes = header.encode_into_vec();
        assert_eq!(bytes.len(), HEADER_BYTES as usize);

        let decoded = HeapHeader::decode_from(&mut Cursor::new(bytes)).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = HeapHeader::fresh().encode_into_vec();
        bytes[0] = 0;

        let err = HeapHeader::decode_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
