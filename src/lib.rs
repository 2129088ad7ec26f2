// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A mmap-backed, single-writer heap of immutable typed records, with a
//! compacting garbage collector, a content-addressed string interning table,
//! and persistent dictionaries with strong, weak-key, and weak-set
//! reference semantics.
//!
//! This crate implements the object store underlying a Debian-style package
//! manager's database: a single file holds the entire heap, objects are
//! either fixed-length records of fields or immutable byte blobs, and a
//! 31-bit immediate integer shares the same word representation as a
//! reference so small integers never need to be boxed.
//!
//! ```
//! use dpm_store::{Dict, DictKind, Heap, HeapOpenMode, Table};
//!
//! # let dir = tempfile::tempdir()?;
//! # let path = dir.path().join("store.dpm");
//! let heap = Heap::open(&path, HeapOpenMode::Trunc)?;
//!
//! let table = Table::init(&heap, dpm_store::Ref::NIL);
//! let key = table.intern(b"origin")?;
//! let value = table.intern(b"debian")?;
//!
//! let dict = Dict::init(&heap, dpm_store::Ref::NIL, DictKind::Strong);
//! dict.set(key, value)?;
//!
//! let root = heap.alloc_record(0, &[table.finish()?, dict.finish()?])?;
//! heap.set_root(root)?;
//! heap.commit()?;
//! # Ok::<(), dpm_store::Error>(())
//! ```
//!
//! # Layers
//!
//! - [`word`] — the 32-bit heap word: immediate integer vs. reference.
//! - [`object`] — object headers, record/blob discrimination, field access.
//! - [`heap`] — the mmap-backed file, allocator, locking, commit/abort, GC.
//! - [`hash`] — the deterministic content hash placing HAMT leaves.
//! - [`hamt`] — the shared 16-way trie walk/insert/finish machinery.
//! - [`table`] — the interning table builder.
//! - [`dict`] — the STRONG / WEAK_KEYS / WEAK_SETS dictionary builder.
//! - [`context`] — the scoped `origin` dynamic variable.

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

pub mod coding;
pub mod context;
pub mod dict;
mod error;
pub mod fs;
pub mod hamt;
pub mod hash;
pub mod heap;
pub mod object;
pub mod table;
pub mod word;

pub use dict::{Dict, DictKind};
pub use error::{Error, Result};
pub use heap::{Heap, HeapOpenMode};
pub use table::Table;
pub use word::Ref;
