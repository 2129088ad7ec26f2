// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Crate-wide error taxonomy.
//!
//! Only the *recoverable* conditions from the spec's error taxonomy are
//! represented here (`IoError`, `LockError`, `FormatError`, `OutOfSpace`,
//! `SchemaError`). The two fatal conditions, out-of-memory and violated
//! program invariants (bad reference, out-of-range field index), are never
//! constructed as `Error` values: they abort the process or panic, exactly
//! as the original C implementation's `dpm_xmalloc` aborts on allocation
//! failure.

/// Errors that can occur while operating on a store.
#[derive(Debug)]
pub enum Error {
    /// Opening, reading, writing, or syncing the backing file failed.
    Io(std::io::Error),

    /// A writer handle could not acquire the exclusive file lock.
    Lock(std::path::PathBuf, std::io::Error),

    /// The file's magic number, format version, or header size didn't match.
    Format(String),

    /// The heap's backing file could not be grown any further.
    OutOfSpace,

    /// A dynamic value did not match an expected structural schema.
    Schema(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Lock(path, e) => write!(f, "Can't lock {}: {e}", path.display()),
            Self::Format(msg) => write!(f, "bad store format: {msg}"),
            Self::OutOfSpace => write!(f, "heap out of space"),
            Self::Schema(msg) => write!(f, "schema error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::Lock(_, e) => Some(e),
            Self::Format(_) | Self::OutOfSpace | Self::Schema(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Store result.
pub type Result<T> = std::result::Result<T, Error>;
