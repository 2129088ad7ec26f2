// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Small filesystem helpers: atomic file replacement and directory fsync,
//! used by [`crate::heap::gc`] to swap the compacted heap file into place.

use std::{fs::File, path::Path};

/// Atomically replaces the file at `path` with a copy of `source`, then
/// fsyncs the new file and its parent directory so the rename is durable.
pub fn rename_into_place(source_path: &Path, path: &Path) -> std::io::Result<()> {
    std::fs::rename(source_path, path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = File::open(path)?;
        file.sync_all()?;
        fsync_directory(parent_of(path))?;
    }

    Ok(())
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

/// Fsyncs a directory so a preceding rename within it is durable.
#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

/// No-op: a directory handle cannot be fsynced on Windows.
#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
