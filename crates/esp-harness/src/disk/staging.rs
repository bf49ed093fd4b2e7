// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The on-host copy of a boot medium's file tree.

use camino::Utf8Path;
use tracing::debug;

use super::{AssemblyError, BootImageSpec, TreeEntry};

/// Deletes `dir` and everything in it, then creates it again empty.
pub(super) fn recreate(dir: &Utf8Path) -> Result<(), AssemblyError> {
    if dir.exists() {
        debug!(%dir, "Removing previous staging directory");
        std::fs::remove_dir_all(dir)
            .map_err(AssemblyError::io("remove staging directory", dir))?;
    }

    std::fs::create_dir_all(dir)
        .map_err(AssemblyError::io("create staging directory", dir))
}

/// Writes every entry of `spec`'s tree under `dir`.
pub(super) fn materialize(
    dir: &Utf8Path,
    spec: &BootImageSpec,
) -> Result<(), AssemblyError> {
    for (rel, entry) in spec.entries() {
        let dest = dir.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(AssemblyError::io("create directory", parent))?;
        }

        match entry {
            TreeEntry::Copy(src) => {
                debug!(%src, %dest, "Staging file copy");
                std::fs::copy(src, &dest)
                    .map_err(AssemblyError::io("copy into staging tree", src))?;
            }
            TreeEntry::Contents(bytes) => {
                debug!(%dest, len = bytes.len(), "Staging generated file");
                std::fs::write(&dest, bytes)
                    .map_err(AssemblyError::io("write", &dest))?;
            }
        }
    }

    Ok(())
}
