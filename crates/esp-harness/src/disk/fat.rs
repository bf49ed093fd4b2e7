// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tools for formatting a raw image file with a FAT volume and filling it
//! with the contents of a staging directory.

use std::process::Command;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};
use newtype_derive::*;
use serde::Deserialize;
use tracing::debug;

use super::AssemblyError;

/// The size of a sector in this module's produced volumes.
const BYTES_PER_SECTOR: u16 = 512;

/// A number of allocation clusters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
struct Clusters(u64);

NewtypeAdd! { () struct Clusters(u64); }
NewtypeAddAssign! { () struct Clusters(u64); }

impl Clusters {
    /// Yields the number of clusters of `cluster_size` bytes needed to hold
    /// the supplied quantity of bytes.
    const fn needed_for_bytes(bytes: u64, cluster_size: u64) -> Self {
        Self(bytes.div_ceil(cluster_size))
    }
}

/// Counts the clusters the tree rooted at `dir` occupies, not counting the
/// root itself. Every subdirectory is assumed to fit in one cluster.
fn clusters_for_tree(
    dir: &Utf8Path,
    cluster_size: u64,
) -> Result<Clusters, AssemblyError> {
    let mut total = Clusters::default();
    let entries = dir
        .read_dir_utf8()
        .map_err(AssemblyError::io("read staging directory", dir))?;

    for entry in entries {
        let entry =
            entry.map_err(AssemblyError::io("read staging directory", dir))?;
        let meta = entry
            .metadata()
            .map_err(AssemblyError::io("stat", entry.path()))?;

        if meta.is_dir() {
            total += Clusters(1);
            total += clusters_for_tree(entry.path(), cluster_size)?;
        } else {
            total += Clusters::needed_for_bytes(meta.len(), cluster_size);
        }
    }

    Ok(total)
}

/// Checks that the staged tree under `staging` fits in the free space of
/// the freshly formatted volume in `image`.
pub(super) fn check_capacity(
    image: &Utf8Path,
    staging: &Utf8Path,
) -> Result<(), AssemblyError> {
    let fs = FileSystem::new(open_image(image)?, FsOptions::new())
        .map_err(AssemblyError::io("mount FAT volume in", image))?;
    let stats = fs
        .stats()
        .map_err(AssemblyError::io("read FAT volume statistics from", image))?;

    let cluster_size = u64::from(stats.cluster_size());
    let available = u64::from(stats.free_clusters()) * cluster_size;
    let needed = clusters_for_tree(staging, cluster_size)?.0 * cluster_size;
    debug!(needed, available, cluster_size, "Checked boot image capacity");

    if needed > available {
        Err(AssemblyError::NoSpace { needed, available })
    } else {
        Ok(())
    }
}

/// Converts `label` into the space-padded form stored in a FAT boot sector.
pub(crate) fn volume_label(label: &str) -> Result<[u8; 11], AssemblyError> {
    let invalid = || AssemblyError::InvalidLabel(label.to_owned());
    if label.is_empty()
        || label.len() > 11
        || !label.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
    {
        return Err(invalid());
    }

    let mut bytes = [b' '; 11];
    for (dst, src) in bytes.iter_mut().zip(label.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    Ok(bytes)
}

/// The tool used to create and fill FAT volumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatBackend {
    /// Format and populate the volume in-process.
    #[default]
    Fatfs,

    /// Shell out to `mformat` and `mcopy` from GNU mtools.
    Mtools,
}

impl FromStr for FatBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fatfs" => Ok(FatBackend::Fatfs),
            "mtools" => Ok(FatBackend::Mtools),
            _ => Err(format!("unknown FAT backend `{s}`")),
        }
    }
}

impl FatBackend {
    /// Writes an empty FAT file system over the raw image at `image`, using
    /// the whole file.
    pub(super) fn format(
        &self,
        image: &Utf8Path,
        label: &str,
    ) -> Result<(), AssemblyError> {
        let label = volume_label(label)?;
        match self {
            FatBackend::Fatfs => {
                let mut disk = open_image(image)?;
                fatfs::format_volume(
                    &mut disk,
                    FormatVolumeOptions::new()
                        .bytes_per_sector(BYTES_PER_SECTOR)
                        .volume_label(label),
                )
                .map_err(AssemblyError::io("format FAT volume on", image))
            }
            FatBackend::Mtools => {
                let label = String::from_utf8_lossy(&label);
                run_tool(
                    "mformat",
                    Command::new("mformat")
                        .arg("-i")
                        .arg(image)
                        .arg("-F")
                        .arg("-v")
                        .arg(label.trim_end())
                        .arg("::"),
                )
            }
        }
    }

    /// Recursively copies every entry under `staging` into the root of the
    /// FAT volume in `image`.
    pub(super) fn populate(
        &self,
        image: &Utf8Path,
        staging: &Utf8Path,
    ) -> Result<(), AssemblyError> {
        match self {
            FatBackend::Fatfs => {
                let disk = open_image(image)?;
                let fs = FileSystem::new(disk, FsOptions::new())
                    .map_err(AssemblyError::io("mount FAT volume in", image))?;
                copy_tree(&fs.root_dir(), staging)?;
                fs.unmount()
                    .map_err(AssemblyError::io("flush FAT volume in", image))
            }
            FatBackend::Mtools => {
                for entry in sorted_entries(staging)? {
                    run_tool(
                        "mcopy",
                        Command::new("mcopy")
                            .arg("-i")
                            .arg(image)
                            .arg("-s")
                            .arg(&entry)
                            .arg("::"),
                    )?;
                }
                Ok(())
            }
        }
    }
}

fn open_image(image: &Utf8Path) -> Result<std::fs::File, AssemblyError> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .map_err(AssemblyError::io("open", image))
}

/// Lists the entries of `dir` sorted by name, so images are populated in a
/// deterministic order.
fn sorted_entries(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, AssemblyError> {
    let mut entries = dir
        .read_dir_utf8()
        .map_err(AssemblyError::io("read staging directory", dir))?
        .map(|e| e.map(|e| e.into_path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(AssemblyError::io("read staging directory", dir))?;
    entries.sort();
    Ok(entries)
}

fn copy_tree(
    dest: &fatfs::Dir<'_, std::fs::File>,
    src: &Utf8Path,
) -> Result<(), AssemblyError> {
    for path in sorted_entries(src)? {
        let Some(name) = path.file_name() else {
            continue;
        };

        if path.is_dir() {
            let subdir = dest.create_dir(name).map_err(AssemblyError::io(
                "create directory in image for",
                &path,
            ))?;
            copy_tree(&subdir, &path)?;
        } else {
            let mut input = std::fs::File::open(&path)
                .map_err(AssemblyError::io("open", &path))?;
            let mut output = dest
                .create_file(name)
                .map_err(AssemblyError::io("create file in image for", &path))?;
            output
                .truncate()
                .map_err(AssemblyError::io("truncate image file for", &path))?;
            std::io::copy(&mut input, &mut output)
                .map_err(AssemblyError::io("copy into image", &path))?;
        }
    }

    Ok(())
}

fn run_tool(
    tool: &'static str,
    cmd: &mut Command,
) -> Result<(), AssemblyError> {
    debug!(tool, ?cmd, "Running FAT tool");
    let output = cmd
        .output()
        .map_err(|source| AssemblyError::ToolSpawn { tool, source })?;

    if output.status.success() {
        return Ok(());
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(AssemblyError::Tool { tool, status: output.status, output: text })
}
