// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routines for assembling the boot medium presented to the emulator.
//!
//! A boot medium is described by a [`BootImageSpec`]: the files that should
//! appear in its root file system, the size of the raw image and the FAT
//! volume label. [`ImageAssembler::build`] turns a spec into a raw disk
//! image in four strictly ordered steps:
//!
//! 1. The staging directory is deleted and recreated, and every entry in the
//!    spec is written into it.
//! 2. A raw file of exactly the requested size is allocated.
//! 3. The raw file is formatted with a FAT file system.
//! 4. The staging tree is copied into the new file system, after checking
//!    that it fits in the volume's free space.
//!
//! The image is built under a temporary name and only moved into place once
//! all of these steps succeed, so a failed build never leaves behind a file
//! that looks like a usable image.

use std::collections::BTreeMap;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub mod fat;
mod staging;

pub use fat::FatBackend;

/// The path, relative to the root of the boot medium, at which UEFI firmware
/// looks for a removable medium's boot application.
pub const BOOT_APPLICATION_PATH: &str = "EFI/BOOT/BOOTX64.EFI";

/// Contents of the UEFI shell startup script. The shell runs this if the
/// firmware drops into it instead of booting the application directly.
pub const STARTUP_SCRIPT: &[u8] = b"\\EFI\\BOOT\\BOOTX64.EFI\r\n";

/// A fixture file that boot applications can read back to check that they
/// can see the boot medium's file system.
pub const HELLO_FILE: (&str, &[u8]) =
    ("hello.txt", b"Hello from the filesystem!");

pub const DEFAULT_IMAGE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

pub const DEFAULT_FS_LABEL: &str = "ESP";

/// Errors that can arise while assembling a boot image.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("`{0}` is not a valid path inside the boot image")]
    InvalidPath(Utf8PathBuf),

    #[error("`{0}` is not a valid FAT volume label")]
    InvalidLabel(String),

    #[error(
        "boot image contents need {needed} bytes but the image only has room \
         for {available}"
    )]
    NoSpace { needed: u64, available: u64 },

    #[error("failed to {action} `{path}`")]
    Io {
        action: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run `{tool}`")]
    ToolSpawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("`{tool}` failed ({status}):\n{output}")]
    Tool {
        tool: &'static str,
        status: std::process::ExitStatus,
        output: String,
    },
}

impl AssemblyError {
    pub(crate) fn io(
        action: &'static str,
        path: impl Into<Utf8PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| AssemblyError::Io { action, path, source }
    }
}

/// One file in a boot image's root tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeEntry {
    /// Copy the file at this host path verbatim.
    Copy(Utf8PathBuf),

    /// Write these bytes.
    Contents(Vec<u8>),
}

/// Describes the contents and geometry of a boot image.
#[derive(Clone, Debug)]
pub struct BootImageSpec {
    root_tree: BTreeMap<Utf8PathBuf, TreeEntry>,
    size_bytes: u64,
    fs_label: String,
}

impl BootImageSpec {
    /// Creates a spec for an empty image.
    pub fn new(
        size_bytes: u64,
        fs_label: impl Into<String>,
    ) -> Result<Self, AssemblyError> {
        let fs_label = fs_label.into();
        fat::volume_label(&fs_label)?;
        Ok(Self { root_tree: BTreeMap::new(), size_bytes, fs_label })
    }

    /// Creates a spec for a removable boot medium that auto-boots the UEFI
    /// application at `application`.
    ///
    /// The application is placed at [`BOOT_APPLICATION_PATH`], next to a
    /// shell startup script that launches it and the [`HELLO_FILE`]
    /// fixture.
    pub fn for_application(
        application: &Utf8Path,
        size_bytes: u64,
        fs_label: impl Into<String>,
    ) -> Result<Self, AssemblyError> {
        let mut spec = Self::new(size_bytes, fs_label)?;
        spec.add_copy(BOOT_APPLICATION_PATH, application)?;
        spec.add_contents("startup.nsh", STARTUP_SCRIPT)?;
        spec.add_contents(HELLO_FILE.0, HELLO_FILE.1)?;
        Ok(spec)
    }

    /// Adds a verbatim copy of the host file `src` at `dest`, replacing any
    /// existing entry at that path.
    ///
    /// N.B. `dest` is interpreted relative to the root of the file system and
    ///      must not have a leading '/'.
    pub fn add_copy(
        &mut self,
        dest: impl Into<Utf8PathBuf>,
        src: impl Into<Utf8PathBuf>,
    ) -> Result<(), AssemblyError> {
        self.insert(dest.into(), TreeEntry::Copy(src.into()))
    }

    /// Adds a file containing `contents` at `dest`.
    pub fn add_contents(
        &mut self,
        dest: impl Into<Utf8PathBuf>,
        contents: impl Into<Vec<u8>>,
    ) -> Result<(), AssemblyError> {
        self.insert(dest.into(), TreeEntry::Contents(contents.into()))
    }

    fn insert(
        &mut self,
        dest: Utf8PathBuf,
        entry: TreeEntry,
    ) -> Result<(), AssemblyError> {
        let valid = dest.components().next().is_some()
            && dest.components().all(|c| {
                matches!(c, Utf8Component::Normal(name) if !name.is_empty())
            });
        if !valid {
            return Err(AssemblyError::InvalidPath(dest));
        }

        if self.root_tree.keys().any(|existing| conflicts(existing, &dest)) {
            return Err(AssemblyError::InvalidPath(dest));
        }

        self.root_tree.insert(dest, entry);
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Utf8Path, &TreeEntry)> {
        self.root_tree.iter().map(|(k, v)| (k.as_path(), v))
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn fs_label(&self) -> &str {
        &self.fs_label
    }
}

/// Returns true if `a` and `b` cannot both appear in a FAT file system as
/// distinct entries.
///
/// FAT names are case-insensitive: every component the two paths share must
/// be spelled identically. A path that is a strict prefix of the other would
/// have to be both a file and a directory. Identical paths do not conflict;
/// the later entry replaces the earlier.
fn conflicts(a: &Utf8Path, b: &Utf8Path) -> bool {
    if a == b {
        return false;
    }

    let mut a_parts = a.components();
    let mut b_parts = b.components();
    loop {
        match (a_parts.next(), b_parts.next()) {
            (Some(x), Some(y)) => {
                let (x, y) = (x.as_str(), y.as_str());
                if x.to_uppercase() != y.to_uppercase() {
                    return false;
                }
                if x != y {
                    return true;
                }
            }
            // One path is a strict prefix of the other.
            _ => return true,
        }
    }
}

/// Builds boot images in a work directory.
#[derive(Clone, Debug)]
pub struct ImageAssembler {
    work_dir: Utf8PathBuf,
    backend: FatBackend,
}

impl ImageAssembler {
    pub fn new(work_dir: impl Into<Utf8PathBuf>, backend: FatBackend) -> Self {
        Self { work_dir: work_dir.into(), backend }
    }

    /// The directory in which the boot medium's tree is staged.
    pub fn staging_dir(&self) -> Utf8PathBuf {
        self.work_dir.join("esp")
    }

    /// The path at which a successfully built image is placed.
    pub fn image_path(&self) -> Utf8PathBuf {
        self.work_dir.join("esp.img")
    }

    fn partial_image_path(&self) -> Utf8PathBuf {
        self.work_dir.join("esp.img.partial")
    }

    /// Builds the image described by `spec` and returns its path.
    pub fn build(
        &self,
        spec: &BootImageSpec,
    ) -> Result<Utf8PathBuf, AssemblyError> {
        let image = self.image_path();
        let partial = self.partial_image_path();

        // Whatever is left over from an earlier run is stale.
        for stale in [&image, &partial] {
            if stale.exists() {
                std::fs::remove_file(stale)
                    .map_err(AssemblyError::io("remove stale image", stale))?;
            }
        }

        let staging = self.staging_dir();
        staging::recreate(&staging)?;
        staging::materialize(&staging, spec)?;

        if let Err(e) = self.package(&staging, &partial, spec) {
            if let Err(rm) = std::fs::remove_file(&partial) {
                warn!(%partial, %rm, "failed to remove partial boot image");
            }
            return Err(e);
        }

        std::fs::rename(&partial, &image)
            .map_err(AssemblyError::io("move boot image into place", &image))?;

        info!(%image, size_bytes = spec.size_bytes, "Assembled boot image");
        Ok(image)
    }

    fn package(
        &self,
        staging: &Utf8Path,
        image: &Utf8Path,
        spec: &BootImageSpec,
    ) -> Result<(), AssemblyError> {
        info!(%image, size_bytes = spec.size_bytes, "Allocating raw image");
        let file = std::fs::File::create(image)
            .map_err(AssemblyError::io("create", image))?;
        file.set_len(spec.size_bytes)
            .map_err(AssemblyError::io("allocate", image))?;
        drop(file);

        info!(%image, backend = ?self.backend, "Formatting FAT volume");
        self.backend.format(image, &spec.fs_label)?;
        fat::check_capacity(image, staging)?;

        info!(%image, %staging, "Copying staging tree into image");
        self.backend.populate(image, staging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_spec_has_boot_layout() {
        let spec = BootImageSpec::for_application(
            Utf8Path::new("/build/zap.efi"),
            DEFAULT_IMAGE_SIZE_BYTES,
            DEFAULT_FS_LABEL,
        )
        .unwrap();

        let entries: Vec<_> = spec.entries().collect();
        assert_eq!(entries.len(), 3);
        assert!(entries.contains(&(
            Utf8Path::new("EFI/BOOT/BOOTX64.EFI"),
            &TreeEntry::Copy("/build/zap.efi".into())
        )));
        assert!(entries.contains(&(
            Utf8Path::new("startup.nsh"),
            &TreeEntry::Contents(b"\\EFI\\BOOT\\BOOTX64.EFI\r\n".to_vec())
        )));
    }

    #[test]
    fn paths_must_be_relative_and_normal() {
        let mut spec = BootImageSpec::new(1 << 20, "ESP").unwrap();
        for bad in ["/EFI/BOOT/x.efi", "../x", "EFI/../x", "", "./x"] {
            assert!(
                matches!(
                    spec.add_contents(bad, "x"),
                    Err(AssemblyError::InvalidPath(_))
                ),
                "{bad} should be rejected"
            );
        }

        spec.add_contents("EFI/BOOT/x.efi", "x").unwrap();
    }

    #[test]
    fn files_cannot_shadow_directories() {
        let mut spec = BootImageSpec::new(1 << 20, "ESP").unwrap();
        spec.add_contents("EFI/BOOT/x.efi", "x").unwrap();
        assert!(spec.add_contents("EFI/BOOT", "x").is_err());
        assert!(spec.add_contents("EFI/BOOT/x.efi/y", "x").is_err());

        // Replacing an entry at the same path is fine.
        spec.add_contents("EFI/BOOT/x.efi", "y").unwrap();
        assert_eq!(spec.entries().count(), 1);
    }

    #[test]
    fn names_differing_only_in_case_collide() {
        let mut spec = BootImageSpec::new(1 << 20, "ESP").unwrap();
        spec.add_contents("notes.txt", "first").unwrap();
        spec.add_contents("EFI/BOOT/x.efi", "x").unwrap();

        for bad in ["NOTES.TXT", "Notes.txt", "efi/BOOT/y.efi", "EFI/boot"] {
            assert!(
                matches!(
                    spec.add_contents(bad, "second"),
                    Err(AssemblyError::InvalidPath(_))
                ),
                "{bad} should be rejected"
            );
        }

        spec.add_contents("EFI/BOOT/y.efi", "y").unwrap();
        spec.add_contents("notes.txt.bak", "z").unwrap();
        assert_eq!(spec.entries().count(), 4);
    }

    #[test]
    fn overlong_labels_are_rejected() {
        assert!(matches!(
            BootImageSpec::new(1 << 20, "WAY TOO LONG LABEL"),
            Err(AssemblyError::InvalidLabel(_))
        ));
    }

    #[test]
    fn mtools_build_without_mformat_leaves_no_image() {
        let tmp = tempfile::tempdir().unwrap();
        let work = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let mut spec = BootImageSpec::new(64 << 20, "ESP").unwrap();
        spec.add_contents("hello.txt", "hi").unwrap();

        let assembler = ImageAssembler::new(&work, FatBackend::Mtools);
        let have_mformat =
            std::process::Command::new("mformat").arg("--version").output();
        let result = assembler.build(&spec);

        if have_mformat.is_err() {
            assert!(matches!(
                result,
                Err(AssemblyError::ToolSpawn { tool: "mformat", .. })
            ));
            assert!(!assembler.image_path().exists());
            assert!(!assembler.partial_image_path().exists());
        } else {
            let image = result.unwrap();
            assert_eq!(image, assembler.image_path());
            assert!(!assembler.partial_image_path().exists());
            assert_eq!(std::fs::metadata(&image).unwrap().len(), 64 << 20);
        }
    }
}
