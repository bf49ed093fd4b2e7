// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-run copies of the firmware variable store.
//!
//! The firmware writes boot entries and other variables back to its
//! variable store, so the emulator is never handed the canonical template
//! directly. Instead each run gets a private, writable copy.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::firmware::ResolvedResource;

/// The name of the working copy inside the harness work directory.
pub const VARS_COPY_NAME: &str = "edk2_vars.fd";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to copy variable store template `{template}` to `{copy}`")]
    Copy {
        template: Utf8PathBuf,
        copy: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to make variable store copy `{path}` writable")]
    Permissions {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Creates the writable variable store used by the emulator.
#[derive(Clone, Debug)]
pub struct NvramProvisioner {
    work_dir: Utf8PathBuf,
}

impl NvramProvisioner {
    pub fn new(work_dir: impl Into<Utf8PathBuf>) -> Self {
        Self { work_dir: work_dir.into() }
    }

    /// The path at which the working copy is created.
    pub fn copy_path(&self) -> Utf8PathBuf {
        self.work_dir.join(VARS_COPY_NAME)
    }

    /// Copies `template` to the working copy location and returns the copy's
    /// path. Returns `Ok(None)` if there is no template, in which case the
    /// emulator runs without persistent variables.
    pub fn provision(
        &self,
        template: Option<&ResolvedResource>,
    ) -> Result<Option<Utf8PathBuf>, ProvisionError> {
        let Some(template) = template else {
            info!("No variable store template, skipping NVRAM provisioning");
            return Ok(None);
        };

        let template = template.path();
        let copy = self.copy_path();
        info!(%template, %copy, "Copying variable store template");

        let copy_err = |source| ProvisionError::Copy {
            template: template.to_path_buf(),
            copy: copy.clone(),
            source,
        };

        // The previous run's copy may be read-only if it was never made
        // writable.
        if copy.exists() {
            std::fs::remove_file(&copy).map_err(copy_err)?;
        }
        std::fs::copy(template, &copy).map_err(copy_err)?;

        make_writable(&copy)?;
        Ok(Some(copy))
    }
}

/// Makes sure the owner can write `path`. Templates installed by a package
/// manager are usually read-only, and `std::fs::copy` carries that over.
fn make_writable(path: &Utf8Path) -> Result<(), ProvisionError> {
    let perm_err = |source| ProvisionError::Permissions {
        path: path.to_path_buf(),
        source,
    };

    let file = std::fs::File::open(path).map_err(perm_err)?;
    let mut permissions = file.metadata().map_err(perm_err)?.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o200);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);

    file.set_permissions(permissions).map_err(perm_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{self, ResourceKind, ResourceSpec};

    fn template_in(root: &Utf8Path, contents: &[u8]) -> ResolvedResource {
        let path = root.join("edk2-i386-vars.fd");
        std::fs::write(&path, contents).unwrap();
        let mut spec = ResourceSpec::vars_template(Some(path));
        spec.candidates.clear();
        spec.manifests.clear();
        let resolved = firmware::resolve(&spec).unwrap();
        assert_eq!(resolved.kind(), ResourceKind::VarsTemplate);
        resolved
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn no_template_means_no_copy() {
        let (_dir, root) = scratch();
        let provisioner = NvramProvisioner::new(&root);
        assert_eq!(provisioner.provision(None).unwrap(), None);
        assert!(!provisioner.copy_path().exists());
    }

    #[test]
    fn copy_matches_template_and_is_independent() {
        let (_dir, root) = scratch();
        let contents: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let template = template_in(&root, &contents);

        let work = root.join("work");
        std::fs::create_dir_all(&work).unwrap();
        let copy = NvramProvisioner::new(&work)
            .provision(Some(&template))
            .unwrap()
            .unwrap();

        assert_ne!(copy, template.path());
        assert_eq!(std::fs::read(&copy).unwrap(), contents);

        std::fs::write(&copy, b"mutated by firmware").unwrap();
        assert_eq!(std::fs::read(template.path()).unwrap(), contents);
    }

    #[cfg(unix)]
    #[test]
    fn read_only_template_yields_writable_copy() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, root) = scratch();
        let template = template_in(&root, b"vars");
        std::fs::set_permissions(
            template.path(),
            std::fs::Permissions::from_mode(0o444),
        )
        .unwrap();

        let work = root.join("work");
        std::fs::create_dir_all(&work).unwrap();
        let provisioner = NvramProvisioner::new(&work);

        // Provision twice to make sure a leftover copy doesn't get in the way.
        provisioner.provision(Some(&template)).unwrap();
        let copy = provisioner.provision(Some(&template)).unwrap().unwrap();

        let mode = std::fs::metadata(&copy).unwrap().permissions().mode();
        assert_ne!(mode & 0o200, 0);
        assert_eq!(std::fs::read(&copy).unwrap(), b"vars");
    }
}
