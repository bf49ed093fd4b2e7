// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequencing of the harness stages.
//!
//! A run resolves the firmware images, then assembles the boot image and
//! provisions the variable store (concurrently, since neither depends on
//! the other), then launches the emulator. A missing firmware code image
//! stops the run before anything is written to disk; a missing variable
//! store template only means the firmware runs without persistent
//! variables.

use std::process::ExitStatus;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::disk::{AssemblyError, BootImageSpec, ImageAssembler};
use crate::firmware::{self, ResolveError, ResolvedResource};
use crate::launch::{self, LaunchConfig, LaunchError};
use crate::nvram::{NvramProvisioner, ProvisionError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("required firmware is missing")]
    FatalResourceMissing(#[source] ResolveError),

    #[error("failed to create work directory `{path}`")]
    WorkDir {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to assemble the boot image")]
    Assembly(#[from] AssemblyError),

    #[error("failed to provision the variable store")]
    Provision(#[from] ProvisionError),

    #[error("failed to launch the emulator")]
    Launch(#[from] LaunchError),
}

/// The firmware images found on this host.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub code_firmware: ResolvedResource,

    /// `None` if no variable store template could be found.
    pub vars_template: Option<ResolvedResource>,
}

/// Everything produced ahead of starting the emulator.
#[derive(Clone, Debug)]
pub struct PreparedRun {
    pub resolution: Resolution,
    pub boot_image: Utf8PathBuf,
    pub vars_copy: Option<Utf8PathBuf>,
    pub launch_config: LaunchConfig,
}

/// Drives a harness run with a fixed configuration.
#[derive(Clone, Debug)]
pub struct Pipeline {
    config: HarnessConfig,
}

impl Pipeline {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn assembler(&self) -> ImageAssembler {
        ImageAssembler::new(&self.config.work_dir, self.config.fat_backend)
    }

    fn provisioner(&self) -> NvramProvisioner {
        NvramProvisioner::new(&self.config.work_dir)
    }

    /// Locates both firmware images. Failing to find the code image is
    /// fatal; failing to find the variable store template is not.
    pub fn resolve(&self) -> Result<Resolution, PipelineError> {
        let code_firmware = firmware::resolve(&self.config.code_spec())
            .map_err(PipelineError::FatalResourceMissing)?;

        let vars_template = match firmware::resolve(&self.config.vars_spec()) {
            Ok(template) => Some(template),
            Err(e) => {
                warn!(error = %e, "proceeding without persistent NVRAM");
                None
            }
        };

        Ok(Resolution { code_firmware, vars_template })
    }

    /// Describes the boot medium for `application`: the default tree plus
    /// any configured extra files.
    pub fn boot_image_spec(
        &self,
        application: &Utf8Path,
    ) -> Result<BootImageSpec, AssemblyError> {
        let mut spec = BootImageSpec::for_application(
            application,
            self.config.image_size_bytes,
            &self.config.fs_label,
        )?;
        for extra in &self.config.extra_files {
            spec.add_copy(&extra.dest, &extra.src)?;
        }

        Ok(spec)
    }

    /// Assembles the boot medium for `application` without resolving
    /// firmware or launching anything.
    pub fn assemble(
        &self,
        application: &Utf8Path,
    ) -> Result<Utf8PathBuf, PipelineError> {
        let spec = self.boot_image_spec(application)?;
        self.create_work_dir()?;
        Ok(self.assembler().build(&spec)?)
    }

    /// Runs every stage short of launching the emulator.
    pub fn prepare(
        &self,
        application: &Utf8Path,
    ) -> Result<PreparedRun, PipelineError> {
        let resolution = self.resolve()?;
        self.prepare_with(resolution, application)
    }

    /// Like [`Pipeline::prepare`], but with firmware that has already been
    /// resolved. Callers that must do expensive work between resolving and
    /// assembling (such as building `application`) resolve first and pass
    /// the result here.
    pub fn prepare_with(
        &self,
        resolution: Resolution,
        application: &Utf8Path,
    ) -> Result<PreparedRun, PipelineError> {
        let spec = self.boot_image_spec(application)?;
        self.create_work_dir()?;

        let assembler = self.assembler();
        let provisioner = self.provisioner();
        let (boot_image, vars_copy) = std::thread::scope(|s| {
            let vars = s.spawn(|| {
                provisioner.provision(resolution.vars_template.as_ref())
            });
            let image = assembler.build(&spec);
            let vars = vars
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (image, vars)
        });
        let boot_image = boot_image?;
        let vars_copy = vars_copy?;

        let launch_config = LaunchConfig::new(
            &resolution.code_firmware,
            vars_copy.clone(),
            &boot_image,
        )?
        .with_emulator(&self.config.emulator)
        .with_machine_profile(&self.config.machine)
        .with_memory_size(&self.config.memory)
        .with_devices(self.config.input_devices.clone())
        .with_extra_args(self.config.extra_emulator_args.clone());

        Ok(PreparedRun { resolution, boot_image, vars_copy, launch_config })
    }

    /// Starts the emulator for a prepared run and waits for it to exit.
    pub fn launch(
        &self,
        prepared: &PreparedRun,
    ) -> Result<ExitStatus, PipelineError> {
        Ok(launch::launch(
            &prepared.launch_config,
            self.config.output_mode,
            &self.config.work_dir,
        )?)
    }

    /// Runs the whole pipeline for `application` and returns the emulator's
    /// exit status.
    pub fn run(
        &self,
        application: &Utf8Path,
    ) -> Result<ExitStatus, PipelineError> {
        let prepared = self.prepare(application)?;
        info!(
            boot_image = %prepared.boot_image,
            nvram = prepared.vars_copy.is_some(),
            "Run prepared"
        );
        self.launch(&prepared)
    }

    fn create_work_dir(&self) -> Result<(), PipelineError> {
        let path = &self.config.work_dir;
        std::fs::create_dir_all(path).map_err(|source| {
            PipelineError::WorkDir { path: path.clone(), source }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{ResourceKind, ResourceSource};

    struct Host {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Host {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
            Self { _dir: dir, root }
        }

        fn file(&self, rel: &str, contents: &[u8]) -> Utf8PathBuf {
            let path = self.root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, contents).unwrap();
            path
        }

        /// A configuration that searches only inside this host.
        fn config(&self) -> HarnessConfig {
            let mut config = HarnessConfig::new(self.root.join("work"));
            config.code_candidates =
                vec![self.root.join("share/code.fd").into_string()];
            config.vars_candidates =
                vec![self.root.join("share/vars.fd").into_string()];
            config.manifests = vec![];
            config.image_size_bytes = 8 * 1024 * 1024;
            config
        }
    }

    #[test]
    fn missing_code_firmware_is_fatal_and_writes_nothing() {
        let host = Host::new();
        let app = host.file("app.efi", b"MZ");
        let pipeline = Pipeline::new(host.config());

        assert!(matches!(
            pipeline.prepare(&app),
            Err(PipelineError::FatalResourceMissing(ResolveError::NotFound {
                kind: ResourceKind::CodeFirmware
            }))
        ));
        assert!(!host.root.join("work").exists());
    }

    #[test]
    fn missing_template_degrades() {
        let host = Host::new();
        host.file("share/code.fd", b"code");
        let resolution = Pipeline::new(host.config()).resolve().unwrap();

        assert_eq!(
            resolution.code_firmware.source(),
            ResourceSource::DirectMatch
        );
        assert!(resolution.vars_template.is_none());
    }

    #[test]
    fn prepare_produces_image_and_vars_copy() {
        let host = Host::new();
        host.file("share/code.fd", b"code");
        host.file("share/vars.fd", b"vars");
        let app = host.file("app.efi", b"MZ application");

        let mut config = host.config();
        config.memory = "256M".into();
        let prepared = Pipeline::new(config).prepare(&app).unwrap();

        assert!(prepared.boot_image.is_file());
        assert_eq!(
            std::fs::metadata(&prepared.boot_image).unwrap().len(),
            8 * 1024 * 1024
        );
        let copy = prepared.vars_copy.as_deref().unwrap();
        assert_eq!(std::fs::read(copy).unwrap(), b"vars");
        assert_eq!(prepared.launch_config.vars_copy(), Some(copy));
        assert!(prepared
            .launch_config
            .args()
            .contains(&std::ffi::OsString::from("256M")));
    }

    #[test]
    fn firmware_resolves_before_the_application_exists() {
        let host = Host::new();
        let code = host.file("share/code.fd", b"code");
        let pipeline = Pipeline::new(host.config());

        let resolution = pipeline.resolve().unwrap();
        assert!(!host.root.join("work").exists());

        let app = host.file("app.efi", b"MZ built later");
        let prepared = pipeline.prepare_with(resolution, &app).unwrap();
        assert_eq!(prepared.resolution.code_firmware.path(), code);
        assert!(prepared.vars_copy.is_none());
        assert!(prepared.boot_image.is_file());
    }

    #[test]
    fn bad_extra_file_fails_before_touching_disk() {
        let host = Host::new();
        host.file("share/code.fd", b"code");
        let app = host.file("app.efi", b"MZ");

        let mut config = host.config();
        config.extra_files.push(crate::config::ExtraFile {
            src: app.clone(),
            dest: "../escape.efi".into(),
        });

        assert!(matches!(
            Pipeline::new(config).prepare(&app),
            Err(PipelineError::Assembly(AssemblyError::InvalidPath(_)))
        ));
        assert!(!host.root.join("work").exists());
    }
}
