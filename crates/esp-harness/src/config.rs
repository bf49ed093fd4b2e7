// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for a harness run.
//!
//! A [`HarnessConfig`] is assembled once, before the pipeline starts, and
//! is never modified afterwards. It starts from built-in defaults, which an
//! optional TOML file can then override:
//!
//! ```toml
//! [firmware]
//! code-fd = "/opt/qemu/share/qemu/edk2-x86_64-code.fd"
//! vars-candidates = ["/opt/qemu/share/qemu/edk2-i386-vars.fd"]
//!
//! [image]
//! size-mib = 64
//! label = "ZAPBOOT"
//! backend = "mtools"
//! extra-files = [{ src = "assets/font.bin", dest = "font.bin" }]
//!
//! [emulator]
//! memory = "512M"
//! input-devices = ["keyboard", "tablet"]
//! output = "file"
//! extra-args = ["-serial", "stdio"]
//! ```
//!
//! Whatever reads ambient state (command-line flags, environment variables)
//! applies it on top of the result; nothing in this crate reads the process
//! environment.

use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

use crate::disk::{self, FatBackend};
use crate::firmware::{
    ResourceKind, ResourceSpec, DEFAULT_CODE_CANDIDATES, DEFAULT_MANIFESTS,
    DEFAULT_VARS_CANDIDATES,
};
use crate::launch::{
    InputDevice, DEFAULT_EMULATOR, DEFAULT_INPUT_DEVICES, DEFAULT_MACHINE,
    DEFAULT_MEMORY,
};
use crate::output_mode::OutputMode;

/// Errors which may be returned when reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file `{path}`")]
    Toml {
        path: Utf8PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("image size of {0} MiB is too large")]
    ImageTooLarge(u64),
}

/// A host file to place in the boot image in addition to the defaults.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraFile {
    /// The host file to copy.
    pub src: Utf8PathBuf,

    /// Where to put it, relative to the root of the boot image.
    pub dest: Utf8PathBuf,
}

impl FromStr for ExtraFile {
    type Err = String;

    /// Parses `SRC:DEST`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (src, dest) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected SRC:DEST, got `{s}`"))?;
        if src.is_empty() || dest.is_empty() {
            return Err(format!("expected SRC:DEST, got `{s}`"));
        }

        Ok(Self { src: src.into(), dest: dest.into() })
    }
}

/// Everything the pipeline needs to know about a run.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Directory holding the staging tree, the boot image, the variable
    /// store copy and emulator logs.
    pub work_dir: Utf8PathBuf,

    /// Overrides the search for the firmware code image.
    pub code_fd: Option<Utf8PathBuf>,

    /// Overrides the search for the variable store template.
    pub vars_fd_template: Option<Utf8PathBuf>,

    pub code_candidates: Vec<String>,
    pub vars_candidates: Vec<String>,
    pub manifests: Vec<Utf8PathBuf>,

    pub image_size_bytes: u64,
    pub fs_label: String,
    pub fat_backend: FatBackend,
    pub extra_files: Vec<ExtraFile>,

    pub emulator: Utf8PathBuf,
    pub machine: String,
    pub memory: String,
    pub input_devices: Vec<InputDevice>,
    pub output_mode: OutputMode,
    pub extra_emulator_args: Vec<String>,
}

impl HarnessConfig {
    /// Creates a configuration with the built-in defaults that keeps its
    /// files in `work_dir`.
    pub fn new(work_dir: impl Into<Utf8PathBuf>) -> Self {
        let strings = |list: &[&str]| -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        };

        Self {
            work_dir: work_dir.into(),
            code_fd: None,
            vars_fd_template: None,
            code_candidates: strings(DEFAULT_CODE_CANDIDATES),
            vars_candidates: strings(DEFAULT_VARS_CANDIDATES),
            manifests: DEFAULT_MANIFESTS
                .iter()
                .map(Utf8PathBuf::from)
                .collect(),
            image_size_bytes: disk::DEFAULT_IMAGE_SIZE_BYTES,
            fs_label: disk::DEFAULT_FS_LABEL.to_owned(),
            fat_backend: FatBackend::default(),
            extra_files: vec![],
            emulator: DEFAULT_EMULATOR.into(),
            machine: DEFAULT_MACHINE.to_owned(),
            memory: DEFAULT_MEMORY.to_owned(),
            input_devices: DEFAULT_INPUT_DEVICES.to_vec(),
            output_mode: OutputMode::default(),
            extra_emulator_args: vec![],
        }
    }

    /// Reads the TOML file at `path` and applies it on top of this
    /// configuration.
    pub fn with_file(self, path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Io { path: path.to_owned(), source }
        })?;
        let file: ConfigFile = toml::from_str(&contents).map_err(|source| {
            ConfigError::Toml { path: path.to_owned(), source }
        })?;

        self.with_overrides(file)
    }

    fn with_overrides(mut self, file: ConfigFile) -> Result<Self, ConfigError> {
        let ConfigFile { firmware, image, emulator } = file;

        if let Some(path) = firmware.code_fd {
            self.code_fd = Some(path);
        }
        if let Some(path) = firmware.vars_fd_template {
            self.vars_fd_template = Some(path);
        }
        if let Some(list) = firmware.code_candidates {
            self.code_candidates = list;
        }
        if let Some(list) = firmware.vars_candidates {
            self.vars_candidates = list;
        }
        if let Some(list) = firmware.manifests {
            self.manifests = list;
        }

        if let Some(mib) = image.size_mib {
            self.image_size_bytes = mib
                .checked_mul(1024 * 1024)
                .ok_or(ConfigError::ImageTooLarge(mib))?;
        }
        if let Some(label) = image.label {
            self.fs_label = label;
        }
        if let Some(backend) = image.backend {
            self.fat_backend = backend;
        }
        self.extra_files.extend(image.extra_files);

        if let Some(binary) = emulator.binary {
            self.emulator = binary;
        }
        if let Some(machine) = emulator.machine {
            self.machine = machine;
        }
        if let Some(memory) = emulator.memory {
            self.memory = memory;
        }
        if let Some(devices) = emulator.input_devices {
            self.input_devices = devices;
        }
        if let Some(output) = emulator.output {
            self.output_mode = output;
        }
        self.extra_emulator_args.extend(emulator.extra_args);

        Ok(self)
    }

    /// Describes where to look for the firmware code image.
    pub fn code_spec(&self) -> ResourceSpec {
        ResourceSpec {
            kind: ResourceKind::CodeFirmware,
            override_path: self.code_fd.clone(),
            candidates: self.code_candidates.clone(),
            manifests: vec![],
        }
    }

    /// Describes where to look for the variable store template.
    pub fn vars_spec(&self) -> ResourceSpec {
        ResourceSpec {
            kind: ResourceKind::VarsTemplate,
            override_path: self.vars_fd_template.clone(),
            candidates: self.vars_candidates.clone(),
            manifests: self.manifests.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    firmware: FirmwareSection,
    image: ImageSection,
    emulator: EmulatorSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct FirmwareSection {
    code_fd: Option<Utf8PathBuf>,
    vars_fd_template: Option<Utf8PathBuf>,
    code_candidates: Option<Vec<String>>,
    vars_candidates: Option<Vec<String>>,
    manifests: Option<Vec<Utf8PathBuf>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct ImageSection {
    size_mib: Option<u64>,
    label: Option<String>,
    backend: Option<FatBackend>,
    extra_files: Vec<ExtraFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct EmulatorSection {
    binary: Option<Utf8PathBuf>,
    machine: Option<String>,
    memory: Option<String>,
    input_devices: Option<Vec<InputDevice>>,
    output: Option<OutputMode>,
    extra_args: Vec<String>,
}
