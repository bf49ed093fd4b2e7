// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line options shared by every subcommand that drives the harness.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use esp_harness::disk::FatBackend;
use esp_harness::launch::InputDevice;
use esp_harness::{ExtraFile, HarnessConfig, OutputMode};

use crate::util::{self, cargo_log};

#[derive(Debug, Clone, clap::Parser)]
#[command(next_help_heading = "Harness Configuration")]
pub(crate) struct HarnessArgs {
    /// A TOML file whose settings replace the built-in defaults. Options
    /// given on the command line take precedence over the file.
    #[clap(long, value_hint = clap::ValueHint::FilePath)]
    config: Option<Utf8PathBuf>,

    /// The directory in which to stage the boot medium and keep the
    /// variable store copy.
    ///
    /// Defaults to `esp-harness` in Cargo's target directory.
    #[clap(long, value_hint = clap::ValueHint::DirPath)]
    work_dir: Option<Utf8PathBuf>,

    #[clap(flatten)]
    firmware: FirmwareArgs,

    /// The size of the boot image, in MiB.
    #[clap(long)]
    image_size_mib: Option<u64>,

    /// The FAT volume label of the boot image.
    #[clap(long)]
    label: Option<String>,

    /// How to format and fill the boot image: `fatfs` (in-process) or
    /// `mtools` (`mformat` and `mcopy`).
    #[clap(long)]
    fat_backend: Option<FatBackend>,

    /// An extra file to put in the boot image, as `SRC:DEST`. DEST is
    /// relative to the root of the image. May be repeated.
    #[clap(long = "extra-file", value_name = "SRC:DEST")]
    extra_files: Vec<ExtraFile>,
}

#[derive(Debug, Clone, clap::Parser)]
#[command(next_help_heading = "Firmware Selection")]
pub(crate) struct FirmwareArgs {
    /// The edk2 firmware code image to use instead of searching for one.
    #[clap(long, env = "CODE_FD", value_hint = clap::ValueHint::FilePath)]
    code_fd: Option<Utf8PathBuf>,

    /// The variable store template to use instead of searching for one.
    #[clap(
        long,
        env = "VARS_FD_TEMPLATE",
        value_hint = clap::ValueHint::FilePath
    )]
    vars_fd_template: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, clap::Parser)]
#[command(next_help_heading = "Emulator Options")]
pub(crate) struct EmulatorArgs {
    /// The QEMU binary to run.
    #[clap(long, value_hint = clap::ValueHint::CommandName)]
    emulator: Option<Utf8PathBuf>,

    /// The machine type passed to `-machine`.
    #[clap(long)]
    machine: Option<String>,

    /// The guest memory size passed to `-m`.
    #[clap(long)]
    memory: Option<String>,

    /// A USB input device to attach (`keyboard`, `mouse` or `tablet`).
    /// May be repeated; replaces the default keyboard and mouse.
    #[clap(long = "device", value_name = "DEVICE")]
    devices: Vec<InputDevice>,

    /// Where to send QEMU's stdout and stderr: `stdio`, `file` (log files
    /// in the work directory) or `null`.
    #[clap(long)]
    output: Option<OutputMode>,

    /// Extra arguments appended to the QEMU command line.
    #[clap(last = true)]
    qemu_args: Vec<String>,
}

impl HarnessArgs {
    /// Layers these options over the defaults and the configuration file,
    /// if any.
    pub(crate) fn into_config(self) -> Result<HarnessConfig> {
        let work_dir = match self.work_dir {
            Some(dir) => dir,
            None => util::default_work_dir()?,
        };

        let mut config = HarnessConfig::new(work_dir);
        if let Some(path) = &self.config {
            cargo_log!("Loading", "harness config `{path}`");
            config = config
                .with_file(path)
                .with_context(|| format!("Failed to load `{path}`"))?;
        }

        self.firmware.apply(&mut config);
        if let Some(mib) = self.image_size_mib {
            config.image_size_bytes =
                mib.checked_mul(1024 * 1024).with_context(|| {
                    format!("Image size of {mib} MiB is too large")
                })?;
        }
        if let Some(label) = self.label {
            config.fs_label = label;
        }
        if let Some(backend) = self.fat_backend {
            config.fat_backend = backend;
        }
        config.extra_files.extend(self.extra_files);

        Ok(config)
    }
}

impl FirmwareArgs {
    pub(crate) fn apply(self, config: &mut HarnessConfig) {
        if let Some(path) = self.code_fd {
            config.code_fd = Some(path);
        }
        if let Some(path) = self.vars_fd_template {
            config.vars_fd_template = Some(path);
        }
    }
}

impl EmulatorArgs {
    pub(crate) fn apply(self, config: &mut HarnessConfig) {
        if let Some(emulator) = self.emulator {
            config.emulator = emulator;
        }
        if let Some(machine) = self.machine {
            config.machine = machine;
        }
        if let Some(memory) = self.memory {
            config.memory = memory;
        }
        if !self.devices.is_empty() {
            config.input_devices = self.devices;
        }
        if let Some(output) = self.output {
            config.output_mode = output;
        }
        config.extra_emulator_args.extend(self.qemu_args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[clap(flatten)]
        harness: HarnessArgs,
        #[clap(flatten)]
        emulator: EmulatorArgs,
    }

    fn config_from(args: &[&str]) -> HarnessConfig {
        let parsed = Harness::parse_from(
            ["xtask", "--work-dir", "scratch"].iter().chain(args),
        );
        let mut config = parsed.harness.into_config().unwrap();
        parsed.emulator.apply(&mut config);
        config
    }

    #[test]
    fn flags_override_defaults() {
        let config = config_from(&[
            "--code-fd",
            "/fw/code.fd",
            "--image-size-mib",
            "32",
            "--fat-backend",
            "mtools",
            "--extra-file",
            "font.bin:zap/font.bin",
            "--device",
            "tablet",
            "--output",
            "null",
            "--",
            "-serial",
            "stdio",
        ]);

        assert_eq!(config.work_dir, "scratch");
        assert_eq!(config.code_fd, Some("/fw/code.fd".into()));
        assert_eq!(config.image_size_bytes, 32 * 1024 * 1024);
        assert_eq!(config.fat_backend, FatBackend::Mtools);
        assert_eq!(config.extra_files.len(), 1);
        assert_eq!(config.input_devices, vec![InputDevice::Tablet]);
        assert_eq!(config.output_mode, OutputMode::Null);
        assert_eq!(config.extra_emulator_args, vec!["-serial", "stdio"]);
    }

    #[test]
    fn flags_take_precedence_over_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::try_from(tmp.path().join("harness.toml")).unwrap();
        std::fs::write(
            &path,
            "[image]\nlabel = \"FROMFILE\"\nsize-mib = 8\n\n\
             [emulator]\nmemory = \"1G\"\n",
        )
        .unwrap();

        let config =
            config_from(&["--config", path.as_str(), "--label", "FLAG"]);
        assert_eq!(config.fs_label, "FLAG");
        assert_eq!(config.image_size_bytes, 8 * 1024 * 1024);
        assert_eq!(config.memory, "1G");
    }
}
