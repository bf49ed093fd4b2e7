// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routines and data structures for launching the emulator.

use std::ffi::OsString;
use std::process::{Command, ExitStatus};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::firmware::{ResolvedResource, ResourceKind};
use crate::output_mode::OutputMode;

pub const DEFAULT_EMULATOR: &str = "qemu-system-x86_64";
pub const DEFAULT_MACHINE: &str = "q35";
pub const DEFAULT_MEMORY: &str = "128M";

/// The name under which the emulator's output is logged.
pub const LOG_NAME: &str = "emulator";

/// The ID of the USB controller that every input device and the boot
/// medium hang off.
const CONTROLLER_ID: &str = "xhci";

/// The drive ID of the boot medium's backing image.
const BOOT_DRIVE_ID: &str = "esp";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch requires a firmware code image, got a {0}")]
    NotCodeFirmware(ResourceKind),

    #[error("failed to open emulator log files in `{dir}`")]
    OutputFiles {
        dir: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start emulator `{emulator}`")]
    Spawn {
        emulator: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Human-interface devices attached to the emulated USB controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputDevice {
    Keyboard,
    Mouse,
    Tablet,
}

impl std::str::FromStr for InputDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyboard" | "kbd" => Ok(InputDevice::Keyboard),
            "mouse" => Ok(InputDevice::Mouse),
            "tablet" => Ok(InputDevice::Tablet),
            _ => Err(format!("unknown input device `{s}`")),
        }
    }
}

impl InputDevice {
    fn driver(&self) -> &'static str {
        match self {
            InputDevice::Keyboard => "usb-kbd",
            InputDevice::Mouse => "usb-mouse",
            InputDevice::Tablet => "usb-tablet",
        }
    }
}

pub const DEFAULT_INPUT_DEVICES: &[InputDevice] =
    &[InputDevice::Keyboard, InputDevice::Mouse];

/// Everything needed to start one emulator session.
#[derive(Clone, Debug)]
pub struct LaunchConfig {
    emulator: Utf8PathBuf,
    code_firmware: Utf8PathBuf,
    vars_copy: Option<Utf8PathBuf>,
    boot_image: Utf8PathBuf,
    machine_profile: String,
    memory_size: String,
    attached_devices: Vec<InputDevice>,
    extra_args: Vec<String>,
}

impl LaunchConfig {
    /// Creates a launch configuration with the default emulator, machine
    /// and devices.
    ///
    /// `vars_copy` is the writable variable store to attach, if any. When it
    /// is `None` the firmware runs without persistent variables.
    pub fn new(
        code_firmware: &ResolvedResource,
        vars_copy: Option<Utf8PathBuf>,
        boot_image: impl Into<Utf8PathBuf>,
    ) -> Result<Self, LaunchError> {
        if code_firmware.kind() != ResourceKind::CodeFirmware {
            return Err(LaunchError::NotCodeFirmware(code_firmware.kind()));
        }

        Ok(Self {
            emulator: DEFAULT_EMULATOR.into(),
            code_firmware: code_firmware.path().to_path_buf(),
            vars_copy,
            boot_image: boot_image.into(),
            machine_profile: DEFAULT_MACHINE.to_owned(),
            memory_size: DEFAULT_MEMORY.to_owned(),
            attached_devices: DEFAULT_INPUT_DEVICES.to_vec(),
            extra_args: vec![],
        })
    }

    pub fn with_emulator(mut self, emulator: impl Into<Utf8PathBuf>) -> Self {
        self.emulator = emulator.into();
        self
    }

    pub fn with_machine_profile(mut self, machine: impl Into<String>) -> Self {
        self.machine_profile = machine.into();
        self
    }

    pub fn with_memory_size(mut self, memory: impl Into<String>) -> Self {
        self.memory_size = memory.into();
        self
    }

    pub fn with_devices(mut self, devices: Vec<InputDevice>) -> Self {
        self.attached_devices = devices;
        self
    }

    /// Appends arguments to the end of the emulator command line.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn emulator(&self) -> &Utf8Path {
        &self.emulator
    }

    pub fn vars_copy(&self) -> Option<&Utf8Path> {
        self.vars_copy.as_deref()
    }

    /// Builds the emulator's argument list.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-machine".into(),
            self.machine_profile.clone().into(),
            "-m".into(),
            self.memory_size.clone().into(),
            "-device".into(),
            format!("qemu-xhci,id={CONTROLLER_ID}").into(),
        ];

        for device in &self.attached_devices {
            args.push("-device".into());
            args.push(
                format!("{},bus={CONTROLLER_ID}.0", device.driver()).into(),
            );
        }

        args.push("-drive".into());
        args.push(
            format!(
                "if=pflash,format=raw,readonly=on,file={}",
                self.code_firmware
            )
            .into(),
        );

        if let Some(vars) = &self.vars_copy {
            args.push("-drive".into());
            args.push(format!("if=pflash,format=raw,file={vars}").into());
        }

        args.push("-drive".into());
        args.push(
            format!(
                "if=none,id={BOOT_DRIVE_ID},format=raw,file={}",
                self.boot_image
            )
            .into(),
        );
        args.push("-device".into());
        args.push(
            format!("usb-storage,drive={BOOT_DRIVE_ID},bus={CONTROLLER_ID}.0")
                .into(),
        );

        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    /// Builds the emulator command without starting it.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.emulator);
        cmd.args(self.args());
        cmd
    }
}

/// Runs the emulator to completion and returns its exit status as-is.
///
/// The emulator's output is directed according to `output`; log files, if
/// any, are created in `log_dir`.
pub fn launch(
    config: &LaunchConfig,
    output: OutputMode,
    log_dir: &Utf8Path,
) -> Result<ExitStatus, LaunchError> {
    let (stdout, stderr) = output.get_handles(log_dir, LOG_NAME).map_err(
        |source| LaunchError::OutputFiles { dir: log_dir.to_owned(), source },
    )?;

    let mut cmd = config.command();
    cmd.stdout(stdout).stderr(stderr);

    info!(command = %PrettyCmd(&cmd), "Launching emulator");
    let status = cmd.status().map_err(|source| LaunchError::Spawn {
        emulator: config.emulator.clone(),
        source,
    })?;

    info!(%status, "Emulator exited");
    Ok(status)
}

/// Displays a command the way a user would type it. The alternate form
/// (`{:#}`) puts each option on its own line.
pub struct PrettyCmd<'a>(pub &'a Command);

impl std::fmt::Display for PrettyCmd<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let &Self(cmd) = self;
        write!(f, "{}", cmd.get_program().to_string_lossy())?;
        for arg in cmd.get_args() {
            let arg = arg.to_string_lossy();
            if f.alternate() && arg.starts_with('-') {
                write!(f, " \\\n\t{arg}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }

        Ok(())
    }
}
