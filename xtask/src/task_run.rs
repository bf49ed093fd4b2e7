// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use esp_harness::launch::{self, PrettyCmd};
use esp_harness::output_mode::log_paths;
use esp_harness::{OutputMode, Pipeline, PipelineError, PreparedRun};

use crate::harness_args::{EmulatorArgs, HarnessArgs};
use crate::util::{self, cargo_log, cargo_warn};

/// Selects the UEFI application to boot.
#[derive(Debug, Clone, clap::Parser)]
#[command(next_help_heading = "Application Selection")]
pub(crate) struct AppArgs {
    /// A prebuilt UEFI application to boot instead of building one.
    #[clap(
        long,
        value_hint = clap::ValueHint::FilePath,
        conflicts_with = "release"
    )]
    efi: Option<Utf8PathBuf>,

    /// The package (and binary) to build for `x86_64-unknown-uefi`.
    #[clap(long, short = 'p', default_value = "zap")]
    package: String,

    /// If set, build the application in release mode.
    #[clap(long, short = 'r')]
    release: bool,
}

impl AppArgs {
    /// Returns the path of the application, building it if necessary.
    pub(crate) fn application(&self) -> anyhow::Result<Utf8PathBuf> {
        match &self.efi {
            Some(path) => {
                cargo_log!("Using", "prebuilt UEFI application `{path}`");
                anyhow::ensure!(
                    path.is_file(),
                    "UEFI application `{path}` does not exist"
                );
                Ok(path.clone())
            }
            None => util::build_uefi_app(&self.package, self.release),
        }
    }
}

#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct RunArgs {
    #[clap(flatten)]
    app: AppArgs,

    #[clap(flatten)]
    harness: HarnessArgs,

    #[clap(flatten)]
    emulator: EmulatorArgs,
}

/// Resolves firmware, then obtains the application and prepares the run.
///
/// Firmware is resolved before the application is built, so a host without
/// edk2 fails immediately rather than after a full UEFI build.
fn prepare(args: RunArgs) -> anyhow::Result<(Pipeline, PreparedRun)> {
    let RunArgs { app, harness, emulator } = args;

    let mut config = harness.into_config()?;
    emulator.apply(&mut config);
    let pipeline = Pipeline::new(config);

    let resolution = match pipeline.resolve() {
        Ok(resolution) => resolution,
        Err(e @ PipelineError::FatalResourceMissing(_)) => {
            return Err(anyhow::Error::new(e).context(
                "Install QEMU with edk2 firmware, or point CODE_FD at an \
                 edk2-x86_64-code.fd image",
            ));
        }
        Err(e) => return Err(e.into()),
    };
    cargo_log!(
        "Found",
        "firmware `{}` ({})",
        resolution.code_firmware.path(),
        resolution.code_firmware.source()
    );

    let application = app.application()?;
    let prepared = pipeline.prepare_with(resolution, &application)?;
    Ok((pipeline, prepared))
}

/// Boots the application under QEMU, exiting with QEMU's exit code.
pub(crate) fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let (pipeline, prepared) = prepare(args)?;

    match (&prepared.resolution.vars_template, &prepared.vars_copy) {
        (Some(template), Some(copy)) => cargo_log!(
            "Copied",
            "variable store `{}` ({}) to `{copy}`",
            template.path(),
            template.source()
        ),
        _ => cargo_warn!(
            "no variable store template found; boot entries will not persist"
        ),
    }
    cargo_log!("Assembled", "boot image `{}`", prepared.boot_image);

    cargo_log!(
        "Running",
        "{:#}",
        PrettyCmd(&prepared.launch_config.command())
    );
    if pipeline.config().output_mode == OutputMode::File {
        let (stdout, stderr) =
            log_paths(&pipeline.config().work_dir, launch::LOG_NAME);
        cargo_log!("Logging", "QEMU output to `{stdout}` and `{stderr}`");
    }
    let status = pipeline.launch(&prepared)?;
    let code = status.code().ok_or_else(|| {
        anyhow::anyhow!("QEMU exited without a status code ({status})")
    })?;

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn missing_firmware_fails_before_the_application_is_needed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let config = root.join("harness.toml");
        std::fs::write(&config, "[firmware]\ncode-candidates = []\n").unwrap();

        // Neither the firmware override nor the application exist. Only the
        // firmware failure may be reported.
        let args = RunArgs::parse_from([
            "xtask",
            "--config",
            config.as_str(),
            "--work-dir",
            root.join("work").as_str(),
            "--code-fd",
            root.join("missing-code.fd").as_str(),
            "--efi",
            root.join("missing.efi").as_str(),
        ]);

        let err = prepare(args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::FatalResourceMissing(_))
        ));
        assert!(!root.join("work").exists());
    }
}
