// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use esp_harness::Pipeline;

use crate::harness_args::HarnessArgs;
use crate::task_run::AppArgs;
use crate::util::cargo_log;

#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct ImageArgs {
    #[clap(flatten)]
    app: AppArgs,

    #[clap(flatten)]
    harness: HarnessArgs,
}

/// Builds the boot image without resolving firmware or starting QEMU.
pub(crate) fn cmd_image(args: ImageArgs) -> anyhow::Result<()> {
    let ImageArgs { app, harness } = args;
    let pipeline = Pipeline::new(harness.into_config()?);
    let application = app.application()?;

    let image = pipeline.assemble(&application)?;
    cargo_log!("Assembled", "boot image `{image}`");
    Ok(())
}
