// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

mod harness_args;
mod task_flash;
mod task_image;
mod task_locate;
mod task_run;
mod util;

use util::cargo_log;

#[derive(Parser)]
#[command(
    name = "cargo xtask",
    about = "Boot UEFI applications under QEMU from a generated ESP image"
)]
struct Args {
    /// Emit Bunyan-formatted logs instead of human-readable ones.
    #[clap(long, global = true)]
    emit_bunyan: bool,

    /// Disable ANSI escape sequences in human-readable logs.
    #[clap(long, global = true)]
    disable_ansi: bool,

    #[command(subcommand)]
    cmd: Cmds,
}

#[derive(Subcommand)]
#[allow(clippy::large_enum_variant)]
enum Cmds {
    /// Build the UEFI application and boot it under QEMU
    Run {
        #[clap(flatten)]
        args: task_run::RunArgs,
    },
    /// Show which firmware images would be used
    Locate {
        #[clap(flatten)]
        args: harness_args::HarnessArgs,
    },
    /// Build the UEFI application and assemble the boot image
    Image {
        #[clap(flatten)]
        args: task_image::ImageArgs,
    },
    /// Write the boot image to a USB drive (DESTROYS ITS CONTENTS)
    Flash {
        #[clap(flatten)]
        args: task_flash::FlashArgs,
    },
    /// Delete the harness work directory
    Tidy {
        /// The work directory to delete. Defaults to `esp-harness` in
        /// Cargo's target directory.
        #[clap(long)]
        work_dir: Option<Utf8PathBuf>,
    },
}

fn set_tracing_subscriber(args: &Args) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("esp-harness".into(), std::io::stderr);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let stderr_log = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stderr_log);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
}

fn cmd_tidy(work_dir: Option<Utf8PathBuf>) -> Result<()> {
    let work_dir = match work_dir {
        Some(dir) => dir,
        None => util::default_work_dir()?,
    };

    if !work_dir.exists() {
        cargo_log!("Skipping", "`{work_dir}` does not exist");
        return Ok(());
    }

    std::fs::remove_dir_all(&work_dir)
        .with_context(|| format!("Failed to remove `{work_dir}`"))?;
    cargo_log!("Removed", "`{work_dir}`");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    set_tracing_subscriber(&args);

    match args.cmd {
        Cmds::Run { args } => task_run::cmd_run(args),
        Cmds::Locate { args } => task_locate::cmd_locate(args),
        Cmds::Image { args } => task_image::cmd_image(args),
        Cmds::Flash { args } => task_flash::cmd_flash(args),
        Cmds::Tidy { work_dir } => cmd_tidy(work_dir),
    }
}
