// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

macro_rules! cargo_log {
    ($tag:literal, $($arg:tt)*) => {
        eprintln!(
            "{:>indent$} {}",
            owo_colors::OwoColorize::if_supports_color(
                &$tag,
                owo_colors::Stream::Stderr,
                |tag| owo_colors::Style::new().bold().green().style(tag),
            ),
            format_args!($($arg)*),
            indent = 12
        )
    }
}

macro_rules! cargo_warn {
    ($($arg:tt)*) => {
        eprintln!(
            "{}{} {}",
            owo_colors::OwoColorize::if_supports_color(
                &"warning",
                owo_colors::Stream::Stderr,
                |tag| owo_colors::Style::new().bold().yellow().style(tag),
            ),
            owo_colors::OwoColorize::if_supports_color(
                &":",
                owo_colors::Stream::Stderr,
                |tag| owo_colors::Style::new().bold().style(tag),
            ),
            format_args!($($arg)*),
        )
    }
}

pub(crate) use {cargo_log, cargo_warn};

/// The target triple UEFI applications are built for.
const UEFI_TARGET: &str = "x86_64-unknown-uefi";

/// The directory the harness keeps its files in by default:
/// `<cargo target dir>/esp-harness`, relative to the current directory where
/// possible.
pub(crate) fn default_work_dir() -> Result<Utf8PathBuf> {
    let meta = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("Failed to run cargo metadata")?;
    Ok(relativize(&meta.target_directory).join("esp-harness"))
}

/// Builds the UEFI application in package `name` and returns the path of
/// the resulting `.efi` file.
pub(crate) fn build_uefi_app(name: &str, release: bool) -> Result<Utf8PathBuf> {
    cargo_log!("Compiling", "{name} ({UEFI_TARGET})");

    let mut cmd = escargot::CargoBuild::new()
        .package(name)
        .bin(name)
        .target(UEFI_TARGET);
    let profile = if release {
        cmd = cmd.release();
        "release [optimized]"
    } else {
        "dev [unoptimized + debuginfo]"
    };

    let t0 = time::Instant::now();
    let bin = cmd.run().with_context(|| format!("Failed to build {name}"))?;
    let t1 = t0.elapsed();
    cargo_log!("Finished", "{name} {profile} in {:0.2}s", t1.as_secs_f64());

    let path: &Utf8Path = bin
        .path()
        .try_into()
        .context("UEFI application path is not UTF-8")?;
    Ok(relativize(path).to_path_buf())
}

/// Strips the current directory from the front of `path`, if it's there.
pub(crate) fn relativize(path: &Utf8Path) -> &Utf8Path {
    use std::sync::OnceLock;

    static PWD: OnceLock<Option<Utf8PathBuf>> = OnceLock::new();
    let pwd = PWD.get_or_init(|| {
        std::env::current_dir()
            .ok()
            .and_then(|dir| Utf8PathBuf::try_from(dir).ok())
    });

    match pwd {
        Some(pwd) => path.strip_prefix(pwd).unwrap_or(path),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relativize_strips_the_current_directory() {
        let pwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap())
            .unwrap();
        let inside = pwd.join("target/esp-harness");
        assert_eq!(relativize(&inside), Utf8Path::new("target/esp-harness"));

        let outside = Utf8Path::new("/elsewhere");
        assert_eq!(relativize(outside), outside);
    }
}
