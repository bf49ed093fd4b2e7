// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where the emulator's console output goes.

use std::{process::Stdio, str::FromStr};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::info;

/// Destination of the emulator's stdout and stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Capture each stream in its own log file in the work directory.
    #[serde(alias = "tmpfile")]
    File,

    /// Share the harness's own console.
    #[default]
    Stdio,

    /// Discard both streams.
    Null,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" | "tmpfile" => Ok(OutputMode::File),
            "stdio" => Ok(OutputMode::Stdio),
            "null" => Ok(OutputMode::Null),
            _ => Err(format!("unknown output mode `{s}`")),
        }
    }
}

/// The log files that [`OutputMode::File`] writes for an emulator named
/// `name`: `<log_dir>/<name>.stdout.log` and `<log_dir>/<name>.stderr.log`.
pub fn log_paths(log_dir: &Utf8Path, name: &str) -> (Utf8PathBuf, Utf8PathBuf) {
    (
        log_dir.join(format!("{name}.stdout.log")),
        log_dir.join(format!("{name}.stderr.log")),
    )
}

impl OutputMode {
    /// Opens the stdout and stderr handles for an emulator process named
    /// `name`. In [`OutputMode::File`] mode this truncates or creates the
    /// files named by [`log_paths`].
    pub(crate) fn get_handles(
        &self,
        log_dir: &Utf8Path,
        name: &str,
    ) -> std::io::Result<(Stdio, Stdio)> {
        match self {
            OutputMode::File => {
                let (stdout_path, stderr_path) = log_paths(log_dir, name);
                info!(%stdout_path, %stderr_path, "Opening emulator log files");
                let stdout = std::fs::File::create(&stdout_path)?.into();
                let stderr = std::fs::File::create(&stderr_path)?.into();
                Ok((stdout, stderr))
            }
            OutputMode::Stdio => Ok((Stdio::inherit(), Stdio::inherit())),
            OutputMode::Null => Ok((Stdio::null(), Stdio::null())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!("FILE".parse::<OutputMode>().unwrap(), OutputMode::File);
        assert_eq!("tmpfile".parse::<OutputMode>().unwrap(), OutputMode::File);
        assert_eq!("Stdio".parse::<OutputMode>().unwrap(), OutputMode::Stdio);
        assert_eq!("null".parse::<OutputMode>().unwrap(), OutputMode::Null);
        assert_eq!(
            "syslog".parse::<OutputMode>().unwrap_err(),
            "unknown output mode `syslog`"
        );
    }

    #[test]
    fn file_mode_truncates_log_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        std::fs::write(dir.join("emulator.stdout.log"), "stale").unwrap();

        OutputMode::File.get_handles(dir, "emulator").unwrap();
        let (stdout, stderr) = log_paths(dir, "emulator");
        assert_eq!(stdout, dir.join("emulator.stdout.log"));
        assert_eq!(std::fs::read(&stdout).unwrap(), b"");
        assert!(stderr.is_file());
    }
}
