// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Locating the platform firmware images on the host.
//!
//! The emulator needs two files from the host's QEMU installation: the edk2
//! firmware code image and (optionally) a template for the firmware's
//! variable store. Where these live depends on the platform and on how QEMU
//! was installed, so each one is described by a [`ResourceSpec`] listing the
//! places to look, and [`resolve`] searches them in a fixed order:
//!
//! 1. An explicit override path, if it names an existing file.
//! 2. Each literal candidate path, in order.
//! 3. Each wildcard candidate, in order. When a pattern matches more than
//!    one file, the lexically first path wins.
//! 4. For variable store templates only, the `nvram-template` entry of each
//!    firmware descriptor in [`ResourceSpec::manifests`].

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod manifest;

/// Literal and wildcard locations of the edk2 x86_64 code image, most
/// platform-specific first.
pub const DEFAULT_CODE_CANDIDATES: &[&str] = &[
    "/opt/homebrew/share/qemu/edk2-x86_64-code.fd",
    "/usr/local/share/qemu/edk2-x86_64-code.fd",
    "/usr/share/qemu/edk2-x86_64-code.fd",
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
    "/opt/homebrew/Cellar/qemu/*/share/qemu/edk2-x86_64-code.fd",
    "/usr/local/Cellar/qemu/*/share/qemu/edk2-x86_64-code.fd",
];

/// Literal and wildcard locations of an edk2 variable store template.
///
/// QEMU's own builds use the i386 variable store layout for x86_64 as well,
/// so those are accepted after the x86_64-specific names.
pub const DEFAULT_VARS_CANDIDATES: &[&str] = &[
    "/opt/homebrew/share/qemu/edk2-x86_64-vars.fd",
    "/usr/local/share/qemu/edk2-x86_64-vars.fd",
    "/usr/share/qemu/edk2-x86_64-vars.fd",
    "/usr/share/OVMF/OVMF_VARS.fd",
    "/usr/share/edk2/ovmf/OVMF_VARS.fd",
    "/opt/homebrew/Cellar/qemu/*/share/qemu/edk2-x86_64-vars.fd",
    "/usr/local/Cellar/qemu/*/share/qemu/edk2-x86_64-vars.fd",
    "/opt/homebrew/share/qemu/edk2-i386-vars.fd",
    "/usr/local/share/qemu/edk2-i386-vars.fd",
    "/opt/homebrew/Cellar/qemu/*/share/qemu/edk2-i386-vars.fd",
    "/usr/local/Cellar/qemu/*/share/qemu/edk2-i386-vars.fd",
];

/// Firmware descriptors consulted when no variable store template is found
/// at any candidate location.
pub const DEFAULT_MANIFESTS: &[&str] = &[
    "/opt/homebrew/share/qemu/firmware/60-edk2-x86_64.json",
    "/usr/local/share/qemu/firmware/60-edk2-x86_64.json",
    "/usr/share/qemu/firmware/60-edk2-x86_64.json",
];

/// The kinds of firmware file the harness needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// The read-only firmware code image.
    CodeFirmware,

    /// The canonical variable store image copied for each run.
    VarsTemplate,
}

impl ResourceKind {
    /// The name of the setting that overrides the search for this resource.
    pub fn override_name(&self) -> &'static str {
        match self {
            ResourceKind::CodeFirmware => "CODE_FD",
            ResourceKind::VarsTemplate => "VARS_FD_TEMPLATE",
        }
    }

    fn consults_manifests(&self) -> bool {
        matches!(self, ResourceKind::VarsTemplate)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::CodeFirmware => write!(f, "firmware code image"),
            ResourceKind::VarsTemplate => {
                write!(f, "firmware variable store template")
            }
        }
    }
}

/// The strategy that produced a [`ResolvedResource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceSource {
    Override,
    DirectMatch,
    GlobMatch,
    ManifestMatch,
}

impl std::fmt::Display for ResourceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceSource::Override => "override",
            ResourceSource::DirectMatch => "direct match",
            ResourceSource::GlobMatch => "glob match",
            ResourceSource::ManifestMatch => "firmware descriptor",
        };
        write!(f, "{s}")
    }
}

/// Describes where to look for one firmware resource.
#[derive(Clone, Debug)]
pub struct ResourceSpec {
    pub kind: ResourceKind,

    /// A path supplied by the user. Used verbatim if it names a file.
    pub override_path: Option<Utf8PathBuf>,

    /// Candidate paths in priority order. Entries containing glob
    /// metacharacters are expanded against the file system.
    pub candidates: Vec<String>,

    /// Firmware descriptor files to consult, in order, if no candidate
    /// matches. Ignored for code images.
    pub manifests: Vec<Utf8PathBuf>,
}

impl ResourceSpec {
    /// Creates a spec for the firmware code image with the default candidate
    /// list.
    pub fn code_firmware(override_path: Option<Utf8PathBuf>) -> Self {
        Self {
            kind: ResourceKind::CodeFirmware,
            override_path,
            candidates: DEFAULT_CODE_CANDIDATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            manifests: vec![],
        }
    }

    /// Creates a spec for the variable store template with the default
    /// candidate and descriptor lists.
    pub fn vars_template(override_path: Option<Utf8PathBuf>) -> Self {
        Self {
            kind: ResourceKind::VarsTemplate,
            override_path,
            candidates: DEFAULT_VARS_CANDIDATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            manifests: DEFAULT_MANIFESTS
                .iter()
                .map(Utf8PathBuf::from)
                .collect(),
        }
    }
}

/// A firmware file located on the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedResource {
    kind: ResourceKind,
    path: Utf8PathBuf,
    source: ResourceSource,
}

impl ResolvedResource {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn source(&self) -> ResourceSource {
        self.source
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(
        "could not locate the {kind}; set {} to its path",
        .kind.override_name()
    )]
    NotFound { kind: ResourceKind },
}

/// Searches for the resource described by `spec`.
pub fn resolve(spec: &ResourceSpec) -> Result<ResolvedResource, ResolveError> {
    let kind = spec.kind;
    let found = |path: Utf8PathBuf, source: ResourceSource| {
        info!(%kind, %path, %source, "Located firmware resource");
        Ok(ResolvedResource { kind, path, source })
    };

    if let Some(path) = &spec.override_path {
        if path.is_file() {
            return found(path.clone(), ResourceSource::Override);
        }

        warn!(
            %kind,
            %path,
            "{} does not name a file, searching default locations",
            kind.override_name()
        );
    }

    let (patterns, literals): (Vec<&String>, Vec<&String>) =
        spec.candidates.iter().partition(|c| is_pattern(c));

    for candidate in literals {
        let path = Utf8Path::new(candidate);
        if path.is_file() {
            return found(path.to_path_buf(), ResourceSource::DirectMatch);
        }
    }

    for pattern in patterns {
        if let Some(path) = first_glob_match(pattern) {
            return found(path, ResourceSource::GlobMatch);
        }
    }

    if kind.consults_manifests() {
        for manifest in &spec.manifests {
            let Some(path) = manifest::extract_template_path(manifest) else {
                continue;
            };

            if path.is_file() {
                return found(path, ResourceSource::ManifestMatch);
            }

            debug!(
                %manifest,
                %path,
                "firmware descriptor names a template that does not exist"
            );
        }
    }

    Err(ResolveError::NotFound { kind })
}

fn is_pattern(candidate: &str) -> bool {
    candidate.contains(['*', '?', '['])
}

/// Expands `pattern` and returns the lexically first regular file it
/// matches.
fn first_glob_match(pattern: &str) -> Option<Utf8PathBuf> {
    let paths = match glob::glob(pattern) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(pattern, %e, "ignoring malformed candidate pattern");
            return None;
        }
    };

    let mut matches: Vec<Utf8PathBuf> = paths
        .filter_map(Result::ok)
        .filter_map(|p| Utf8PathBuf::try_from(p).ok())
        .filter(|p| p.is_file())
        .collect();

    matches.sort();
    if matches.len() > 1 {
        debug!(pattern, ?matches, "pattern matched several files");
    }

    matches.into_iter().next()
}
