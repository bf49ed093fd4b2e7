// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for reading QEMU firmware descriptor files.
//!
//! QEMU installations ship a directory of JSON descriptors (usually
//! `share/qemu/firmware/*.json`) that describe each firmware build and the
//! flash images that go with it. The only part of a descriptor this module
//! cares about is the NVRAM template:
//!
//! ```text
//! {
//!     "mapping": {
//!         "device": "flash",
//!         "executable": { "filename": "...", "format": "raw" },
//!         "nvram-template": { "filename": "...", "format": "raw" }
//!     },
//!     ...
//! }
//! ```
//!
//! A descriptor that can't be read, isn't valid JSON, or simply doesn't
//! describe a template is not an error. Callers treat a `None` from this
//! module as "try the next descriptor".

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct FirmwareDescriptor {
    mapping: Option<Mapping>,
}

#[derive(Debug, Deserialize)]
struct Mapping {
    #[serde(rename = "nvram-template")]
    nvram_template: Option<FlashFile>,
}

#[derive(Debug, Deserialize)]
struct FlashFile {
    filename: String,
}

/// Reads the descriptor at `manifest_path` and yields the NVRAM template
/// filename it names, if any.
///
/// The returned path is not checked for existence.
pub fn extract_template_path(manifest_path: &Utf8Path) -> Option<Utf8PathBuf> {
    let contents = match std::fs::read_to_string(manifest_path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!(%manifest_path, %e, "firmware descriptor not readable");
            return None;
        }
    };

    let template = parse_template_path(&contents);
    if template.is_none() {
        debug!(%manifest_path, "firmware descriptor names no NVRAM template");
    }

    template
}

/// Extracts the NVRAM template filename from the text of a firmware
/// descriptor.
pub(crate) fn parse_template_path(contents: &str) -> Option<Utf8PathBuf> {
    let descriptor: FirmwareDescriptor = serde_json::from_str(contents).ok()?;
    let filename = descriptor.mapping?.nvram_template?.filename;
    if filename.is_empty() {
        return None;
    }

    Some(Utf8PathBuf::from(filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDK2_DESCRIPTOR: &str = r#"{
        "description": "UEFI firmware for x86_64",
        "interface-types": ["uefi"],
        "mapping": {
            "device": "flash",
            "executable": {
                "filename": "/usr/share/qemu/edk2-x86_64-code.fd",
                "format": "raw"
            },
            "nvram-template": {
                "filename": "/usr/share/qemu/edk2-i386-vars.fd",
                "format": "raw"
            }
        },
        "targets": [{ "architecture": "x86_64", "machines": ["pc-q35-*"] }],
        "features": ["acpi-s3", "verbose-dynamic"],
        "tags": []
    }"#;

    #[test]
    fn template_is_extracted_from_edk2_descriptor() {
        assert_eq!(
            parse_template_path(EDK2_DESCRIPTOR),
            Some(Utf8PathBuf::from("/usr/share/qemu/edk2-i386-vars.fd"))
        );
    }

    #[test]
    fn descriptor_without_template_yields_none() {
        let descriptor = r#"{
            "mapping": {
                "device": "memory",
                "filename": "/usr/share/qemu/bios-microvm.bin"
            }
        }"#;
        assert_eq!(parse_template_path(descriptor), None);
    }

    #[test]
    fn template_without_filename_yields_none() {
        let descriptor = r#"{ "mapping": { "nvram-template": {} } }"#;
        assert_eq!(parse_template_path(descriptor), None);
    }

    #[test]
    fn malformed_descriptor_yields_none() {
        assert_eq!(parse_template_path("{ \"mapping\": "), None);
        assert_eq!(parse_template_path(""), None);
        assert_eq!(parse_template_path("[1, 2, 3]"), None);
    }

    #[test]
    fn missing_descriptor_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::try_from(dir.path().join("absent.json")).unwrap();
        assert_eq!(extract_template_path(&path), None);
    }

    #[test]
    fn extraction_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::try_from(dir.path().join("60-edk2-x86_64.json"))
                .unwrap();
        std::fs::write(&path, EDK2_DESCRIPTOR).unwrap();

        let first = extract_template_path(&path);
        let second = extract_template_path(&path);
        assert!(first.is_some());
        assert_eq!(first, second);
    }
}
