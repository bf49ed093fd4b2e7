// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boots a UEFI application under QEMU from a freshly assembled removable
//! boot medium.
//!
//! The entry point is [`Pipeline`], which takes a [`HarnessConfig`] and
//! runs the individual stages in order:
//!
//! - [`firmware`] finds the edk2 code image and variable store template.
//! - [`disk`] builds the FAT boot image holding the application.
//! - [`nvram`] makes a writable copy of the variable store template.
//! - [`launch`] starts the emulator and waits for it.

pub mod config;
pub mod disk;
pub mod firmware;
pub mod launch;
pub mod nvram;
pub mod output_mode;
pub mod pipeline;

pub use config::{ConfigError, ExtraFile, HarnessConfig};
pub use firmware::{ResolvedResource, ResourceKind, ResourceSource};
pub use output_mode::OutputMode;
pub use pipeline::{Pipeline, PipelineError, PreparedRun, Resolution};
