// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Writing an assembled boot image to a USB drive.
//!
//! This destroys everything on the selected disk, so only removable disks
//! are offered unless `--include-internal` is given, and the user has to
//! type a confirmation phrase naming the disk unless `--yes` is given.

use std::io::{BufRead, Write};
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use esp_harness::launch::PrettyCmd;
use serde::Deserialize;

use crate::util::{self, cargo_log, cargo_warn};

#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct FlashArgs {
    /// The image to write. Defaults to `esp.img` in the harness work
    /// directory.
    #[clap(long, value_hint = clap::ValueHint::FilePath)]
    image: Option<Utf8PathBuf>,

    /// Skip the confirmation prompt.
    #[clap(long)]
    yes: bool,

    /// Offer internal disks as well as removable ones. Dangerous.
    #[clap(long)]
    include_internal: bool,
}

/// A whole disk that an image could be written to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Disk {
    /// The device node identifying the disk.
    path: String,

    /// The device node to write to. On macOS this is the raw device, which
    /// is much faster than the buffered one.
    write_path: String,
    size: String,
    model: String,
    transport: String,
    removable: bool,
}

pub(crate) fn cmd_flash(args: FlashArgs) -> Result<()> {
    let image = match args.image {
        Some(image) => image,
        None => util::default_work_dir()?.join("esp.img"),
    };
    anyhow::ensure!(
        image.is_file(),
        "Image `{image}` not found; build it first with `cargo xtask image`"
    );

    let disks = if cfg!(target_os = "macos") {
        list_disks_macos()?
    } else if cfg!(target_os = "linux") {
        list_disks_linux()?
    } else {
        anyhow::bail!("Flashing is only supported on Linux and macOS");
    };

    let candidates: Vec<Disk> = disks
        .into_iter()
        .filter(|d| d.removable || args.include_internal)
        .collect();
    anyhow::ensure!(
        !candidates.is_empty(),
        "No suitable disks found; try --include-internal to show all disks"
    );

    let disk = choose_disk(&candidates)?;
    confirm_destruction(disk, args.yes)?;

    if cfg!(target_os = "macos") {
        flash_macos(&image, disk)
    } else {
        flash_linux(&image, disk)
    }
}

/// Runs `cmd`, capturing its output, and fails if it exits unsuccessfully.
fn run_captured(cmd: &mut Command) -> Result<String> {
    let output = cmd
        .output()
        .with_context(|| format!("Failed to execute {}", PrettyCmd(cmd)))?;
    anyhow::ensure!(
        output.status.success(),
        "{} failed ({}):\n{}{}",
        PrettyCmd(cmd),
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).with_context(|| {
        format!("{} produced non-UTF-8 output", PrettyCmd(cmd))
    })
}

/// Runs `cmd`, only warning if it fails.
fn run_best_effort(cmd: &mut Command) {
    if let Err(e) = run_captured(cmd) {
        cargo_warn!("{e:#}");
    }
}

#[derive(Debug, Deserialize)]
struct Lsblk {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    kname: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    /// A boolean in newer `lsblk` releases, `"0"`/`"1"` in older ones.
    rm: Option<serde_json::Value>,
    size: Option<String>,
    model: Option<String>,
    tran: Option<String>,
    vendor: Option<String>,
    mountpoint: Option<String>,
    /// Replaces `mountpoint` in newer `lsblk` releases.
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

impl BlockDevice {
    fn removable_flag(&self) -> bool {
        match &self.rm {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_u64() == Some(1),
            Some(serde_json::Value::String(s)) => s.trim() == "1",
            _ => false,
        }
    }
}

fn parse_lsblk(json: &str) -> Result<Vec<Disk>> {
    let lsblk: Lsblk =
        serde_json::from_str(json).context("Failed to parse lsblk output")?;

    Ok(lsblk
        .blockdevices
        .into_iter()
        .filter(|dev| dev.kind.as_deref() == Some("disk"))
        .map(|dev| {
            let name = dev.kname.clone().unwrap_or_else(|| dev.name.clone());
            let path = format!("/dev/{name}");
            let transport = dev.tran.clone().unwrap_or_default();
            let model = [dev.vendor.as_deref(), dev.model.as_deref()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");

            Disk {
                write_path: path.clone(),
                path,
                size: dev.size.clone().unwrap_or_else(|| "?".to_string()),
                model: if model.is_empty() { name } else { model },
                removable: dev.removable_flag()
                    || transport.eq_ignore_ascii_case("usb"),
                transport,
            }
        })
        .collect())
}

/// Collects the mount points of `json`'s devices and their partitions.
fn parse_mountpoints(json: &str) -> Result<Vec<String>> {
    fn collect(dev: &BlockDevice, out: &mut Vec<String>) {
        let mounts =
            dev.mountpoint.iter().chain(dev.mountpoints.iter().flatten());
        for mount in mounts {
            if !mount.is_empty() && !out.contains(mount) {
                out.push(mount.clone());
            }
        }
        for child in &dev.children {
            collect(child, out);
        }
    }

    let lsblk: Lsblk =
        serde_json::from_str(json).context("Failed to parse lsblk output")?;
    let mut mounts = vec![];
    for dev in &lsblk.blockdevices {
        collect(dev, &mut mounts);
    }
    Ok(mounts)
}

fn list_disks_linux() -> Result<Vec<Disk>> {
    let json = run_captured(Command::new("lsblk").args([
        "-J",
        "-o",
        "NAME,KNAME,TYPE,RM,SIZE,MODEL,TRAN,VENDOR",
    ]))
    .context("Failed to list disks; is util-linux installed?")?;
    parse_lsblk(&json)
}

/// Parses the whole-disk headers of `diskutil list` output, such as
/// `/dev/disk4 (external, physical):`, into device names and flags.
fn parse_diskutil_list(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("/dev/")?;
            let (dev, flags) = rest.split_once(' ')?;
            let flags = flags.strip_suffix(':')?.trim();
            let flags = flags.strip_prefix('(')?.strip_suffix(')')?;
            let is_disk = dev.strip_prefix("disk").is_some_and(|n| {
                !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())
            });
            is_disk.then(|| (dev.to_string(), flags.to_string()))
        })
        .collect()
}

/// Builds a [`Disk`] from `diskutil info` output for the disk `dev`.
fn parse_diskutil_info(dev: &str, flags: &str, info: &str) -> Disk {
    let field = |name: &str| {
        info.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
    };

    let external = flags.split(',').any(|f| f.trim() == "external");

    // "Disk Size: 31.9 GB (31914983424 Bytes) (exactly ...)"
    let size = field("Disk Size")
        .and_then(|s| s.split(" (").next().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "?".to_string());
    let model = field("Device / Media Name")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| dev.to_string());
    let transport = field("Protocol")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| (if external { "USB" } else { "" }).to_string());

    Disk {
        path: format!("/dev/{dev}"),
        write_path: format!("/dev/r{dev}"),
        size,
        model,
        transport,
        removable: external,
    }
}

fn list_disks_macos() -> Result<Vec<Disk>> {
    let list = run_captured(Command::new("diskutil").arg("list"))?;

    let mut disks = vec![];
    for (dev, flags) in parse_diskutil_list(&list) {
        let info = run_captured(
            Command::new("diskutil").arg("info").arg(format!("/dev/{dev}")),
        )
        .unwrap_or_default();
        disks.push(parse_diskutil_info(&dev, &flags, &info));
    }
    Ok(disks)
}

fn prompt(message: &str) -> Result<String> {
    eprint!("{message}");
    std::io::stderr().flush().context("Failed to flush stderr")?;

    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    anyhow::ensure!(read > 0, "Aborted: stdin closed");
    Ok(line.trim().to_string())
}

fn choose_disk(candidates: &[Disk]) -> Result<&Disk> {
    eprintln!("Available disks:");
    for (idx, d) in candidates.iter().enumerate() {
        let tag = if d.removable { "REMOVABLE" } else { "INTERNAL" };
        eprintln!(
            "  [{idx}] {:12} {:>8}  {}  {} {tag}",
            d.path, d.size, d.model, d.transport
        );
    }

    loop {
        let selection = prompt("Select disk index to flash: ")?;
        match selection.parse::<usize>() {
            Ok(i) if i < candidates.len() => return Ok(&candidates[i]),
            Ok(_) => eprintln!("Index out of range."),
            Err(_) => eprintln!("Enter a valid index."),
        }
    }
}

fn confirmation_phrase(disk: &Disk) -> String {
    format!("ERASE {}", disk.path)
}

fn confirm_destruction(disk: &Disk, yes: bool) -> Result<()> {
    cargo_warn!(
        "this will ERASE all data on {} ({}, {})",
        disk.path,
        disk.size,
        disk.model
    );
    if yes {
        return Ok(());
    }

    let phrase = confirmation_phrase(disk);
    let response = prompt(&format!("Type '{phrase}' to continue: "))?;
    anyhow::ensure!(response == phrase, "Aborted");
    Ok(())
}

fn dd(
    image: &Utf8Path,
    disk: &Disk,
    block_size: &str,
    conv: &str,
) -> Result<()> {
    let mut cmd = Command::new("sudo");
    cmd.arg("dd")
        .arg(format!("if={image}"))
        .arg(format!("of={}", disk.write_path))
        .arg(format!("bs={block_size}"))
        .arg(format!("conv={conv}"));
    cargo_log!("Running", "{}", PrettyCmd(&cmd));
    run_captured(&mut cmd).map(|_| ())
}

fn flash_linux(image: &Utf8Path, disk: &Disk) -> Result<()> {
    cargo_log!("Flashing", "{} ({}, {})", disk.path, disk.size, disk.model);

    let json = run_captured(Command::new("lsblk").arg("-J").arg(&disk.path))?;
    for mountpoint in parse_mountpoints(&json)? {
        cargo_log!("Unmounting", "{mountpoint}");
        run_best_effort(Command::new("sudo").arg("umount").arg(&mountpoint));
    }

    dd(image, disk, "4M", "fsync")?;
    run_best_effort(&mut Command::new("sync"));
    run_best_effort(
        Command::new("udisksctl").args(["power-off", "-b"]).arg(&disk.path),
    );

    cargo_log!("Finished", "the USB drive can now be removed");
    Ok(())
}

fn flash_macos(image: &Utf8Path, disk: &Disk) -> Result<()> {
    cargo_log!("Flashing", "{} ({}, {})", disk.path, disk.size, disk.model);

    run_captured(Command::new("diskutil").arg("unmountDisk").arg(&disk.path))?;
    dd(image, disk, "1m", "sync")?;
    run_best_effort(&mut Command::new("sync"));
    run_best_effort(Command::new("diskutil").arg("eject").arg(&disk.path));

    cargo_log!("Finished", "the USB drive can now be removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSBLK: &str = r#"{
        "blockdevices": [
            {"name": "sda", "kname": "sda", "type": "disk", "rm": false,
             "size": "14.9G", "model": "Cruzer Blade", "tran": "usb",
             "vendor": "SanDisk "},
            {"name": "nvme0n1", "kname": "nvme0n1", "type": "disk", "rm": false,
             "size": "476.9G", "model": "Samsung SSD 970", "tran": "nvme",
             "vendor": null},
            {"name": "sr0", "kname": "sr0", "type": "rom", "rm": true,
             "size": "1024M", "model": null, "tran": "sata", "vendor": null},
            {"name": "sdb", "kname": "sdb", "type": "disk", "rm": "1",
             "size": "7.5G", "model": null, "tran": null, "vendor": null}
        ]
    }"#;

    #[test]
    fn lsblk_disks_are_classified() {
        let disks = parse_lsblk(LSBLK).unwrap();
        assert_eq!(disks.len(), 3);

        assert_eq!(disks[0].path, "/dev/sda");
        assert_eq!(disks[0].model, "SanDisk Cruzer Blade");
        assert!(disks[0].removable);

        assert_eq!(disks[1].path, "/dev/nvme0n1");
        assert!(!disks[1].removable);

        assert_eq!(disks[2].model, "sdb");
        assert!(disks[2].removable);
        assert_eq!(disks[2].write_path, "/dev/sdb");
    }

    #[test]
    fn lsblk_mountpoints_include_partitions() {
        let json = r#"{
            "blockdevices": [
                {"name": "sda", "mountpoint": null, "children": [
                    {"name": "sda1", "mountpoint": "/media/usb"},
                    {"name": "sda2", "mountpoint": null},
                    {"name": "sda3", "mountpoints": ["/mnt/data", null]}
                ]}
            ]
        }"#;
        assert_eq!(
            parse_mountpoints(json).unwrap(),
            vec!["/media/usb", "/mnt/data"]
        );
    }

    #[test]
    fn diskutil_output_is_parsed() {
        let list = "\
/dev/disk0 (internal, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:      GUID_partition_scheme                        *500.3 GB   disk0
/dev/disk3 (synthesized):
/dev/disk4 (external, physical):
   0:     FDisk_partition_scheme                        *31.9 GB    disk4
";
        let headers = parse_diskutil_list(list);
        assert_eq!(
            headers,
            vec![
                ("disk0".to_string(), "internal, physical".to_string()),
                ("disk3".to_string(), "synthesized".to_string()),
                ("disk4".to_string(), "external, physical".to_string()),
            ]
        );

        let info = "\
   Device Identifier:         disk4
   Device / Media Name:       Ultra USB 3.0
   Protocol:                  USB
   Disk Size:                 31.9 GB (31914983424 Bytes) \
                              (exactly 62333952 512-Byte-Units)
";
        let disk = parse_diskutil_info("disk4", "external, physical", info);
        assert_eq!(
            disk,
            Disk {
                path: "/dev/disk4".into(),
                write_path: "/dev/rdisk4".into(),
                size: "31.9 GB".into(),
                model: "Ultra USB 3.0".into(),
                transport: "USB".into(),
                removable: true,
            }
        );

        let internal = parse_diskutil_info("disk0", "internal, physical", "");
        assert!(!internal.removable);
        assert_eq!(internal.model, "disk0");
        assert_eq!(internal.size, "?");
    }

    #[test]
    fn confirmation_names_the_device() {
        let disk = parse_diskutil_info("disk4", "external, physical", "");
        assert_eq!(confirmation_phrase(&disk), "ERASE /dev/disk4");
    }
}
