//! Discovering removable target disks through `lsblk`.
//!
//! The lister is asked for exactly `NAME,SIZE,MODEL,RM,TYPE,TRAN` in pairs
//! mode (`-P`), which prints one device per line as `KEY="value"` pairs in
//! that order. The parser is tied to that order and quoting; lines that do not
//! have the six-field shape are skipped, not reported.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

use crate::device::Device;

/// Arguments passed to the lister, after the program name.
pub const LISTER_ARGS: &[&str] = &["-P", "-d", "-o", "NAME,SIZE,MODEL,RM,TYPE,TRAN"];

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"NAME="([^"]*)"\s+SIZE="([^"]*)"\s+MODEL="([^"]*)"\s+RM="([^"]*)"\s+TYPE="([^"]*)"\s+TRAN="([^"]*)""#,
    )
    .expect("valid regex")
});

/// The result of one scan.
///
/// A failed scan still yields an (empty) device list; the reason is kept as a
/// warning for the caller to log or display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub devices: Vec<Device>,
    pub warning: Option<String>,
}

impl ScanOutcome {
    pub fn found(devices: Vec<Device>) -> Self {
        Self {
            devices,
            warning: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            devices: Vec::new(),
            warning: Some(reason.into()),
        }
    }
}

/// Parses one lister line. Returns `None` for malformed lines and for devices
/// that are not eligible flash targets.
pub fn parse_line(line: &str) -> Option<Device> {
    let caps = LINE_RE.captures(line)?;
    let name = &caps[1];
    let media_type = &caps[5];
    let removable = &caps[4] == "1";
    let usb = &caps[6] == "usb";

    if name.is_empty() || !Device::is_eligible(media_type, removable, usb) {
        return None;
    }

    Some(Device {
        path: PathBuf::from("/dev/").join(name),
        name: name.to_string(),
        model: caps[3].trim().to_string(),
        size: caps[2].to_string(),
        removable,
        usb,
        media_type: media_type.to_string(),
    })
}

/// Parses the complete lister output, keeping output order.
pub fn parse_listing(output: &str) -> Vec<Device> {
    output.lines().filter_map(parse_line).collect()
}

/// Runs the block device lister.
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    program: String,
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new("lsblk")
    }
}

impl DeviceScanner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Lists eligible devices. Never fails: an unavailable or failing lister
    /// produces an empty outcome carrying a warning.
    ///
    /// This blocks for as long as the lister runs.
    pub fn scan(&self) -> ScanOutcome {
        debug!("Scanning devices with {} {}", self.program, LISTER_ARGS.join(" "));
        let output = match Command::new(&self.program)
            .args(LISTER_ARGS)
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!("Error scanning drives: cannot run {}: {}", self.program, e);
                return ScanOutcome::failed(format!("cannot run {}: {}", self.program, e));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Error scanning drives: {} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
            return ScanOutcome::failed(format!("{} exited with {}", self.program, output.status));
        }

        let devices = parse_listing(&String::from_utf8_lossy(&output.stdout));
        debug!("Found {} removable device(s)", devices.len());
        ScanOutcome::found(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = concat!(
        "NAME=\"sda\" SIZE=\"476.9G\" MODEL=\"Samsung SSD 860\" RM=\"0\" TYPE=\"disk\" TRAN=\"sata\"\n",
        "NAME=\"sdb\" SIZE=\"14.9G\" MODEL=\"SanDisk Ultra\" RM=\"1\" TYPE=\"disk\" TRAN=\"usb\"\n",
        "NAME=\"sr0\" SIZE=\"1024M\" MODEL=\"DVD-RW\" RM=\"1\" TYPE=\"rom\" TRAN=\"sata\"\n",
        "NAME=\"mmcblk0\" SIZE=\"29.7G\" MODEL=\"\" RM=\"1\" TYPE=\"disk\" TRAN=\"\"\n",
        "NAME=\"sdc\" SIZE=\"931.5G\" MODEL=\"Portable\" RM=\"0\" TYPE=\"disk\" TRAN=\"usb\"\n",
    );

    #[test]
    fn keeps_only_removable_or_usb_disks_in_order() {
        let devices = parse_listing(LISTING);
        let paths: Vec<_> = devices.iter().map(|d| d.path.display().to_string()).collect();
        assert_eq!(paths, vec!["/dev/sdb", "/dev/mmcblk0", "/dev/sdc"]);

        let sdb = &devices[0];
        assert_eq!(sdb.name, "sdb");
        assert_eq!(sdb.model, "SanDisk Ultra");
        assert_eq!(sdb.size, "14.9G");
        assert!(sdb.removable && sdb.usb);
        assert_eq!(sdb.label(), "/dev/sdb - SanDisk Ultra (14.9G)");

        assert!(!devices[1].usb);
        assert!(devices[2].usb && !devices[2].removable);
    }

    #[test]
    fn reparsing_is_idempotent() {
        assert_eq!(parse_listing(LISTING), parse_listing(LISTING));
    }

    #[test]
    fn malformed_lines_are_skipped_without_aborting() {
        let listing = concat!(
            "NAME=\"sdb\" SIZE=\"14.9G\" MODEL=\"SanDisk\" RM=\"1\" TYPE=\"disk\"\n",
            "NAME=sdc SIZE=\"7.5G\" MODEL=\"Kingston\" RM=\"1\" TYPE=\"disk\" TRAN=\"usb\"\n",
            "garbage\n",
            "\n",
            "NAME=\"\" SIZE=\"7.5G\" MODEL=\"x\" RM=\"1\" TYPE=\"disk\" TRAN=\"usb\"\n",
            "NAME=\"sdd\" SIZE=\"7.5G\" MODEL=\"Kingston\" RM=\"1\" TYPE=\"disk\" TRAN=\"usb\"\n",
        );
        let devices = parse_listing(listing);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path, PathBuf::from("/dev/sdd"));
    }

    #[test]
    fn missing_lister_yields_empty_outcome_with_warning() {
        let outcome = DeviceScanner::new("/nonexistent/lsblk").scan();
        assert!(outcome.devices.is_empty());
        assert!(outcome.warning.is_some());
    }

    #[test]
    fn failing_lister_yields_empty_outcome_with_warning() {
        let outcome = DeviceScanner::new("false").scan();
        assert!(outcome.devices.is_empty());
        assert!(outcome.warning.unwrap().contains("false"));
    }
}
