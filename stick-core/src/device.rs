use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{FlashError, FlashResult};

/// A candidate flash target reported by the device lister.
///
/// Devices are rebuilt from scratch on every scan; nothing about a device is
/// remembered between scans except the selected path held by the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The device file (e.g. `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel name without the `/dev/` prefix (e.g. "sdb").
    pub name: String,
    /// Vendor model string, may be empty.
    pub model: String,
    /// Human-readable size exactly as the lister printed it (e.g. "14.9G").
    pub size: String,
    pub removable: bool,
    pub usb: bool,
    /// The lister's TYPE column ("disk", "part", "rom", ...).
    pub media_type: String,
}

impl Device {
    /// Whether a listed block device may be offered as a flash target.
    pub fn is_eligible(media_type: &str, removable: bool, usb: bool) -> bool {
        media_type == "disk" && (removable || usb)
    }

    /// The combo-box label: `/dev/sdb - SanDisk Ultra (14.9G)`.
    pub fn label(&self) -> String {
        format!("{} - {} ({})", self.path.display(), self.model, self.size)
    }

    pub fn transport(&self) -> &'static str {
        if self.usb { "usb" } else { "other" }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// The image file chosen for flashing, with its size resolved at selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSource {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ImageSource {
    /// Resolves the size of `path`. Fails when the file is missing, unreadable
    /// or not a regular file.
    pub fn open(path: impl AsRef<Path>) -> FlashResult<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|source| FlashError::ImageUnreadable {
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(FlashError::ImageUnreadable {
                path,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }
        Ok(Self {
            path,
            size_bytes: metadata.len(),
        })
    }

    /// The bare file name, used in status lines.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}
