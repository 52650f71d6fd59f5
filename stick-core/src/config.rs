//! Runtime configuration for the external tools stick drives.
//!
//! There is no configuration file. Defaults describe a stock Linux desktop
//! (util-linux `lsblk`, coreutils `dd`, polkit `pkexec`, `eject`); front-ends
//! override individual fields from their own flags.

use std::path::{Path, PathBuf};

/// Default `dd` block size.
pub const DEFAULT_BLOCK_SIZE: &str = "4M";

/// Device paths that are conventionally the host's own system disk.
pub const DEFAULT_HIGH_RISK_DEVICES: &[&str] = &["/dev/sda"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    /// Block device lister, invoked as `<lister> -P -d -o NAME,SIZE,MODEL,RM,TYPE,TRAN`.
    pub lister: String,
    /// Block copy tool, invoked as `<copy_tool> if=.. of=.. bs=.. status=progress conv=fsync`.
    pub copy_tool: String,
    pub block_size: String,
    /// Argv prefix placed in front of the copy command. Empty runs the copy
    /// directly.
    pub elevation: Vec<String>,
    pub eject_tool: String,
    /// Targets that need the extra warning before the regular confirmation.
    pub high_risk_devices: Vec<PathBuf>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            lister: "lsblk".to_string(),
            copy_tool: "dd".to_string(),
            block_size: DEFAULT_BLOCK_SIZE.to_string(),
            elevation: vec!["pkexec".to_string()],
            eject_tool: "eject".to_string(),
            high_risk_devices: DEFAULT_HIGH_RISK_DEVICES.iter().map(PathBuf::from).collect(),
        }
    }
}

impl FlashConfig {
    /// Adds a high-risk device unless it is already listed.
    pub fn add_high_risk(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.high_risk_devices.contains(&path) {
            self.high_risk_devices.push(path);
        }
    }

    /// Adds the disk backing `/`, when the platform can tell which one it is.
    pub fn with_system_disk(mut self) -> Self {
        if let Some(disk) = crate::platform::system_disk() {
            self.add_high_risk(disk);
        }
        self
    }

    pub fn is_high_risk(&self, device: &Path) -> bool {
        self.high_risk_devices.iter().any(|p| p == device)
    }
}
