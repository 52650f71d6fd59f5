use std::path::{Path, PathBuf};
use tracing::debug;

/// Maps a partition to the disk that holds it (e.g. `/dev/sda1` -> `/dev/sda`,
/// `/dev/nvme0n1p2` -> `/dev/nvme0n1`).
pub(crate) fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        let disk = path_str.trim_end_matches(|c: char| c.is_ascii_digit());
        return PathBuf::from(disk);
    }
    if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            let (disk, part) = path_str.split_at(index);
            if part.len() > 1 && part[1..].chars().all(|c| c.is_ascii_digit()) {
                return PathBuf::from(disk);
            }
        }
    }

    path.to_path_buf()
}

/// The disk that backs the root filesystem, if `sysinfo` reports one.
///
/// Only device-file mounts are considered; overlay or network roots yield
/// `None`.
pub fn system_disk() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let root = disks.iter().find(|d| d.mount_point() == Path::new("/"))?;

    let name = PathBuf::from(root.name());
    let source = if name.is_absolute() {
        name
    } else {
        PathBuf::from("/dev/").join(name)
    };
    if !source.starts_with("/dev/") {
        return None;
    }

    let disk = parent_device_path(&source);
    debug!("Root filesystem lives on {}", disk.display());
    Some(disk)
}
