use std::path::Path;

use sysinfo::Disks;
use tracing::debug;

/// Reports free space on the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    /// `None` when the filesystem cannot be determined.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// [`SpaceProbe`] backed by the system disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        // Longest mount point containing the path.
        let disk = disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;

        debug!(
            path = %path.display(),
            mount = %disk.mount_point().display(),
            available = disk.available_space(),
            "disk space"
        );
        Some(disk.available_space())
    }
}

/// Fixed answer, for tests and for filesystems sysinfo cannot see.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub Option<u64>);

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

/// Is there room for a job on a source of `size_bytes`?
///
/// An unknown answer is treated as enough space.
pub fn has_room(available: Option<u64>, size_bytes: u64, margin: f64) -> bool {
    match available {
        Some(available) => available as f64 >= size_bytes as f64 * margin,
        None => true,
    }
}
