use std::path::{Path, PathBuf};

use sysinfo::Disks;

pub trait SpaceProbe: Send + Sync {
    /// Free bytes on the volume holding `path`, `None` when it can't be told.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Free space is read, not reserved; a concurrent writer can still fill the
/// volume between the check and the write.
pub fn has_space(probe: &dyn SpaceProbe, path: &Path, required: u64) -> bool {
    match probe.available_space(path) {
        Some(free) => free > required,
        None => {
            tracing::error!("[disk] free space unknown for {}", path.display());
            false
        }
    }
}

pub struct SysinfoSpace;

impl SpaceProbe for SysinfoSpace {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let target = existing_ancestor(path);
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(p) = current {
        if let Ok(canonical) = std::fs::canonicalize(p) {
            return canonical;
        }
        current = p.parent();
    }
    path.to_path_buf()
}
