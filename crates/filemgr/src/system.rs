//! Disk usage reporting.

use std::fmt;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use tracing::debug;

/// Space usage of the filesystem holding `path`, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUsage {
    pub path: PathBuf,
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl fmt::Display for DiskUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Path: {}  total={} used={} free={}",
            self.path.display(),
            self.total,
            self.used,
            self.free
        )
    }
}

/// Usage of the filesystem holding `path`, or `None` if it cannot be read.
pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
    let stat = match statvfs(path) {
        Ok(stat) => stat,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to stat filesystem");
            return None;
        }
    };

    #[allow(clippy::useless_conversion)]
    let fragment_size = u64::from(stat.fragment_size());
    #[allow(clippy::useless_conversion)]
    let (blocks, blocks_free, blocks_available) = (
        u64::from(stat.blocks()),
        u64::from(stat.blocks_free()),
        u64::from(stat.blocks_available()),
    );

    Some(DiskUsage {
        path: path.to_path_buf(),
        total: blocks.saturating_mul(fragment_size),
        used: blocks.saturating_sub(blocks_free).saturating_mul(fragment_size),
        // Space available to unprivileged users
        free: blocks_available.saturating_mul(fragment_size),
    })
}

/// Usage for the storage root and the system root, skipping unreadable
/// mounts.
pub fn disk_stats(storage_root: &Path) -> Vec<DiskUsage> {
    [storage_root, Path::new("/")]
        .into_iter()
        .filter_map(disk_usage)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disk_stats_reports_root_and_storage() {
        let temp = TempDir::new().unwrap();
        let stats = disk_stats(temp.path());

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].path, temp.path());
        assert_eq!(stats[1].path, Path::new("/"));
        for usage in &stats {
            assert!(usage.used <= usage.total);
            assert!(usage.free <= usage.total);
        }
    }

    #[test]
    fn test_disk_usage_missing_path() {
        assert!(disk_usage(Path::new("/definitely/not/here")).is_none());
    }

    #[test]
    fn test_display() {
        let usage = DiskUsage {
            path: PathBuf::from("/data"),
            total: 100,
            used: 40,
            free: 60,
        };
        assert_eq!(usage.to_string(), "Path: /data  total=100 used=40 free=60");
    }
}
