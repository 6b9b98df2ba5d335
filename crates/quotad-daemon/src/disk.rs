//! Data disk inspection: capacity of the base directory's filesystem and
//! I/O counters of the block device backing it.

use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use quotad_core::units::Quantity;
use thiserror::Error;

/// Sector size `/proc/diskstats` counts in, independent of the device.
const DISKSTATS_SECTOR_SIZE: u64 = 512;

/// Errors from disk inspection.
#[derive(Debug, Error)]
pub enum DiskError {
    /// A file under the proc filesystem could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// `statvfs` failed.
    #[error("statvfs({path}) failed: {source}")]
    Statvfs {
        /// Path being inspected.
        path: PathBuf,
        /// Underlying errno.
        source: nix::Error,
    },
}

/// Cumulative I/O counters of one block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskStats {
    /// Reads completed.
    pub read_count: u64,
    /// Writes completed.
    pub write_count: u64,
    /// Bytes read.
    pub read_bytes: u64,
    /// Bytes written.
    pub write_bytes: u64,
    /// Milliseconds spent reading.
    pub read_time_ms: u64,
    /// Milliseconds spent writing.
    pub write_time_ms: u64,
}

/// Total size of the filesystem holding `path`, rounded down to whole GiB.
pub fn filesystem_capacity(path: &Path) -> Result<Quantity, DiskError> {
    let stat = statvfs(path).map_err(|source| DiskError::Statvfs {
        path: path.to_path_buf(),
        source,
    })?;
    let total = u64::from(stat.blocks()).saturating_mul(u64::from(stat.fragment_size()));
    Ok(Quantity::from_gibibytes(total >> 30))
}

/// Name (without `/dev/`) of the device mounted at `mount_point`, from the
/// contents of `/proc/mounts`. The last matching mount wins.
#[must_use]
pub fn device_for_mount(mounts: &str, mount_point: &Path) -> Option<String> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?, fields.next()?))
        })
        .filter(|(_, target)| Path::new(target) == mount_point)
        .last()
        .and_then(|(device, _)| Path::new(device).file_name())
        .map(|name| name.to_string_lossy().into_owned())
}

/// Counters of `device` from the contents of `/proc/diskstats`.
#[must_use]
pub fn parse_diskstats(content: &str, device: &str) -> Option<DiskStats> {
    content.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 11 || fields[2] != device {
            return None;
        }
        let field = |index: usize| fields[index].parse::<u64>().ok();
        Some(DiskStats {
            read_count: field(3)?,
            read_bytes: field(5)?.saturating_mul(DISKSTATS_SECTOR_SIZE),
            read_time_ms: field(6)?,
            write_count: field(7)?,
            write_bytes: field(9)?.saturating_mul(DISKSTATS_SECTOR_SIZE),
            write_time_ms: field(10)?,
        })
    })
}

/// Reader of the proc filesystem files disk inspection needs.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    /// Reads proc files below `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read(&self, name: &str) -> Result<String, DiskError> {
        let path = self.root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| DiskError::Io { path, source })
    }

    /// Device mounted at `mount_point`, if any.
    pub async fn mount_device(&self, mount_point: &Path) -> Result<Option<String>, DiskError> {
        Ok(device_for_mount(&self.read("mounts").await?, mount_point))
    }

    /// Current counters of `device`, if it is listed.
    pub async fn disk_stats(&self, device: &str) -> Result<Option<DiskStats>, DiskError> {
        Ok(parse_diskstats(&self.read("diskstats").await?, device))
    }
}
