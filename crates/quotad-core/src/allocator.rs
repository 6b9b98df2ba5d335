//! Directory allocator.
//!
//! Managed directories live directly under the base directory and are named
//! by their slot number (`{base_dir}/{slot}`); the slot is also the quota
//! project id. Slots are handed out in increasing order above the highest
//! slot present on disk. The only way the high-water mark moves down is
//! [`DirectoryAllocator::withdraw`], the compensating step for an allocation
//! whose volume could not be published.
//!
//! The allocator is owned by a single task and is not shared.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ProjectId;
use crate::quota::{QuotaBackend, QuotaError};

/// Permission bits of a freshly allocated directory.
const SLOT_DIR_MODE: u32 = 0o755;

/// Errors from directory allocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocatorError {
    /// Filesystem operation failed.
    #[error("allocator I/O error: {context}: {source}")]
    Io {
        /// Description of what was being attempted.
        context: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The directory was created but could not be tagged with its project.
    ///
    /// The slot remains allocated; the caller is expected to withdraw it.
    #[error("failed to tag slot {slot} with its quota project: {source}")]
    Tag {
        /// The allocated slot.
        slot: ProjectId,
        /// Backend failure.
        source: QuotaError,
    },

    /// Only the most recently allocated slot can be withdrawn.
    #[error("cannot withdraw slot {slot}: latest allocated slot is {latest}")]
    NotLatest {
        /// Slot the caller asked to withdraw.
        slot: ProjectId,
        /// Current high-water mark.
        latest: ProjectId,
    },

    /// The slot counter cannot advance any further.
    #[error("slot counter exhausted at {0}")]
    Exhausted(ProjectId),
}

impl AllocatorError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Allocates, withdraws and cleans managed directories.
#[derive(Debug)]
pub struct DirectoryAllocator {
    base_dir: PathBuf,
    latest: ProjectId,
}

impl DirectoryAllocator {
    /// Rebuilds the allocator from the contents of `base_dir`.
    ///
    /// The high-water mark is the largest numeric directory name, or 0 if
    /// there is none. Other entries are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::Io`] if `base_dir` cannot be read.
    pub fn recover(base_dir: impl Into<PathBuf>) -> Result<Self, AllocatorError> {
        let base_dir = base_dir.into();
        let entries = fs::read_dir(&base_dir).map_err(|e| {
            AllocatorError::io(format!("reading base dir {}", base_dir.display()), e)
        })?;

        let mut latest = 0;
        for entry in entries {
            let entry = entry.map_err(|e| {
                AllocatorError::io(format!("reading base dir {}", base_dir.display()), e)
            })?;
            let name = entry.file_name();
            let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
            let slot = name.to_str().and_then(|s| s.parse::<ProjectId>().ok());

            match slot {
                Some(slot) if is_dir => latest = latest.max(slot),
                _ => warn!(
                    entry = %name.to_string_lossy(),
                    base_dir = %base_dir.display(),
                    "unexpected entry in base dir, ignoring"
                ),
            }
        }

        info!(base_dir = %base_dir.display(), latest, "recovered directory allocator");
        Ok(Self { base_dir, latest })
    }

    /// The highest slot currently allocated (0 if none).
    #[must_use]
    pub const fn latest(&self) -> ProjectId {
        self.latest
    }

    /// Path of the directory backing `slot`.
    #[must_use]
    pub fn slot_path(&self, slot: ProjectId) -> PathBuf {
        self.base_dir.join(slot.to_string())
    }

    /// Creates the next slot directory and tags it with its project id.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::Io`] if the directory could not be created; nothing
    ///   was allocated.
    /// - [`AllocatorError::Tag`] if tagging failed; the slot *is* allocated and
    ///   should be withdrawn by the caller.
    pub async fn allocate(&mut self, backend: &dyn QuotaBackend) -> Result<ProjectId, AllocatorError> {
        let slot = self
            .latest
            .checked_add(1)
            .ok_or(AllocatorError::Exhausted(self.latest))?;
        let path = self.slot_path(slot);

        DirBuilder::new()
            .mode(SLOT_DIR_MODE)
            .create(&path)
            .map_err(|e| AllocatorError::io(format!("creating {}", path.display()), e))?;
        self.latest = slot;

        backend
            .tag(&path, slot)
            .await
            .map_err(|source| AllocatorError::Tag { slot, source })?;

        debug!(slot, path = %path.display(), "allocated slot");
        Ok(slot)
    }

    /// Removes the most recently allocated slot and lowers the high-water
    /// mark. The directory must be empty.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::NotLatest`] if `slot` is not the latest
    /// allocation, or [`AllocatorError::Io`] if the directory could not be
    /// removed; the high-water mark is unchanged in both cases.
    pub fn withdraw(&mut self, slot: ProjectId) -> Result<(), AllocatorError> {
        if slot == 0 || slot != self.latest {
            return Err(AllocatorError::NotLatest {
                slot,
                latest: self.latest,
            });
        }

        let path = self.slot_path(slot);
        fs::remove_dir(&path)
            .map_err(|e| AllocatorError::io(format!("removing {}", path.display()), e))?;
        self.latest -= 1;

        debug!(slot, "withdrew slot");
        Ok(())
    }

    /// Deletes everything inside the slot directory, keeping the directory
    /// itself (and therefore its project tag).
    ///
    /// Symlinks are removed, never followed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::Io`] if the directory cannot be listed or an
    /// entry cannot be removed. Entries removed before the failure stay
    /// removed.
    pub fn clean(&self, slot: ProjectId) -> Result<(), AllocatorError> {
        let path = self.slot_path(slot);
        let entries = fs::read_dir(&path)
            .map_err(|e| AllocatorError::io(format!("listing {}", path.display()), e))?;

        for entry in entries {
            let entry =
                entry.map_err(|e| AllocatorError::io(format!("listing {}", path.display()), e))?;
            let target = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| AllocatorError::io(format!("inspecting {}", target.display()), e))?;

            let removed = if file_type.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            removed.map_err(|e| AllocatorError::io(format!("removing {}", target.display()), e))?;
        }

        debug!(slot, "cleaned slot");
        Ok(())
    }
}
