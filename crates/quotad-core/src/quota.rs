//! Quota backend client.
//!
//! Every logical quota operation is one invocation of the XFS quota tool in
//! expert mode against the filesystem mounted at the base directory:
//!
//! | Operation | Subcommand |
//! |-----------|------------|
//! | [`QuotaBackend::tag`] | `project -s -p <path> <id>` |
//! | [`QuotaBackend::set_limit`] | `limit -p bhard=<size> <id>` |
//! | [`QuotaBackend::read_usage`] | `report -p -h` |
//! | [`QuotaBackend::read_all_usage`] | `report -p` |
//!
//! Report rows look like `#7  2048  0  4096  00 [------]`: the project id
//! prefixed with `#`, then used, soft limit, hard limit and grace columns.
//! Project `0` is the default project and never reported. Anything the tool
//! writes to stderr is treated as a failure even when it exits zero.
//!
//! Calls await the child process with no timeout of their own; a wedged tool
//! stalls only the task that issued the call.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::units::{UnitError, parse_backend_size};
use crate::ProjectId;

/// Default quota tool binary name, resolved through `PATH`.
pub const DEFAULT_QUOTA_BINARY: &str = "xfs_quota";

/// Project id reserved for the filesystem default project.
pub const DEFAULT_PROJECT_ID: ProjectId = 0;

/// Errors from the quota backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuotaError {
    /// The quota tool could not be started.
    #[error("failed to launch quota tool for `{command}`: {source}")]
    Launch {
        /// Subcommand that was being run.
        command: String,
        /// Underlying spawn error.
        source: std::io::Error,
    },

    /// The quota tool reported a failure.
    #[error("quota tool failed for `{command}`: {message}")]
    Backend {
        /// Subcommand that was being run.
        command: String,
        /// Diagnostic output or exit status.
        message: String,
    },

    /// The project is absent from the report.
    #[error("project {0} not found in quota report")]
    NotFound(ProjectId),

    /// A report row could not be parsed.
    #[error("malformed quota report row {row:?}: {reason}")]
    Parse {
        /// The offending row.
        row: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A size passed to or read from the backend is malformed.
    #[error("invalid quota size: {0}")]
    Size(#[from] UnitError),
}

/// Live usage of one project, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectUsage {
    /// Bytes currently consumed.
    pub used_bytes: u64,
    /// Current hard limit in bytes (0 means unlimited).
    pub limit_bytes: u64,
}

/// One row of the all-projects report, in 1 KiB blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectReport {
    /// Project id (equal to the slot number).
    pub project_id: ProjectId,
    /// Blocks currently consumed.
    pub used_blocks: u64,
    /// Hard limit in blocks.
    pub hard_limit_blocks: u64,
}

/// Logical quota operations.
///
/// Implemented by [`XfsQuota`] in production and by
/// [`crate::testing::FakeQuotaBackend`] in tests.
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    /// Tags `path` with `project` so usage below it is accounted to the
    /// project.
    async fn tag(&self, path: &Path, project: ProjectId) -> Result<(), QuotaError>;

    /// Sets the hard block limit of `project`.
    ///
    /// `limit` is already in the backend unit convention (see
    /// [`crate::units::convert_unit`]).
    async fn set_limit(&self, project: ProjectId, limit: &str) -> Result<(), QuotaError>;

    /// Reads used bytes and hard limit of a single project.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::NotFound`] if the project has no report row.
    async fn read_usage(&self, project: ProjectId) -> Result<ProjectUsage, QuotaError>;

    /// Reads usage of every non-default project.
    async fn read_all_usage(&self) -> Result<Vec<ProjectReport>, QuotaError>;
}

/// [`QuotaBackend`] backed by the `xfs_quota` command line tool.
#[derive(Debug, Clone)]
pub struct XfsQuota {
    binary: PathBuf,
    mount_point: PathBuf,
}

impl XfsQuota {
    /// Creates a client for the filesystem mounted at `mount_point`.
    #[must_use]
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_QUOTA_BINARY),
            mount_point: mount_point.into(),
        }
    }

    /// Overrides the quota tool binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, subcommand: &str) -> Result<String, QuotaError> {
        debug!(
            binary = %self.binary.display(),
            mount_point = %self.mount_point.display(),
            subcommand,
            "running quota tool"
        );

        let output = Command::new(&self.binary)
            .arg("-x")
            .arg("-c")
            .arg(subcommand)
            .arg(&self.mount_point)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| QuotaError::Launch {
                command: subcommand.to_string(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(QuotaError::Backend {
                command: subcommand.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(QuotaError::Backend {
                command: subcommand.to_string(),
                message: format!("exited with code {code}"),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl QuotaBackend for XfsQuota {
    async fn tag(&self, path: &Path, project: ProjectId) -> Result<(), QuotaError> {
        self.run(&format!("project -s -p {} {project}", path.display()))
            .await
            .map(drop)
    }

    async fn set_limit(&self, project: ProjectId, limit: &str) -> Result<(), QuotaError> {
        // Validate before handing the value to the tool.
        parse_backend_size(limit)?;
        self.run(&format!("limit -p bhard={limit} {project}"))
            .await
            .map(drop)
    }

    async fn read_usage(&self, project: ProjectId) -> Result<ProjectUsage, QuotaError> {
        let output = self.run("report -p -h").await?;
        parse_project_usage(&output, project)
    }

    async fn read_all_usage(&self) -> Result<Vec<ProjectReport>, QuotaError> {
        let output = self.run("report -p").await?;
        parse_report(&output)
    }
}

/// Splits a `#`-prefixed report row into its project id and fields.
fn split_row(line: &str) -> Option<Result<(ProjectId, Vec<&str>), QuotaError>> {
    let line = line.trim_start();
    if !line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Some(Err(QuotaError::Parse {
            row: line.to_string(),
            reason: format!("expected at least 4 fields, found {}", fields.len()),
        }));
    }

    let id = fields[0].trim_start_matches('#');
    Some(
        id.parse::<ProjectId>()
            .map(|id| (id, fields))
            .map_err(|e| QuotaError::Parse {
                row: line.to_string(),
                reason: format!("invalid project id {id:?}: {e}"),
            }),
    )
}

/// Parses the block-unit report of every project.
///
/// # Errors
///
/// Returns [`QuotaError::Parse`] if a data row is malformed.
pub fn parse_report(output: &str) -> Result<Vec<ProjectReport>, QuotaError> {
    let mut reports = Vec::new();

    for row in output.lines().filter_map(split_row) {
        let (project_id, fields) = row?;
        if project_id == DEFAULT_PROJECT_ID {
            continue;
        }

        let blocks = |index: usize| {
            fields[index].parse::<u64>().map_err(|e| QuotaError::Parse {
                row: fields.join(" "),
                reason: format!("invalid block count {:?}: {e}", fields[index]),
            })
        };

        reports.push(ProjectReport {
            project_id,
            used_blocks: blocks(1)?,
            hard_limit_blocks: blocks(3)?,
        });
    }

    Ok(reports)
}

/// Finds `project` in a human-readable report and converts its used and
/// hard-limit columns to bytes.
///
/// # Errors
///
/// Returns [`QuotaError::NotFound`] if no row matches, or a parse error if the
/// matching row is malformed.
pub fn parse_project_usage(output: &str, project: ProjectId) -> Result<ProjectUsage, QuotaError> {
    for row in output.lines().filter_map(split_row) {
        let (project_id, fields) = row?;
        if project_id != project {
            continue;
        }
        return Ok(ProjectUsage {
            used_bytes: parse_backend_size(fields[1])?,
            limit_bytes: parse_backend_size(fields[3])?,
        });
    }
    Err(QuotaError::NotFound(project))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_REPORT: &str = "\
Project quota on /data (/dev/sdb1)
                               Blocks
Project ID       Used       Soft       Hard    Warn/Grace
---------- --------------------------------------------------
#0  100  0  100  00 [------]
#7  2048 0  4096  00 [------]
";

    const HUMAN_REPORT: &str = "\
Project quota on /data (/dev/sdb1)
                        Blocks
Project ID   Used   Soft   Hard Warn/Grace
---------- ---------------------------------
#0              0      0      0  00 [------]
#3           1.5G      0    10G  00 [------]
#12             0      0   512M  00 [------]
";

    #[test]
    fn report_skips_default_project() {
        let reports = parse_report(BLOCK_REPORT).unwrap();
        assert_eq!(
            reports,
            vec![ProjectReport {
                project_id: 7,
                used_blocks: 2048,
                hard_limit_blocks: 4096,
            }]
        );
    }

    #[test]
    fn report_ignores_non_data_lines() {
        assert!(parse_report("Project quota on /data\n\n----\n").unwrap().is_empty());
    }

    #[test]
    fn report_rejects_short_rows() {
        let err = parse_report("#4 10 0\n").unwrap_err();
        assert!(matches!(err, QuotaError::Parse { .. }), "{err:?}");
    }

    #[test]
    fn report_rejects_non_numeric_blocks() {
        let err = parse_report("#4 10K 0 20K 00 [------]\n").unwrap_err();
        assert!(matches!(err, QuotaError::Parse { .. }), "{err:?}");
    }

    #[test]
    fn usage_reads_human_units() {
        let usage = parse_project_usage(HUMAN_REPORT, 3).unwrap();
        assert_eq!(usage.used_bytes, (1 << 30) + (1 << 29));
        assert_eq!(usage.limit_bytes, 10 << 30);

        let usage = parse_project_usage(HUMAN_REPORT, 12).unwrap();
        assert_eq!(usage.used_bytes, 0);
        assert_eq!(usage.limit_bytes, 512 << 20);
    }

    #[test]
    fn usage_matches_whole_id_only() {
        // `#1` must not match the `#12` row.
        assert!(matches!(
            parse_project_usage(HUMAN_REPORT, 1),
            Err(QuotaError::NotFound(1))
        ));
    }
}
