//! Orchestrator resources as seen by the agent.
//!
//! These are deliberately narrow views of PersistentVolumes and
//! PersistentVolumeClaims: only the fields the reconciler and the quota sync
//! handler read. Mutations are expressed as typed intents ([`VolumeSpec`],
//! [`VolumePatch`], [`ClaimPatch`]) and serialized by the orchestrator client.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ProjectId;

/// Label identifying the node that owns a volume.
pub const NODE_LABEL_KEY: &str = "quotad-node";

/// Claim annotation holding the quota recorded at first bind.
pub const QUOTA_ANNOTATION: &str = "quota";

/// Well-known node label used for volume node affinity.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Access mode of every managed volume.
pub const ACCESS_MODE_READ_WRITE_ONCE: &str = "ReadWriteOnce";

/// Reclaim policy of every managed volume.
///
/// Released volumes are cleaned and reused by the reconciler, so the
/// orchestrator must not delete or recycle them itself.
pub const RECLAIM_POLICY_RETAIN: &str = "Retain";

/// Volume mode of every managed volume.
pub const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";

/// Lifecycle phase of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VolumePhase {
    /// Not yet available for binding.
    #[default]
    Pending,
    /// Free and bindable.
    Available,
    /// Bound to a claim.
    Bound,
    /// Its claim was deleted; awaiting reclamation.
    Released,
    /// Automatic reclamation failed.
    Failed,
}

impl VolumePhase {
    /// Maps an API phase string; unknown values map to `None`.
    #[must_use]
    pub fn from_api(phase: &str) -> Option<Self> {
        match phase {
            "Pending" => Some(Self::Pending),
            "Available" => Some(Self::Available),
            "Bound" => Some(Self::Bound),
            "Released" => Some(Self::Released),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// The API phase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Available => "Available",
            Self::Bound => "Bound",
            Self::Released => "Released",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClaimPhase {
    /// Not yet bound.
    #[default]
    Pending,
    /// Bound to a volume.
    Bound,
    /// Its volume disappeared.
    Lost,
}

impl ClaimPhase {
    /// Maps an API phase string; unknown values map to `None`.
    #[must_use]
    pub fn from_api(phase: &str) -> Option<Self> {
        match phase {
            "Pending" => Some(Self::Pending),
            "Bound" => Some(Self::Bound),
            "Lost" => Some(Self::Lost),
            _ => None,
        }
    }

    /// The API phase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Bound => "Bound",
            Self::Lost => "Lost",
        }
    }
}

impl fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from a volume to the claim bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimRef {
    /// Claim namespace.
    pub namespace: String,
    /// Claim name.
    pub name: String,
}

impl fmt::Display for ClaimRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A persistent volume.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name, `{node}-{slot}` for managed volumes.
    pub name: String,
    /// Volume labels.
    pub labels: BTreeMap<String, String>,
    /// Current phase.
    pub phase: VolumePhase,
    /// Advertised capacity as an orchestrator quantity.
    pub capacity: String,
    /// Claim bound (or previously bound) to this volume.
    pub claim_ref: Option<ClaimRef>,
    /// Host path of a local volume.
    pub local_path: Option<PathBuf>,
    /// Storage class name.
    pub storage_class: Option<String>,
}

impl Volume {
    /// The quota project id (slot) backing this volume.
    ///
    /// Taken from the last component of the local path; volumes without a
    /// local path fall back to the suffix of the name after the last `-`.
    #[must_use]
    pub fn project_id(&self) -> Option<ProjectId> {
        if let Some(path) = &self.local_path {
            return path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse().ok());
        }
        self.name.rsplit('-').next().and_then(|s| s.parse().ok())
    }
}

/// A persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Claim {
    /// Claim namespace.
    pub namespace: String,
    /// Claim name.
    pub name: String,
    /// Requested storage class.
    pub storage_class: Option<String>,
    /// Current phase.
    pub phase: ClaimPhase,
    /// Name of the bound volume.
    pub volume_name: Option<String>,
    /// Requested storage quantity.
    pub requested_storage: Option<String>,
    /// Claim annotations.
    pub annotations: BTreeMap<String, String>,
    /// Opaque version, changes on every update.
    pub resource_version: String,
}

impl Claim {
    /// The recorded quota annotation, if present and non-empty.
    #[must_use]
    pub fn quota_annotation(&self) -> Option<&str> {
        self.annotations
            .get(QUOTA_ANNOTATION)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Reference to this claim.
    #[must_use]
    pub fn claim_ref(&self) -> ClaimRef {
        ClaimRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Everything needed to publish a new managed volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name.
    pub name: String,
    /// Volume labels.
    pub labels: BTreeMap<String, String>,
    /// Advertised capacity.
    pub capacity: String,
    /// Access modes.
    pub access_modes: Vec<String>,
    /// Reclaim policy.
    pub reclaim_policy: String,
    /// Volume mode.
    pub volume_mode: String,
    /// Storage class name.
    pub storage_class: String,
    /// Host path of the managed directory.
    pub local_path: PathBuf,
    /// Node the volume is pinned to via [`HOSTNAME_LABEL`].
    pub node_affinity: String,
}

impl VolumeSpec {
    /// Describes the volume for `slot` on `node`, backed by `slot_path`.
    #[must_use]
    pub fn for_slot(
        node: &str,
        slot: ProjectId,
        slot_path: &Path,
        capacity: &str,
        storage_class: &str,
    ) -> Self {
        Self {
            name: volume_name(node, slot),
            labels: BTreeMap::from([(NODE_LABEL_KEY.to_string(), node.to_string())]),
            capacity: capacity.to_string(),
            access_modes: vec![ACCESS_MODE_READ_WRITE_ONCE.to_string()],
            reclaim_policy: RECLAIM_POLICY_RETAIN.to_string(),
            volume_mode: VOLUME_MODE_FILESYSTEM.to_string(),
            storage_class: storage_class.to_string(),
            local_path: slot_path.to_path_buf(),
            node_affinity: node.to_string(),
        }
    }
}

/// Name of the managed volume for `slot` on `node`.
#[must_use]
pub fn volume_name(node: &str, slot: ProjectId) -> String {
    format!("{node}-{slot}")
}

/// Mutation of an existing volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumePatch {
    /// Removes the claim reference so a Released volume becomes Available.
    ClearClaimRef,
}

/// Mutation of an existing claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimPatch {
    /// Sets the [`QUOTA_ANNOTATION`] annotation.
    SetQuotaAnnotation(String),
}
