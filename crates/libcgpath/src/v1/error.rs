use super::{mount::V1MountPointError, record::RecordError};
use crate::common::JoinSafelyError;

/// Failure to resolve the path of a subsystem. The first three variants are
/// distinct resolution outcomes callers are expected to branch on.
#[derive(thiserror::Error, Debug)]
pub enum PathError {
    /// No cgroup v1 hierarchy is mounted on the host.
    #[error("cgroup mountpoint does not exist")]
    MountPointNotExist,
    /// The target is not a member of a hierarchy for this subsystem.
    #[error("cgroup controller {subsystem} is not active")]
    ControllerNotActive { subsystem: String },
    /// The target is in a non-root cgroup of a hierarchy that is not mounted
    /// anywhere on the host.
    #[error("cannot find cgroup mount destination for {subsystem}")]
    NoCgroupMountDestination { subsystem: String },
    #[error("failed to parse cgroup record: {0}")]
    Record(#[from] RecordError),
    #[error("failed to read mount table: {0}")]
    MountInfo(V1MountPointError),
    #[error("failed to join path: {0}")]
    Join(#[from] JoinSafelyError),
}

impl From<V1MountPointError> for PathError {
    fn from(err: V1MountPointError) -> Self {
        match err {
            V1MountPointError::NotExist => PathError::MountPointNotExist,
            err => PathError::MountInfo(err),
        }
    }
}
