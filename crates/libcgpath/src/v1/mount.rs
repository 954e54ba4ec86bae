use std::path::{Path, PathBuf};

use procfs::process::{MountInfo, Process};
use procfs::ProcError;

use super::error::PathError;
use crate::common::{clean_rooted, PathBufExt};

const CGROUP_FS_TYPE: &str = "cgroup";
const CGROUP2_FS_TYPE: &str = "cgroup2";
const NAMED_HIERARCHY_OPTION: &str = "name";

// Superblock flags a cgroup v1 mount may carry next to its controllers.
const GENERIC_OPTIONS: &[&str] = &[
    "rw",
    "ro",
    "xattr",
    "clone_children",
    "noprefix",
    "cpuset_v2_mode",
    "favordynmods",
    "nofavordynmods",
];

#[derive(thiserror::Error, Debug)]
pub enum V1MountPointError {
    #[error("failed to read process info from /proc/self: {0}")]
    ReadSelf(ProcError),
    #[error("failed to get mountinfo: {0}")]
    MountInfo(ProcError),
    #[error("cgroup mountpoint does not exist")]
    NotExist,
}

/// A mounted cgroup v1 hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupMount {
    /// Directory on the host the hierarchy is mounted on.
    pub mount_point: PathBuf,
    /// Path inside the hierarchy that is visible at `mount_point`. This is
    /// `/` unless the hierarchy was bind mounted from a nested cgroup.
    pub root: PathBuf,
    /// Controllers and named hierarchies (`name=...`) comounted here.
    pub subsystems: Vec<String>,
}

impl CgroupMount {
    fn from_mount_info(info: &MountInfo) -> Self {
        let mut subsystems: Vec<String> = info
            .super_options
            .iter()
            .filter_map(|(key, value)| match value {
                Some(name) if key == NAMED_HIERARCHY_OPTION => {
                    Some(format!("{NAMED_HIERARCHY_OPTION}={name}"))
                }
                Some(_) => None,
                None if GENERIC_OPTIONS.contains(&key.as_str()) => None,
                None => Some(key.to_owned()),
            })
            .collect();
        subsystems.sort();

        Self {
            mount_point: info.mount_point.clone(),
            root: PathBuf::from(&info.root),
            subsystems,
        }
    }

    pub fn has_subsystem(&self, subsystem: &str) -> bool {
        self.subsystems.iter().any(|s| s == subsystem)
    }
}

/// Snapshot of the cgroup mounts of the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    mounts: Vec<CgroupMount>,
    unified: Option<PathBuf>,
}

impl MountTable {
    pub fn from_mount_infos<I: IntoIterator<Item = MountInfo>>(mount_infos: I) -> Self {
        let mut table = MountTable::default();
        for info in mount_infos {
            match info.fs_type.as_str() {
                CGROUP_FS_TYPE => table.mounts.push(CgroupMount::from_mount_info(&info)),
                CGROUP2_FS_TYPE if table.unified.is_none() => {
                    table.unified = Some(info.mount_point)
                }
                _ => {}
            }
        }

        table
    }

    pub fn mounts(&self) -> &[CgroupMount] {
        &self.mounts
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// All subsystem names with a v1 mount, comounted ones listed individually.
    pub fn subsystems(&self) -> impl Iterator<Item = &str> {
        self.mounts
            .iter()
            .flat_map(|m| m.subsystems.iter().map(String::as_str))
    }

    pub fn find(&self, subsystem: &str) -> Option<&CgroupMount> {
        self.mounts.iter().find(|m| m.has_subsystem(subsystem))
    }

    /// Host directory the hierarchy of `subsystem` is mounted on.
    pub fn mount_point(&self, subsystem: &str) -> Option<&Path> {
        self.find(subsystem).map(|m| m.mount_point.as_path())
    }

    /// Path inside the hierarchy of `subsystem` that its mount exposes.
    pub fn destination(&self, subsystem: &str) -> Option<&Path> {
        self.find(subsystem).map(|m| m.root.as_path())
    }

    /// Directory holding the v1 hierarchies, e.g. `/sys/fs/cgroup`.
    pub fn v1_root(&self) -> Option<&Path> {
        self.mounts.first().and_then(|m| m.mount_point.parent())
    }

    pub fn unified_mount(&self) -> Option<&Path> {
        self.unified.as_deref()
    }

    pub fn has_unified(&self) -> bool {
        self.unified.is_some()
    }

    /// Joins a cgroup path, as resolved by a [`PathStrategy`](super::PathStrategy),
    /// under the mount point of `subsystem`.
    pub fn host_path<P: AsRef<Path>>(
        &self,
        subsystem: &str,
        cgroup_path: P,
    ) -> Result<PathBuf, PathError> {
        if self.is_empty() {
            return Err(PathError::MountPointNotExist);
        }

        let mount_point = self
            .mount_point(subsystem)
            .or_else(|| self.mount_point(&format!("{NAMED_HIERARCHY_OPTION}={subsystem}")))
            .ok_or_else(|| PathError::NoCgroupMountDestination {
                subsystem: subsystem.to_owned(),
            })?;

        Ok(mount_point.join_safely(clean_rooted(cgroup_path))?)
    }
}

/// Reads the mount table of the current process. Fails with
/// [`V1MountPointError::NotExist`] when no cgroup v1 hierarchy is mounted,
/// which is the normal state of a cgroup v2 only host.
pub fn list_subsystem_mounts() -> Result<MountTable, V1MountPointError> {
    tracing::debug!("scan mountinfo for cgroup mounts");
    let mount_infos = Process::myself()
        .map_err(V1MountPointError::ReadSelf)?
        .mountinfo()
        .map_err(V1MountPointError::MountInfo)?;

    let table = MountTable::from_mount_infos(mount_infos);
    if table.is_empty() {
        return Err(V1MountPointError::NotExist);
    }

    Ok(table)
}

/// Directory the cgroup v1 hierarchies are mounted under.
pub fn v1_mount_point() -> Result<PathBuf, V1MountPointError> {
    list_subsystem_mounts()?
        .v1_root()
        .map(Path::to_path_buf)
        .ok_or(V1MountPointError::NotExist)
}
