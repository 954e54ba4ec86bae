use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use super::{
    error::PathError,
    mount::{self, MountTable},
    record::{self, CgroupRecord},
};
use crate::common::{clean_rooted, PathBufExt, CGROUP_FILE, DEFAULT_PROC_ROOT};

/// Resolves the cgroup path of a target for a given subsystem. The returned
/// path is relative to the root of the subsystem's hierarchy; use
/// [`MountTable::host_path`] to place it on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStrategy {
    /// A fixed path, returned for every subsystem.
    Static(PathBuf),
    /// The root of every hierarchy.
    Root,
    /// `suffix` below the cgroups of the calling process.
    Nested { suffix: PathBuf, proc_root: PathBuf },
    /// The cgroups of another process.
    Pid { pid: Pid, proc_root: PathBuf },
    /// The cgroups listed in an already parsed record, with an optional suffix.
    Existing {
        record: CgroupRecord,
        suffix: Option<PathBuf>,
    },
}

impl PathStrategy {
    pub fn static_path<P: Into<PathBuf>>(path: P) -> Self {
        Self::Static(path.into())
    }

    pub fn root() -> Self {
        Self::Root
    }

    pub fn nested<P: Into<PathBuf>>(suffix: P) -> Self {
        Self::nested_with_proc_root(suffix, DEFAULT_PROC_ROOT)
    }

    pub fn nested_with_proc_root<P: Into<PathBuf>, R: Into<PathBuf>>(
        suffix: P,
        proc_root: R,
    ) -> Self {
        Self::Nested {
            suffix: suffix.into(),
            proc_root: proc_root.into(),
        }
    }

    pub fn pid(pid: Pid) -> Self {
        Self::pid_with_proc_root(pid, DEFAULT_PROC_ROOT)
    }

    pub fn pid_with_proc_root<R: Into<PathBuf>>(pid: Pid, proc_root: R) -> Self {
        Self::Pid {
            pid,
            proc_root: proc_root.into(),
        }
    }

    pub fn existing(record: CgroupRecord) -> Self {
        Self::Existing {
            record,
            suffix: None,
        }
    }

    pub fn existing_with_suffix<P: Into<PathBuf>>(record: CgroupRecord, suffix: P) -> Self {
        Self::Existing {
            record,
            suffix: Some(suffix.into()),
        }
    }

    /// Resolves `subsystem` against the current mount table of the host.
    pub fn path<S: AsRef<str>>(&self, subsystem: S) -> Result<PathBuf, PathError> {
        match self {
            Self::Static(path) => Ok(path.clone()),
            Self::Root => Ok(PathBuf::from("/")),
            _ => {
                let mounts = mount::list_subsystem_mounts()?;
                self.path_in(&mounts, subsystem)
            }
        }
    }

    /// Resolves `subsystem` against a mount table owned by the caller.
    pub fn path_in<S: AsRef<str>>(
        &self,
        mounts: &MountTable,
        subsystem: S,
    ) -> Result<PathBuf, PathError> {
        let subsystem = subsystem.as_ref();
        tracing::debug!("resolve {} path with {:?}", subsystem, self);

        match self {
            Self::Static(path) => Ok(path.clone()),
            Self::Root => Ok(PathBuf::from("/")),
            Self::Nested { suffix, proc_root } => {
                let record = record::parse_cgroup_file(proc_root.join("self").join(CGROUP_FILE))?;
                existing_path(&record, Some(suffix), mounts, subsystem)
            }
            Self::Pid { pid, proc_root } => {
                let record = record::parse_cgroup_file(
                    proc_root.join(pid.to_string()).join(CGROUP_FILE),
                )?;
                existing_path(&record, None, mounts, subsystem)
            }
            Self::Existing { record, suffix } => {
                existing_path(record, suffix.as_deref(), mounts, subsystem)
            }
        }
    }
}

fn existing_path(
    record: &CgroupRecord,
    suffix: Option<&Path>,
    mounts: &MountTable,
    subsystem: &str,
) -> Result<PathBuf, PathError> {
    let paths = localize(record, mounts)?;
    let root = paths
        .get(subsystem)
        .or_else(|| paths.get(&format!("name={subsystem}")))
        .ok_or_else(|| PathError::ControllerNotActive {
            subsystem: subsystem.to_owned(),
        })?;

    match suffix {
        Some(suffix) if !suffix.as_os_str().is_empty() => {
            Ok(clean_rooted(root.join_safely(suffix)?))
        }
        _ => Ok(root.clone()),
    }
}

/// Rewrites every recorded path relative to the part of its hierarchy that
/// is actually mounted. Hierarchies without a mount are dropped when the
/// target sits at their root and fail the resolution otherwise.
fn localize(
    record: &CgroupRecord,
    mounts: &MountTable,
) -> Result<HashMap<String, PathBuf>, PathError> {
    let mut entries: Vec<(&str, &Path)> = record.subsystems().collect();
    entries.sort_unstable_by_key(|(subsystem, _)| *subsystem);

    let mut paths = HashMap::with_capacity(entries.len());
    for (subsystem, path) in entries {
        let dest = match mounts.destination(subsystem) {
            Some(dest) => dest,
            None if path == Path::new("/") => {
                tracing::debug!("hierarchy {} is not mounted, treating it as inactive", subsystem);
                continue;
            }
            None => {
                return Err(PathError::NoCgroupMountDestination {
                    subsystem: subsystem.to_owned(),
                })
            }
        };

        let local = if path == dest {
            clean_rooted(dest)
        } else {
            match path.strip_prefix(dest) {
                Ok(rel) => clean_rooted(rel),
                Err(_) => clean_rooted(path),
            }
        };
        paths.insert(subsystem.to_owned(), local);
    }

    Ok(paths)
}

/// Serializable choice of a [`PathStrategy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathConfig {
    Static { path: PathBuf },
    Root,
    Nested { suffix: PathBuf },
    Pid { pid: i32 },
}

impl From<PathConfig> for PathStrategy {
    fn from(config: PathConfig) -> Self {
        match config {
            PathConfig::Static { path } => PathStrategy::static_path(path),
            PathConfig::Root => PathStrategy::root(),
            PathConfig::Nested { suffix } => PathStrategy::nested(suffix),
            PathConfig::Pid { pid } => PathStrategy::pid(Pid::from_raw(pid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{cgroup_mount, set_fixture, systemd_host_mounts};
    use crate::v1::ControllerType;

    const SYSTEMD_240: &str = "8:net_cls:/
        7:memory:/system.slice/docker.service
        6:freezer:/
        5:blkio:/system.slice/docker.service
        4:devices:/system.slice/docker.service
        3:cpuset:/
        2:cpu,cpuacct:/system.slice/docker.service
        1:name=systemd:/system.slice/docker.service
        0::/system.slice/docker.service";

    fn host() -> MountTable {
        MountTable::from_mount_infos(systemd_host_mounts())
    }

    fn record(extra: &str) -> CgroupRecord {
        format!("{extra}\n{SYSTEMD_240}").parse().unwrap()
    }

    #[test]
    fn test_static_path() {
        let path = PathStrategy::static_path("test");
        assert_eq!(path.path("").unwrap(), PathBuf::from("test"));
        assert_eq!(
            path.path_in(&MountTable::default(), "memory").unwrap(),
            PathBuf::from("test")
        );
    }

    quickcheck! {
        fn property_static_path_ignores_subsystem(path: String, subsystem: String) -> bool {
            let strategy = PathStrategy::static_path(&path);
            matches!(strategy.path(&subsystem), Ok(p) if p == PathBuf::from(&path))
        }
    }

    #[test]
    fn test_root_path() {
        let path = PathStrategy::root();
        for controller in crate::v1::controller_type::CONTROLLERS {
            assert_eq!(path.path(controller).unwrap(), PathBuf::from("/"));
        }
        assert_eq!(
            path.path_in(&MountTable::default(), "name=systemd").unwrap(),
            PathBuf::from("/")
        );
    }

    #[test]
    fn test_controller_not_in_record() {
        let path = PathStrategy::existing(SYSTEMD_240.parse().unwrap());
        let result = path.path_in(&host(), ControllerType::NetworkPriority);
        assert!(
            matches!(
                result,
                Err(PathError::ControllerNotActive { ref subsystem }) if subsystem == "net_prio"
            ),
            "unexpected result {result:?}"
        );
    }

    #[test]
    fn test_valid_unmounted_cgroup_hierarchy() {
        let path = PathStrategy::existing(record("9:name=previously-unmounted-hierarchy:/"));

        assert_eq!(
            path.path_in(&host(), "memory").unwrap(),
            PathBuf::from("/system.slice/docker.service")
        );

        let result = path.path_in(&host(), "name=previously-unmounted-hierarchy");
        assert!(
            matches!(result, Err(PathError::ControllerNotActive { .. })),
            "unexpected result {result:?}"
        );
    }

    #[test]
    fn test_mountpoint_not_found() {
        let path = PathStrategy::existing(record(
            "9:name=unknown-hierarchy:/nonroot.slice/docker.service",
        ));
        let result = path.path_in(&host(), "memory");
        assert!(
            matches!(
                result,
                Err(PathError::NoCgroupMountDestination { ref subsystem })
                    if subsystem == "name=unknown-hierarchy"
            ),
            "unexpected result {result:?}"
        );
    }

    #[test]
    fn test_no_mounts_at_all() {
        let path = PathStrategy::existing(SYSTEMD_240.parse().unwrap());
        let result = path.path_in(&MountTable::default(), "memory");
        assert!(
            matches!(result, Err(PathError::NoCgroupMountDestination { .. })),
            "unexpected result {result:?}"
        );
    }

    #[test]
    fn test_named_hierarchy_fallback() {
        let path = PathStrategy::existing(SYSTEMD_240.parse().unwrap());
        assert_eq!(
            path.path_in(&host(), "systemd").unwrap(),
            path.path_in(&host(), "name=systemd").unwrap()
        );
    }

    #[test]
    fn test_repeated_resolution_is_stable() {
        let path = PathStrategy::existing(SYSTEMD_240.parse().unwrap());
        let table = host();
        let first = path.path_in(&table, "cpuacct").unwrap();
        let second = path.path_in(&table, "cpuacct").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, PathBuf::from("/system.slice/docker.service"));
    }

    #[test]
    fn test_existing_with_suffix() {
        let path = PathStrategy::existing_with_suffix(SYSTEMD_240.parse().unwrap(), "/ctr");
        assert_eq!(
            path.path_in(&host(), "blkio").unwrap(),
            PathBuf::from("/system.slice/docker.service/ctr")
        );
        assert_eq!(path.path_in(&host(), "cpuset").unwrap(), PathBuf::from("/ctr"));
    }

    #[test]
    fn test_suffix_cannot_leave_hierarchy_root() {
        let record: CgroupRecord = "7:memory:/system.slice/docker.service".parse().unwrap();
        let path = PathStrategy::existing_with_suffix(record, "../../../../etc");

        let resolved = path.path_in(&host(), "memory").unwrap();
        assert_eq!(resolved.to_str(), Some("/etc"));
        assert_eq!(
            host().host_path("memory", &resolved).unwrap().to_str(),
            Some("/sys/fs/cgroup/memory/etc")
        );

        let path = PathStrategy::existing_with_suffix(SYSTEMD_240.parse().unwrap(), "./ctr/../app");
        assert_eq!(
            path.path_in(&host(), "devices").unwrap().to_str(),
            Some("/system.slice/docker.service/app")
        );
    }

    #[test]
    fn test_empty_suffix_is_not_joined() {
        let path = PathStrategy::existing_with_suffix(SYSTEMD_240.parse().unwrap(), "");
        assert_eq!(
            path.path_in(&host(), "memory").unwrap().to_str(),
            Some("/system.slice/docker.service")
        );

        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "self/cgroup", SYSTEMD_240).unwrap();
        let path = PathStrategy::nested_with_proc_root("", tmp.path());
        assert_eq!(
            path.path_in(&host(), "blkio").unwrap().to_str(),
            Some("/system.slice/docker.service")
        );
    }

    #[test]
    fn test_first_unmounted_hierarchy_is_reported() {
        let record: CgroupRecord = "11:name=zeta:/z.slice
            10:name=alpha:/a.slice
            9:name=mid:/m.slice
            7:memory:/system.slice/docker.service"
            .parse()
            .unwrap();
        let path = PathStrategy::existing(record);

        for _ in 0..16 {
            let result = path.path_in(&host(), "memory");
            assert!(
                matches!(
                    result,
                    Err(PathError::NoCgroupMountDestination { ref subsystem })
                        if subsystem == "name=alpha"
                ),
                "unexpected result {result:?}"
            );
        }
    }

    #[test]
    fn test_path_reads_live_mount_table() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "self/cgroup", SYSTEMD_240).unwrap();
        set_fixture(tmp.path(), "4242/cgroup", SYSTEMD_240).unwrap();

        let strategies = [
            PathStrategy::nested_with_proc_root("test", tmp.path()),
            PathStrategy::pid_with_proc_root(Pid::from_raw(4242), tmp.path()),
            PathStrategy::existing(SYSTEMD_240.parse().unwrap()),
        ];

        let live = mount::list_subsystem_mounts();
        for strategy in &strategies {
            let result = strategy.path("memory");
            match &live {
                Err(mount::V1MountPointError::NotExist) => assert!(
                    matches!(result, Err(PathError::MountPointNotExist)),
                    "unexpected result {result:?}"
                ),
                Err(err) => panic!("failed to read mount table: {err}"),
                Ok(mounts) => {
                    let expected = strategy.path_in(mounts, "memory");
                    assert_eq!(
                        result.as_ref().ok(),
                        expected.as_ref().ok(),
                        "live {result:?} and explicit {expected:?} differ"
                    );
                }
            }
        }
    }

    #[test]
    fn test_localize_against_nested_mount() {
        let table = MountTable::from_mount_infos(vec![
            cgroup_mount("/sys/fs/cgroup/memory", "/docker/4a3b", "rw,memory"),
            cgroup_mount("/sys/fs/cgroup/pids", "/docker/4a3b", "rw,pids"),
            cgroup_mount("/sys/fs/cgroup/cpu", "/", "rw,cpu"),
        ]);
        let record: CgroupRecord =
            "3:memory:/docker/4a3b/app\n2:pids:/docker/4a3b\n1:cpu:/elsewhere"
                .parse()
                .unwrap();
        let path = PathStrategy::existing(record);

        assert_eq!(path.path_in(&table, "memory").unwrap(), PathBuf::from("/app"));
        assert_eq!(
            path.path_in(&table, "pids").unwrap(),
            PathBuf::from("/docker/4a3b")
        );
        assert_eq!(path.path_in(&table, "cpu").unwrap(), PathBuf::from("/elsewhere"));
    }

    #[test]
    fn test_nested_path() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "self/cgroup", SYSTEMD_240).unwrap();

        let path = PathStrategy::nested_with_proc_root("test", tmp.path());
        assert_eq!(
            path.path_in(&host(), "devices").unwrap(),
            PathBuf::from("/system.slice/docker.service/test")
        );
        assert_eq!(path.path_in(&host(), "freezer").unwrap(), PathBuf::from("/test"));
    }

    #[test]
    fn test_pid_path() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "4242/cgroup", SYSTEMD_240).unwrap();

        let path = PathStrategy::pid_with_proc_root(Pid::from_raw(4242), tmp.path());
        assert_eq!(
            path.path_in(&host(), "devices").unwrap(),
            PathBuf::from("/system.slice/docker.service")
        );
        assert!(matches!(
            path.path_in(&host(), "hugetlb"),
            Err(PathError::ControllerNotActive { .. })
        ));
    }

    #[test]
    fn test_pid_path_missing_process() {
        let tmp = tempfile::tempdir().unwrap();
        let path = PathStrategy::pid_with_proc_root(Pid::from_raw(4242), tmp.path());
        assert!(matches!(
            path.path_in(&host(), "devices"),
            Err(PathError::Record(_))
        ));
    }

    #[test]
    fn test_malformed_record_fails_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "self/cgroup", "7:memory:/\nbroken\n").unwrap();

        let path = PathStrategy::nested_with_proc_root("test", tmp.path());
        assert!(matches!(
            path.path_in(&host(), "memory"),
            Err(PathError::Record(record::RecordError::InvalidEntry { .. }))
        ));
    }

    #[test]
    fn test_self_and_pid_agree_on_live_host() {
        let mounts = match mount::list_subsystem_mounts() {
            Ok(mounts) => mounts,
            Err(mount::V1MountPointError::NotExist) => return,
            Err(err) => panic!("failed to read mount table: {err}"),
        };

        let own = PathStrategy::nested("").path_in(&mounts, "devices");
        let pid = PathStrategy::pid(nix::unistd::getpid()).path_in(&mounts, "devices");
        match (own, pid) {
            (Ok(own), Ok(pid)) => assert_eq!(own, pid),
            (Err(own), Err(pid)) => {
                assert_eq!(std::mem::discriminant(&own), std::mem::discriminant(&pid))
            }
            (own, pid) => panic!("self and pid resolution disagree: {own:?} {pid:?}"),
        }
    }

    #[test]
    fn test_path_config() {
        let config: PathConfig =
            serde_json::from_str(r#"{"type":"nested","suffix":"youki/ctr"}"#).unwrap();
        assert_eq!(
            PathStrategy::from(config),
            PathStrategy::nested("youki/ctr")
        );

        let config: PathConfig = serde_json::from_str(r#"{"type":"pid","pid":1}"#).unwrap();
        assert_eq!(PathStrategy::from(config), PathStrategy::pid(Pid::from_raw(1)));

        let config: PathConfig = serde_json::from_str(r#"{"type":"root"}"#).unwrap();
        assert_eq!(PathStrategy::from(config), PathStrategy::root());

        let json = serde_json::to_string(&PathConfig::Static {
            path: PathBuf::from("test"),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"static","path":"test"}"#);
    }
}
