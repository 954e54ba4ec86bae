use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// Well known cgroup v1 controllers. Named hierarchies such as `name=systemd`
/// are not controllers and are addressed by their plain string instead.
#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    Cpu,
    CpuAcct,
    CpuSet,
    Devices,
    HugeTlb,
    Pids,
    #[serde(rename = "perf_event")]
    PerfEvent,
    Memory,
    Blkio,
    #[serde(rename = "net_prio")]
    NetworkPriority,
    #[serde(rename = "net_cls")]
    NetworkClassifier,
    Freezer,
    Rdma,
}

impl Display for ControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print: &str = self.as_ref();
        write!(f, "{print}")
    }
}

impl AsRef<str> for ControllerType {
    fn as_ref(&self) -> &str {
        match *self {
            Self::Cpu => "cpu",
            Self::CpuAcct => "cpuacct",
            Self::CpuSet => "cpuset",
            Self::Devices => "devices",
            Self::HugeTlb => "hugetlb",
            Self::Pids => "pids",
            Self::PerfEvent => "perf_event",
            Self::Memory => "memory",
            Self::Blkio => "blkio",
            Self::NetworkPriority => "net_prio",
            Self::NetworkClassifier => "net_cls",
            Self::Freezer => "freezer",
            Self::Rdma => "rdma",
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown cgroup v1 controller {0}")]
pub struct UnknownControllerError(pub String);

impl FromStr for ControllerType {
    type Err = UnknownControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CONTROLLERS
            .iter()
            .find(|c| c.as_ref() == s)
            .copied()
            .ok_or_else(|| UnknownControllerError(s.to_owned()))
    }
}

pub const CONTROLLERS: &[ControllerType] = &[
    ControllerType::Cpu,
    ControllerType::CpuAcct,
    ControllerType::CpuSet,
    ControllerType::Devices,
    ControllerType::HugeTlb,
    ControllerType::Memory,
    ControllerType::Pids,
    ControllerType::PerfEvent,
    ControllerType::Blkio,
    ControllerType::NetworkPriority,
    ControllerType::NetworkClassifier,
    ControllerType::Freezer,
    ControllerType::Rdma,
];
