//! Resolves the on-disk location of a process within a cgroup v1 controller hierarchy.
//! The resolution layer parses `/proc/[pid]/cgroup` records, scans the host mount table
//! for cgroup mounts and combines both through a small set of path strategies.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;


pub mod common;
#[cfg(feature = "v1")]
pub mod v1;
