use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::common::{WrapIoResult, WrappedIoError};

/// Hierarchy id the kernel reports for the cgroup v2 unified hierarchy.
const UNIFIED_HIERARCHY_ID: u32 = 0;

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("invalid cgroup entry: {line:?}")]
    InvalidEntry { line: String },
    #[error("invalid hierarchy id in cgroup entry: {line:?}")]
    InvalidHierarchyId { line: String },
    #[error("empty subsystem name in cgroup entry: {line:?}")]
    EmptySubsystem { line: String },
}

/// Membership of a process in the cgroup hierarchies, as listed in
/// `/proc/[pid]/cgroup`. Every subsystem of a comounted hierarchy maps to the
/// path of that hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupRecord {
    subsystems: HashMap<String, PathBuf>,
    unified: Option<PathBuf>,
}

impl CgroupRecord {
    /// Path recorded for the subsystem, relative to its hierarchy root.
    pub fn get(&self, subsystem: &str) -> Option<&Path> {
        self.subsystems.get(subsystem).map(PathBuf::as_path)
    }

    pub fn subsystems(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.subsystems
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path()))
    }

    /// Path within the cgroup v2 hierarchy (the `0::` entry), if any.
    pub fn unified(&self) -> Option<&Path> {
        self.unified.as_deref()
    }

    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    fn parse_line(&mut self, line: &str) -> Result<(), RecordError> {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(RecordError::InvalidEntry { line: line.into() });
        }

        let hierarchy: u32 = parts[0]
            .parse()
            .map_err(|_| RecordError::InvalidHierarchyId { line: line.into() })?;
        let path = PathBuf::from(parts[2]);

        if parts[1].is_empty() {
            if hierarchy != UNIFIED_HIERARCHY_ID {
                return Err(RecordError::EmptySubsystem { line: line.into() });
            }
            self.unified = Some(path);
            return Ok(());
        }

        for subsystem in parts[1].split(',') {
            if subsystem.is_empty() {
                return Err(RecordError::EmptySubsystem { line: line.into() });
            }
            self.subsystems.insert(subsystem.to_owned(), path.clone());
        }

        Ok(())
    }
}

impl From<HashMap<String, PathBuf>> for CgroupRecord {
    fn from(subsystems: HashMap<String, PathBuf>) -> Self {
        Self {
            subsystems,
            unified: None,
        }
    }
}

impl FromStr for CgroupRecord {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cgroup_from_reader(s.as_bytes())
    }
}

/// Parses a `/proc/[pid]/cgroup` formatted stream. A single malformed line
/// fails the whole parse.
pub fn parse_cgroup_from_reader<R: BufRead>(reader: R) -> Result<CgroupRecord, RecordError> {
    parse_lines(reader, Path::new(""))
}

pub fn parse_cgroup_file<P: AsRef<Path>>(path: P) -> Result<CgroupRecord, RecordError> {
    let path = path.as_ref();
    tracing::debug!("parse cgroup record {:?}", path);
    let file = File::open(path).wrap_open(path)?;
    parse_lines(BufReader::new(file), path)
}

fn parse_lines<R: BufRead>(reader: R, source: &Path) -> Result<CgroupRecord, RecordError> {
    let mut record = CgroupRecord::default();
    for line in reader.lines() {
        let line = line.wrap_read(source)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        record.parse_line(line)?;
    }

    Ok(record)
}
