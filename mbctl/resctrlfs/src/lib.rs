// Copyright (c) Facebook, Inc. and its affiliates.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(clippy::all)]

use std::collections::BTreeMap;
use std::io::BufRead;
use std::io::BufReader;
use std::io::ErrorKind;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use nix::sys::statfs::RDTGROUP_SUPER_MAGIC;
use nix::sys::statfs::fstatfs;
use openat::Dir;
use openat::SimpleType;
use thiserror::Error;

mod types;
pub use types::*;


pub const DEFAULT_RESCTRL_ROOT: &str = "/sys/fs/resctrl";

/// AMD MBA is programmed in 1/8 GBps steps.
pub const DEFAULT_MB_GRANULARITY: u64 = 125;

/// Largest MBA value the hardware accepts. Writing it removes the limit.
pub const DEFAULT_MB_MAX_VALUE: u64 = 2048;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid file format: {0:?}")]
    InvalidFileFormat(PathBuf),
    #[error("{1:?}: {0:?}")]
    IoError(PathBuf, #[source] std::io::Error),
    #[error("Unexpected line ({1}) in file: {0:?}")]
    UnexpectedLine(PathBuf, String),
    #[error("Not resctrl filesystem: {0:?}")]
    NotResctrl(PathBuf),
    #[error("Invalid control group name: {0:?}")]
    InvalidGroupName(String),
    #[error("Invalid MBA setting: {0}")]
    InvalidSetting(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// resctrlfs can give us a NotFound for various files and directories. In a lot of cases, these
/// are expected (e.g. when monitoring is disabled). Thus we translate these errors to `None`.
fn wrap<S: Sized>(v: std::result::Result<S, Error>) -> std::result::Result<Option<S>, Error> {
    if let Err(Error::IoError(_, ref e)) = v {
        if e.kind() == std::io::ErrorKind::NotFound {
            return Ok(None);
        }
        if e.kind() == std::io::ErrorKind::Other {
            if let Some(errno) = e.raw_os_error() {
                if errno == /* ENODEV */ 19 {
                    // If the resctrl group is removed after a control file is opened,
                    // ENODEV may returned. Ignore it.
                    return Ok(None);
                }
            }
        }
    }
    v.map(Some)
}

impl FromStr for RmidBytes {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "Unavailable" => Ok(RmidBytes::Unavailable),
            _ => Ok(RmidBytes::Bytes(s.parse().map_err(|_| "Not a number")?)),
        }
    }
}

impl Schemata {
    /// Parse the `MB:` line out of a schemata file. Other resources (e.g.
    /// `L3:`) are ignored.
    fn parse_lines<I: Iterator<Item = String>>(lines: I) -> std::result::Result<Self, String> {
        let mut mb = BTreeMap::new();
        for line in lines {
            let line = line.trim();
            let Some(domains) = line.strip_prefix("MB:") else {
                continue;
            };
            for item in domains.split(';').filter(|s| !s.is_empty()) {
                let (id, value) = item
                    .split_once('=')
                    .ok_or_else(|| format!("Malformed MB domain: {}", item))?;
                let id = id
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid domain id: {}", id))?;
                let value = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid MB value: {}", value))?;
                mb.insert(id, value);
            }
        }
        Ok(Schemata { mb })
    }
}

impl std::fmt::Display for Schemata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MB:")?;
        for (i, (id, value)) in self.mb.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}={}", id, value)?;
        }
        Ok(())
    }
}

/// A reader for a resctrl MON or CTRL_MON or root group.
struct ResctrlGroupReader {
    path: PathBuf,
    dir: Dir,
}

/// Reader to read the monitoring data of the entire resctrl hierarchy.
pub struct ResctrlReader {
    path: PathBuf,
}

impl ResctrlGroupReader {
    /// Create a new reader for a resctrl MON or CTRL_MON or root group.
    fn new(path: PathBuf) -> Result<ResctrlGroupReader> {
        let dir = Dir::open(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        Ok(ResctrlGroupReader { path, dir })
    }

    /// Return the name of the group.
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Read a value from a file that has a single line. If the file is empty,
    /// InvalidFileFormat is returned.
    fn read_singleline_file<T: FromStr>(&self, file_name: &str) -> Result<T> {
        let file = self
            .dir
            .open_file(file_name)
            .map_err(|e| self.io_error(file_name, e))?;
        let buf_reader = BufReader::new(file);
        if let Some(line) = buf_reader.lines().next() {
            let line = line.map_err(|e| self.io_error(file_name, e))?;
            return line
                .trim()
                .parse::<T>()
                .map_err(move |_| self.unexpected_line(file_name, line));
        }
        Err(self.invalid_file_format(file_name))
    }

    /// Helper to create InvalidFileFormat error
    fn invalid_file_format<P: AsRef<Path>>(&self, file_name: P) -> Error {
        let mut p = self.path.clone();
        p.push(file_name);
        Error::InvalidFileFormat(p)
    }

    /// Helper to create IoError error
    fn io_error<P: AsRef<Path>>(&self, file_name: P, e: std::io::Error) -> Error {
        let mut p = self.path.clone();
        p.push(file_name);
        Error::IoError(p, e)
    }

    /// Helper to create UnexpectedLine error
    fn unexpected_line<P: AsRef<Path>>(&self, file_name: P, line: String) -> Error {
        let mut p = self.path.clone();
        p.push(file_name);
        Error::UnexpectedLine(p, line)
    }

    /// Return L3 cache ID for given mon_stat_dir name. e.g. "mon_L3_01" returns 1.
    fn maybe_get_l3_mon_stat_dir_id(&self) -> Result<u64> {
        let name = self.name();
        name.strip_prefix("mon_L3_")
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| self.invalid_file_format(""))
    }

    /// Read the inode number of the group. A recreated group gets a new
    /// inode and fresh counters.
    fn read_inode_number(&self) -> Result<u64> {
        let meta = self.dir.metadata(".").map_err(|e| self.io_error("", e))?;
        Ok(meta.stat().st_ino)
    }

    /// Read the bandwidth counters of one `mon_L3_XX` directory.
    fn read_l3_mon_stat(&self) -> Result<L3MonStat> {
        Ok(L3MonStat {
            mbm_total_bytes: wrap(self.read_singleline_file("mbm_total_bytes"))?,
            mbm_local_bytes: wrap(self.read_singleline_file("mbm_local_bytes"))?,
        })
    }

    /// Read all L3 counters under `mon_data`.
    fn read_mon_data(&self) -> Result<BTreeMap<u64, L3MonStat>> {
        self.child_iter("mon_data".into())?
            .filter_map(|child| {
                // Non L3 directories (e.g. mon_MB_00 on newer kernels) are skipped.
                let id = child.maybe_get_l3_mon_stat_dir_id().ok()?;
                Some(child.read_l3_mon_stat().map(|v| (id, v)))
            })
            .collect::<Result<BTreeMap<_, _>>>()
    }

    fn read_schemata(&self) -> Result<Schemata> {
        let file = self
            .dir
            .open_file("schemata")
            .map_err(|e| self.io_error("schemata", e))?;
        let lines = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| self.io_error("schemata", e))?;
        let content = lines.join("\n");
        Schemata::parse_lines(lines.into_iter())
            .map_err(move |_| self.unexpected_line("schemata", content))
    }

    /// Read current group as a MON group
    fn read_mon_group(&self) -> Result<MonGroupStat> {
        Ok(MonGroupStat {
            inode_number: Some(self.read_inode_number()?),
            l3_mon_stat: wrap(self.read_mon_data())?,
        })
    }

    /// Read current group as a CTRL_MON group. The schemata and the child MON
    /// groups are only read when `details` is set.
    fn read_ctrl_mon_group(&self, details: bool) -> Result<CtrlMonGroupStat> {
        let mut stat = CtrlMonGroupStat {
            inode_number: Some(self.read_inode_number()?),
            l3_mon_stat: wrap(self.read_mon_data())?,
            ..Default::default()
        };
        if details {
            stat.schemata = wrap(self.read_schemata())?;
            stat.mon_groups = wrap(self.read_child_mon_groups())?;
        }
        Ok(stat)
    }

    /// Get iterator of child group readers
    fn child_iter(
        &self,
        child_dir_name: PathBuf,
    ) -> Result<impl Iterator<Item = ResctrlGroupReader> + '_> {
        Ok(self
            .dir
            .list_dir(&child_dir_name)
            .map_err(|e| self.io_error(&child_dir_name, e))?
            .filter_map(move |entry| match entry {
                Ok(entry) if entry.simple_type() == Some(SimpleType::Dir) => {
                    let relative_path = child_dir_name.join(entry.file_name());
                    let sub_dir = match self.dir.sub_dir(relative_path.as_path()) {
                        Ok(d) => d,
                        Err(_) => return None,
                    };
                    let mut path = self.path.clone();
                    path.push(entry.file_name());
                    Some(ResctrlGroupReader { path, dir: sub_dir })
                }
                _ => None,
            }))
    }

    /// Read child MON groups
    fn read_child_mon_groups(&self) -> Result<BTreeMap<String, MonGroupStat>> {
        self.child_iter("mon_groups".into())?
            .map(|child| child.read_mon_group().map(|v| (child.name(), v)))
            .collect::<Result<BTreeMap<_, _>>>()
    }

    /// Read child CTRL MON groups
    fn read_child_ctrl_mon_groups(
        &self,
        details: bool,
    ) -> Result<BTreeMap<String, CtrlMonGroupStat>> {
        self.child_iter(".".into())?
            .filter(|r| !["info", "mon_groups", "mon_data"].contains(&r.name().as_str()))
            .filter_map(|child| {
                // A group removed while iterating simply disappears from the sample.
                match wrap(child.read_ctrl_mon_group(details)) {
                    Ok(Some(v)) => Some(Ok((child.name(), v))),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            })
            .collect::<Result<BTreeMap<_, _>>>()
    }
}

fn check_resctrl(path: &Path, dir: &Dir) -> Result<()> {
    // SAFETY: Fix when https://github.com/nix-rust/nix/issues/2546 is
    let dir = unsafe { BorrowedFd::borrow_raw(dir.as_raw_fd()) };
    let statfs = match fstatfs(dir) {
        Ok(s) => s,
        Err(e) => {
            return Err(Error::IoError(
                path.to_path_buf(),
                std::io::Error::new(ErrorKind::Other, format!("Failed to fstatfs: {}", e)),
            ));
        }
    };

    if statfs.filesystem_type() != RDTGROUP_SUPER_MAGIC {
        return Err(Error::NotResctrl(path.to_path_buf()));
    }
    Ok(())
}

impl ResctrlReader {
    pub fn new(path: PathBuf, validate: bool) -> Result<ResctrlReader> {
        let dir = Dir::open(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        if validate {
            check_resctrl(&path, &dir)?;
        }
        Ok(ResctrlReader { path })
    }

    pub fn root() -> Result<ResctrlReader> {
        Self::new(DEFAULT_RESCTRL_ROOT.into(), true)
    }

    /// Read every CTRL_MON group including the root group, which is keyed by
    /// the empty string.
    pub fn read_all(&self) -> Result<ResctrlSample> {
        self.read_groups(true)
    }

    /// Like `read_all` but only reads inode numbers and L3 counters. The
    /// schemata and MON groups are left as `None`.
    pub fn read_counters(&self) -> Result<ResctrlSample> {
        self.read_groups(false)
    }

    fn read_groups(&self, details: bool) -> Result<ResctrlSample> {
        let reader = ResctrlGroupReader::new(self.path.clone())?;
        let mut ctrl_mon_groups = reader.read_child_ctrl_mon_groups(details)?;
        ctrl_mon_groups.insert(String::new(), reader.read_ctrl_mon_group(details)?);
        Ok(ResctrlSample { ctrl_mon_groups })
    }
}

/// Writer for MBA schemata of CTRL_MON groups.
pub struct ResctrlWriter {
    path: PathBuf,
    granularity: u64,
    max_value: u64,
}

impl ResctrlWriter {
    /// `granularity` is the MBps represented by one schemata step and
    /// `max_value` the largest step the hardware accepts.
    pub fn new(path: PathBuf, granularity: u64, max_value: u64, validate: bool) -> Result<Self> {
        if granularity == 0 {
            return Err(Error::InvalidSetting("granularity must be positive".into()));
        }
        if max_value == 0 {
            return Err(Error::InvalidSetting("max value must be positive".into()));
        }
        let dir = Dir::open(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        if validate {
            check_resctrl(&path, &dir)?;
        }
        Ok(ResctrlWriter {
            path,
            granularity,
            max_value,
        })
    }

    pub fn root() -> Result<Self> {
        Self::new(
            DEFAULT_RESCTRL_ROOT.into(),
            DEFAULT_MB_GRANULARITY,
            DEFAULT_MB_MAX_VALUE,
            true,
        )
    }

    /// Convert MBps into a schemata value: rounded up to the granularity,
    /// at least one step and at most `max_value`.
    pub fn schemata_value(&self, mb: u64) -> u64 {
        mb.div_ceil(self.granularity).clamp(1, self.max_value)
    }

    fn group_path(&self, group: &str) -> Result<PathBuf> {
        if group.is_empty() {
            return Ok(self.path.clone());
        }
        if group.contains('/') || group == "." || group == ".." {
            return Err(Error::InvalidGroupName(group.to_owned()));
        }
        if ["info", "mon_groups", "mon_data"].contains(&group) {
            return Err(Error::InvalidGroupName(group.to_owned()));
        }
        Ok(self.path.join(group))
    }

    /// Create the CTRL_MON group if it does not exist yet.
    pub fn ensure_ctrl_group(&self, group: &str) -> Result<()> {
        let path = self.group_path(group)?;
        match std::fs::create_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::IoError(path, e)),
        }
    }

    /// Limit the bandwidth of `group` on L3 domain `l3` to `mb` MBps.
    /// Returns the value written to the schemata file.
    pub fn set_mb(&self, group: &str, l3: u64, mb: u64) -> Result<u64> {
        let path = self.group_path(group)?.join("schemata");
        let value = self.schemata_value(mb);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::IoError(path.clone(), e))?;
        let line = format!(
            "{}\n",
            Schemata {
                mb: BTreeMap::from([(l3, value)]),
            }
        );
        file.write_all(line.as_bytes())
            .map_err(|e| Error::IoError(path.clone(), e))?;
        Ok(value)
    }

    /// Read back the schemata currently applied to `group`.
    pub fn read_schemata(&self, group: &str) -> Result<Schemata> {
        ResctrlGroupReader::new(self.group_path(group)?)?.read_schemata()
    }
}
