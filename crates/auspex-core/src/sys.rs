//! Operating-system probes.
//!
//! Runtime lookups against procfs plus the stat helpers used by the
//! acquisition pipeline. Everything that touches a live pid goes through the
//! [`SystemProbes`] trait so the correlator can be driven against fakes.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use glob::glob;
use lazy_static::lazy_static;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("malformed {path}")]
    Malformed { path: String },

    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

impl ProbeError {
    /// Kernel-reported memory exhaustion, the only allocation failure the
    /// engine can observe.
    pub fn is_oom(&self) -> bool {
        match self {
            ProbeError::ReadFile { source, .. } => source.kind() == io::ErrorKind::OutOfMemory,
            _ => false,
        }
    }
}

/// File attributes captured by a stat, or supplied by an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatAttr {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Birth time is filesystem dependent.
    pub btime: Option<SystemTime>,
}

impl StatAttr {
    pub fn from_metadata(md: &Metadata) -> Self {
        Self {
            dev: md.dev(),
            ino: md.ino(),
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            size: md.size(),
            mtime: md.modified().unwrap_or(UNIX_EPOCH),
            ctime: unix_time(md.ctime(), md.ctime_nsec()),
            btime: md.created().ok(),
        }
    }

    /// Identity fields the audit layer is authoritative for.
    pub fn same_identity(&self, other: &StatAttr) -> bool {
        self.dev == other.dev
            && self.ino == other.ino
            && self.mode == other.mode
            && self.uid == other.uid
            && self.gid == other.gid
    }

    /// Content fields bracketing a hash computation over an open fd.
    pub fn same_content(&self, other: &StatAttr) -> bool {
        self.size == other.size
            && self.mtime == other.mtime
            && self.ctime == other.ctime
            && self.btime == other.btime
    }

    /// Full bracket for a path-based re-stat after signature computation.
    pub fn same_file(&self, other: &StatAttr) -> bool {
        self.dev == other.dev && self.ino == other.ino && self.same_content(other)
    }
}

fn unix_time(sec: i64, nsec: i64) -> SystemTime {
    if sec < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
}

/// Process credentials at the moment of an audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditSubject {
    pub pid: i32,
    pub auid: u32,
    pub euid: u32,
    pub ruid: u32,
    pub egid: u32,
    pub rgid: u32,
    pub sid: u32,
    pub tty: Option<String>,
}

/// Stat an open file descriptor.
pub fn fdattr(file: &fs::File) -> io::Result<StatAttr> {
    Ok(StatAttr::from_metadata(&file.metadata()?))
}

/// Stat by path.
pub fn pathattr(path: &str) -> io::Result<StatAttr> {
    Ok(StatAttr::from_metadata(&fs::metadata(path)?))
}

/// Canonicalize `path`, resolving relative paths against `cwd`.
pub fn realpath(path: &str, cwd: Option<&str>) -> io::Result<String> {
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        match cwd {
            Some(cwd) => Path::new(cwd).join(path),
            None => PathBuf::from(path),
        }
    };
    let canonical = fs::canonicalize(joined)?;
    canonical
        .into_os_string()
        .into_string()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 path"))
}

/// Compare the final path components of two paths.
pub fn basename_eq(p: &str, q: &str) -> bool {
    match (Path::new(p).file_name(), Path::new(q).file_name()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Runtime lookups on live processes.
pub trait SystemProbes: Send + Sync {
    /// Path of the executable image of a running process.
    fn pid_path(&self, pid: Pid) -> Result<String, ProbeError>;
    /// Current working directory of a running process.
    fn pid_cwd(&self, pid: Pid) -> Result<String, ProbeError>;
    /// Fork timestamp and parent pid of a running process.
    fn pid_info(&self, pid: Pid) -> Result<(SystemTime, Pid), ProbeError>;
    /// Signal-0 liveness probe.
    fn alive(&self, pid: Pid) -> bool;
    /// All currently running pids.
    fn running_pids(&self) -> Result<Vec<Pid>, ProbeError>;
}

/// Production probes backed by procfs.
pub struct ProcfsProbes;

lazy_static! {
    /// System boot time, used to convert start-time ticks to wall clock.
    static ref BOOT_TIME: Option<SystemTime> = read_boot_time().ok();
    static ref CLOCK_TICK: u64 = {
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if hz > 0 {
            hz as u64
        } else {
            100
        }
    };
}

fn read_boot_time() -> Result<SystemTime, ProbeError> {
    let path = "/proc/stat".to_string();
    let data = fs::read_to_string(&path).map_err(|source| ProbeError::ReadFile {
        source,
        path: path.clone(),
    })?;
    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            let secs: u64 = rest.trim().parse()?;
            return Ok(UNIX_EPOCH + Duration::from_secs(secs));
        }
    }
    Err(ProbeError::Malformed { path })
}

fn read_link(path: &str) -> Result<String, ProbeError> {
    let target = fs::read_link(path).map_err(|source| ProbeError::ReadFile {
        source,
        path: path.to_string(),
    })?;
    target
        .into_os_string()
        .into_string()
        .map_err(|_| ProbeError::Malformed {
            path: path.to_string(),
        })
}

impl SystemProbes for ProcfsProbes {
    fn pid_path(&self, pid: Pid) -> Result<String, ProbeError> {
        read_link(&format!("/proc/{pid}/exe"))
    }

    fn pid_cwd(&self, pid: Pid) -> Result<String, ProbeError> {
        read_link(&format!("/proc/{pid}/cwd"))
    }

    fn pid_info(&self, pid: Pid) -> Result<(SystemTime, Pid), ProbeError> {
        let path = format!("/proc/{pid}/stat");
        let data = fs::read_to_string(&path).map_err(|source| ProbeError::ReadFile {
            source,
            path: path.clone(),
        })?;
        // Fields after the parenthesized comm, which may itself contain
        // spaces and parentheses.
        let rest = data
            .rsplit_once(')')
            .map(|(_, rest)| rest)
            .ok_or_else(|| ProbeError::Malformed { path: path.clone() })?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // rest starts at field 3 (state); ppid is field 4, starttime field 22.
        let ppid: i32 = fields
            .get(1)
            .ok_or_else(|| ProbeError::Malformed { path: path.clone() })?
            .parse()?;
        let start_ticks: u64 = fields
            .get(19)
            .ok_or_else(|| ProbeError::Malformed { path: path.clone() })?
            .parse()?;
        let fork_tv = match *BOOT_TIME {
            Some(boot) => {
                let hz = *CLOCK_TICK;
                boot + Duration::from_nanos(start_ticks.saturating_mul(1_000_000_000 / hz))
            }
            None => SystemTime::now(),
        };
        Ok((fork_tv, Pid::from_raw(ppid)))
    }

    fn alive(&self, pid: Pid) -> bool {
        kill(pid, None).is_ok()
    }

    fn running_pids(&self) -> Result<Vec<Pid>, ProbeError> {
        glob("/proc/[0-9]*")?
            .map(|entry| {
                let entry: String = entry?.to_string_lossy().into();
                let pid = entry.replace("/proc/", "").parse()?;
                Ok(Pid::from_raw(pid))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn basename_comparison() {
        assert!(basename_eq("/usr/bin/awk", "awk"));
        assert!(basename_eq("/usr/bin/awk", "../bin/awk"));
        assert!(!basename_eq("/usr/bin/awk", "/usr/bin/sed"));
        assert!(!basename_eq("/", "/usr/bin/awk"));
    }

    #[test]
    fn realpath_resolves_relative_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::File::create(&path)
            .unwrap()
            .write_all(b"x")
            .unwrap();
        let cwd = dir.path().to_str().unwrap();
        let resolved = realpath("tool", Some(cwd)).unwrap();
        assert_eq!(resolved, fs::canonicalize(&path).unwrap().to_str().unwrap());
    }

    #[test]
    fn stat_attr_brackets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        let a = pathattr(path.to_str().unwrap()).unwrap();
        let b = pathattr(path.to_str().unwrap()).unwrap();
        assert!(a.same_identity(&b));
        assert!(a.same_content(&b));
        assert!(a.same_file(&b));
        assert_eq!(a.size, 3);
    }

    #[test]
    fn procfs_probes_on_self() {
        let probes = ProcfsProbes;
        let me = Pid::from_raw(std::process::id() as i32);
        assert!(probes.alive(me));
        let path = probes.pid_path(me).unwrap();
        assert!(path.starts_with('/'));
        probes.pid_cwd(me).unwrap();
        let (_fork_tv, ppid) = probes.pid_info(me).unwrap();
        assert!(ppid.as_raw() >= 0);
        assert!(probes.running_pids().unwrap().contains(&me));
    }
}
