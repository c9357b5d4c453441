//! Process table.
//!
//! Maps live pids to their tracked state: working directory, currently
//! executing image and the per-process fd contexts used by the socket and
//! file monitors. The table is owned by the correlator task; nothing here
//! synchronizes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::Pid;

use crate::image::ImageExec;
use crate::sys::AuditSubject;
use std::sync::Arc;

/// Context attached to one file descriptor of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdCtx {
    Socket {
        proto: i32,
        addr: Option<IpAddr>,
        port: u16,
    },
    File {
        subject: AuditSubject,
        path: String,
    },
}

#[derive(Debug)]
pub struct Proc {
    pub pid: Pid,
    pub fork_tv: SystemTime,
    pub cwd: Option<String>,
    pub image_exec: Option<Arc<ImageExec>>,
    fdtab: HashMap<i32, FdCtx>,
}

impl Proc {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            fork_tv: UNIX_EPOCH,
            cwd: None,
            image_exec: None,
            fdtab: HashMap::new(),
        }
    }

    pub fn getfd(&self, fd: i32) -> Option<&FdCtx> {
        self.fdtab.get(&fd)
    }

    pub fn getfd_mut(&mut self, fd: i32) -> Option<&mut FdCtx> {
        self.fdtab.get_mut(&fd)
    }

    /// Install a context for `fd`, replacing any previous one. Creating
    /// over an existing slot clears its payload, so create is idempotent.
    pub fn setfd(&mut self, fd: i32, ctx: FdCtx) {
        self.fdtab.insert(fd, ctx);
    }

    pub fn closefd(&mut self, fd: i32) -> Option<FdCtx> {
        self.fdtab.remove(&fd)
    }
}

#[derive(Default)]
pub struct ProcTab {
    procs: HashMap<Pid, Proc>,
}

impl ProcTab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, pid: Pid) -> Option<&Proc> {
        self.procs.get(&pid)
    }

    pub fn find_mut(&mut self, pid: Pid) -> Option<&mut Proc> {
        self.procs.get_mut(&pid)
    }

    pub fn find_or_create(&mut self, pid: Pid) -> &mut Proc {
        self.procs.entry(pid).or_insert_with(|| Proc::new(pid))
    }

    /// Insert a fresh entry; the pid must be absent.
    pub fn create(&mut self, pid: Pid) -> &mut Proc {
        let prev = self.procs.insert(pid, Proc::new(pid));
        debug_assert!(prev.is_none());
        self.procs.get_mut(&pid).unwrap()
    }

    /// Drop a pid and everything it owns. Idempotent: exit is delivered
    /// both for explicit exits and for wait4 discoveries.
    pub fn remove(&mut self, pid: Pid, _tv: SystemTime) {
        if self.procs.remove(&pid).is_some() {
            log::trace!("proctab: removed {pid}");
        }
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn clear(&mut self) {
        self.procs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: Pid = Pid::from_raw(321);

    fn subject(pid: i32) -> AuditSubject {
        AuditSubject {
            pid,
            auid: 501,
            euid: 0,
            ruid: 0,
            egid: 0,
            rgid: 0,
            sid: 1,
            tty: None,
        }
    }

    #[test]
    fn create_find_remove() {
        let mut tab = ProcTab::new();
        assert!(tab.find(PID).is_none());
        tab.create(PID);
        assert_eq!(tab.find(PID).unwrap().pid, PID);
        tab.remove(PID, UNIX_EPOCH);
        assert!(tab.find(PID).is_none());
        // Second remove is a no-op.
        tab.remove(PID, UNIX_EPOCH);
        assert!(tab.is_empty());
    }

    #[test]
    fn find_or_create_reuses_entry() {
        let mut tab = ProcTab::new();
        tab.find_or_create(PID).cwd = Some("/tmp".to_string());
        assert_eq!(
            tab.find_or_create(PID).cwd.as_deref(),
            Some("/tmp")
        );
        assert_eq!(tab.len(), 1);
    }

    #[test]
    fn fd_contexts_reopen_idempotently() {
        let mut tab = ProcTab::new();
        let proc = tab.create(PID);
        proc.setfd(
            5,
            FdCtx::Socket {
                proto: 6,
                addr: None,
                port: 0,
            },
        );
        // Reopening fd 5 as a file clears the socket payload.
        proc.setfd(
            5,
            FdCtx::File {
                subject: subject(321),
                path: "/etc/passwd".to_string(),
            },
        );
        match proc.getfd(5).unwrap() {
            FdCtx::File { path, .. } => assert_eq!(path, "/etc/passwd"),
            other => panic!("unexpected context {other:?}"),
        }
        assert!(proc.closefd(5).is_some());
        assert!(proc.closefd(5).is_none());
    }
}
