//! Process-monitoring correlator.
//!
//! Reconciles the two asynchronous views of every exec: the kernel pre-exec
//! callback (early, while the file still exists) and the audit record
//! (late, post-commit, with subject credentials and arguments). Maintains
//! the process table, splices matched images into each process's execution
//! history and hands finalized images to the worker.
//!
//! All methods taking `&mut self` must be driven from a single task; the
//! [`crate::handle`] actor provides that affinity.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use nix::unistd::Pid;

use crate::config::{Config, KernelLevel};
use crate::image::ImageExec;
use crate::prepq::PreExecQueue;
use crate::proctab::{FdCtx, ProcTab};
use crate::stats::{bump, ProcMonStats, StatsSnapshot};
use crate::sys::{self, AuditSubject, StatAttr, SystemProbes};
use crate::worker::WorkerHandle;

pub struct ProcMon {
    config: Arc<Config>,
    probes: Arc<dyn SystemProbes>,
    prepq: Arc<PreExecQueue>,
    proctab: ProcTab,
    worker: WorkerHandle,
    stats: Arc<ProcMonStats>,
}

impl ProcMon {
    pub fn new(
        config: Arc<Config>,
        probes: Arc<dyn SystemProbes>,
        prepq: Arc<PreExecQueue>,
        worker: WorkerHandle,
        stats: Arc<ProcMonStats>,
    ) -> Self {
        Self {
            config,
            probes,
            prepq,
            proctab: ProcTab::new(),
            worker,
            stats,
        }
    }

    /// Handle a fork audit record. The child begins life executing the
    /// parent's image, from the parent's working directory.
    pub fn fork(&mut self, tv: SystemTime, subject: &AuditSubject, childpid: Pid) {
        let parent_pid = Pid::from_raw(subject.pid);
        if !self.resolve(parent_pid, tv) {
            bump(&self.stats.miss_forksubj);
            log::debug!("miss_forksubj: subject.pid={parent_pid} childpid={childpid}");
            return;
        }

        // A previous life of the child pid is over now.
        self.proctab.remove(childpid, tv);

        let (cwd, image) = {
            let parent = self.proctab.find(parent_pid).unwrap();
            (parent.cwd.clone(), parent.image_exec.clone())
        };
        let child = self.proctab.create(childpid);
        child.fork_tv = tv;
        child.cwd = cwd;
        child.image_exec = image;
    }

    /// Handle a spawn audit record: fork followed by exec targeting the
    /// child. A spawn with the set-exec attribute arrives as a plain exec
    /// from the audit layer and never reaches this entry point.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        &mut self,
        tv: SystemTime,
        subject: &AuditSubject,
        childpid: Pid,
        imagepath: String,
        attr: Option<StatAttr>,
        argv: Option<Vec<String>>,
        envv: Option<Vec<String>>,
    ) {
        self.fork(tv, subject, childpid);
        let mut subject = subject.clone();
        subject.pid = childpid.as_raw();
        self.exec(tv, &subject, imagepath, attr, argv, envv);
    }

    /// Handle an exec audit record.
    ///
    /// For scripts this is called once, with argv[0] as the interpreter,
    /// argv[1..] as the script invocation, `imagepath` as the script and
    /// `attr` as the script's file attributes.
    pub fn exec(
        &mut self,
        tv: SystemTime,
        subject: &AuditSubject,
        imagepath: String,
        attr: Option<StatAttr>,
        argv: Option<Vec<String>>,
        envv: Option<Vec<String>>,
    ) {
        let pid = Pid::from_raw(subject.pid);
        if !self.resolve(pid, tv) {
            bump(&self.stats.miss_execsubj);
            log::debug!("miss_execsubj: subject.pid={pid} imagepath={imagepath}");
            return;
        }

        let (image, mut interp) =
            self.prepq
                .lookup(pid, attr.as_ref(), &imagepath, argv.as_deref());

        let image = match image {
            Some(image) => image,
            None => {
                if self.config.kernel_level > KernelLevel::None {
                    log::debug!("prepq miss: looking for {imagepath}[{pid}]");
                }
                bump(&self.stats.pqmiss);
                ImageExec::new(imagepath, pid, tv, &self.stats)
            }
        };
        let _ = image.open(attr.as_ref());

        let shebang = image.state().flags.shebang;
        if shebang && interp.is_none() {
            bump(&self.stats.pqmiss);
            let Some(argv_ref) = argv.as_ref().filter(|a| !a.is_empty()) else {
                bump(&self.stats.miss_execinterp);
                log::debug!(
                    "miss_execinterp: subject.pid={pid} imagepath={} argv absent",
                    image.path
                );
                return;
            };
            // The interpreter may be a relative path, and no attributes
            // exist for it; resolving against the tracked cwd is the best
            // available.
            let cwd = self.proctab.find(pid).and_then(|p| p.cwd.clone());
            let arg0 = argv_ref[0].clone();
            if arg0.starts_with('/') || cwd.is_some() {
                match sys::realpath(&arg0, cwd.as_deref()) {
                    Ok(path) => {
                        interp = Some(ImageExec::new(path, pid, tv, &self.stats));
                    }
                    Err(e) => {
                        if e.kind() == io::ErrorKind::OutOfMemory {
                            bump(&self.stats.ooms);
                        }
                    }
                }
            }
            if interp.is_none() {
                bump(&self.stats.miss_execinterp);
                log::debug!(
                    "miss_execinterp: subject.pid={pid} imagepath={} argv0={arg0}",
                    image.path
                );
                return;
            }
        }
        if let Some(interp) = &interp {
            let _ = interp.open(None);
        }

        // Replace the process's executable image.
        let proc = self.proctab.find_mut(pid).unwrap();
        let prev_image = proc.image_exec.take();
        let new_image = match interp {
            Some(interp) if shebang => {
                interp.state().script = Some(image);
                interp
            }
            _ => image,
        };
        if let Some(prev) = &prev_image {
            debug_assert!(!Arc::ptr_eq(prev, &new_image));
        }
        let cwd = proc.cwd.clone();
        let fork_tv = proc.fork_tv;
        {
            let mut st = new_image.state();
            st.tv = tv;
            st.fork_tv = Some(fork_tv);
            st.pid = pid;
            st.subject = Some(subject.clone());
            st.argv = argv;
            st.envv = envv;
            st.cwd = cwd;
            st.prev = prev_image;
        }
        proc.image_exec = Some(new_image.clone());

        let prev_nolog_kids = {
            let st = new_image.state();
            st.prev
                .as_ref()
                .map_or(false, |prev| prev.state().flags.nolog_kids)
        };
        if prev_nolog_kids {
            let mut st = new_image.state();
            st.flags.nolog = true;
            st.flags.nolog_kids = true;
        } else if new_image.match_suppressions(
            &self.config.suppress_ancestor_ident,
            &self.config.suppress_ancestor_path,
        ) {
            new_image.state().flags.nolog_kids = true;
        }

        self.worker.submit(new_image);
    }

    /// Handle exit. Delivered both for explicit exits and for wait4
    /// discoveries, so this must tolerate repeat calls; the process is
    /// already gone and no runtime lookup would succeed.
    pub fn exit(&mut self, tv: SystemTime, pid: Pid) {
        self.proctab.remove(pid, tv);
    }

    /// Handle wait4, which fires for suspended as well as terminated
    /// children: only treat it as an exit when the pid is truly gone.
    pub fn wait4(&mut self, tv: SystemTime, pid: Pid) {
        if pid.as_raw() == -1 || pid.as_raw() == 0 {
            return;
        }
        if !self.probes.alive(pid) {
            self.exit(tv, pid);
        }
    }

    /// Track working-directory changes, needed to resolve relative
    /// interpreter paths in shebangs.
    pub fn chdir(&mut self, tv: SystemTime, pid: Pid, path: String) {
        if !self.resolve(pid, tv) {
            bump(&self.stats.miss_chdirsubj);
            log::debug!("miss_chdirsubj: pid={pid} path={path}");
            return;
        }
        let proc = self.proctab.find_mut(pid).unwrap();
        proc.cwd = Some(path);
    }

    /// Current executable image of a pid, for other subsystems logging
    /// process context. Recovers the process when it is not tracked.
    pub fn image_by_pid(&mut self, pid: Pid, tv: SystemTime) -> Option<Arc<ImageExec>> {
        if self.proctab.find(pid).is_none() {
            if !self.proc_from_pid(pid, true, tv) {
                bump(&self.stats.miss_bypid);
                log::debug!("miss_bypid: pid={pid}");
                return None;
            }
            bump(&self.stats.liveacq);
        }
        self.proctab.find(pid).and_then(|p| p.image_exec.clone())
    }

    /// Tracked working directory of a pid.
    pub fn getcwd(&mut self, pid: Pid, tv: SystemTime) -> Option<String> {
        if self.proctab.find(pid).is_none() {
            if !self.proc_from_pid(pid, true, tv) {
                bump(&self.stats.miss_getcwd);
                log::debug!("miss_getcwd: pid={pid}");
                return None;
            }
            bump(&self.stats.liveacq);
        }
        self.proctab.find(pid).and_then(|p| p.cwd.clone())
    }

    /// Preload the process context for a pid at startup. Emission for
    /// preloaded images is configurable and off by default; processes
    /// recovered later are always logged.
    pub fn preload(&mut self, pid: Pid) {
        if self.proctab.find(pid).is_some() {
            // Already loaded as an ancestor of a previous call.
            return;
        }
        self.proc_from_pid(pid, self.config.log_preloaded_exec, SystemTime::now());
    }

    /// Socket-monitor client: new socket on a process.
    pub fn socket_create(&mut self, pid: Pid, fd: i32, proto: i32) {
        let Some(proc) = self.proctab.find_mut(pid) else {
            return;
        };
        proc.setfd(
            fd,
            FdCtx::Socket {
                proto,
                addr: None,
                port: 0,
            },
        );
    }

    /// Socket-monitor client: record the local address and return the
    /// protocol stored at creation. Zero when no state is available.
    pub fn socket_bind(&mut self, pid: Pid, fd: i32, addr: IpAddr, port: u16) -> i32 {
        let Some(proc) = self.proctab.find_mut(pid) else {
            return 0;
        };
        match proc.getfd_mut(fd) {
            Some(FdCtx::Socket {
                proto,
                addr: stored_addr,
                port: stored_port,
            }) => {
                *stored_addr = Some(addr);
                *stored_port = port;
                *proto
            }
            _ => 0,
        }
    }

    /// Socket-monitor client: stored socket state for a process fd.
    pub fn socket_state(&self, pid: Pid, fd: i32) -> (i32, Option<(IpAddr, u16)>) {
        match self.proctab.find(pid).and_then(|p| p.getfd(fd)) {
            Some(FdCtx::Socket { proto, addr, port }) => (*proto, addr.map(|a| (a, *port))),
            _ => (0, None),
        }
    }

    /// File-monitor client: a file was opened on a process fd.
    pub fn file_open(&mut self, subject: &AuditSubject, fd: i32, path: String) {
        let Some(proc) = self.proctab.find_mut(Pid::from_raw(subject.pid)) else {
            return;
        };
        proc.setfd(
            fd,
            FdCtx::File {
                subject: subject.clone(),
                path,
            },
        );
    }

    pub fn fd_close(&mut self, pid: Pid, fd: i32) {
        if let Some(proc) = self.proctab.find_mut(pid) {
            proc.closefd(fd);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn tracked_processes(&self) -> usize {
        self.proctab.len()
    }

    /// Tear the engine down: release all queued pre-exec images and the
    /// process table. The kernel-callback side must be quiesced first.
    /// Images still in the worker pipeline carry their own references.
    pub fn fini(&mut self) {
        let drained = self.prepq.drain();
        if !drained.is_empty() {
            log::debug!("fini: releasing {} queued pre-exec images", drained.len());
        }
        drop(drained);
        self.proctab.clear();
    }

    /// Find the subject in the table, recovering from the live process on
    /// a miss. The caller counts and reports its own miss kind.
    fn resolve(&mut self, pid: Pid, tv: SystemTime) -> bool {
        if self.proctab.find(pid).is_some() {
            return true;
        }
        if self.proc_from_pid(pid, true, tv) {
            bump(&self.stats.liveacq);
            return true;
        }
        false
    }

    /// Reconstruct a process whose fork was never observed, by runtime
    /// lookups against the live pid. Walks up and recovers the parent
    /// chain before submitting the child, so ancestor links are in place.
    /// Returns false when the process is gone.
    fn proc_from_pid(&mut self, pid: Pid, log_event: bool, tv: SystemTime) -> bool {
        self.proctab.find_or_create(pid);

        let (fork_tv, ppid) = match self.probes.pid_info(pid) {
            Ok(info) => info,
            Err(_) => {
                // Not alive anymore.
                self.proctab.remove(pid, tv);
                return false;
            }
        };

        let cwd = match self.probes.pid_cwd(pid) {
            Ok(cwd) => cwd,
            Err(e) => {
                if e.is_oom() {
                    bump(&self.stats.ooms);
                }
                self.proctab.remove(pid, tv);
                return false;
            }
        };

        let image = self.image_from_pid(pid);
        let _ = image.open(None);

        // Go after the parent before submitting the child into the queues.
        if ppid.as_raw() >= 0 && ppid != pid {
            let parent_known = self.proctab.find(ppid).is_some();
            if parent_known || self.proc_from_pid(ppid, log_event, tv) {
                if let Some(parent_image) =
                    self.proctab.find(ppid).and_then(|p| p.image_exec.clone())
                {
                    image.state().prev = Some(parent_image);
                }
            }
        }

        if !log_event || pid.as_raw() == 0 {
            image.state().flags.nolog = true;
        }

        let proc = self.proctab.find_or_create(pid);
        proc.fork_tv = fork_tv;
        proc.cwd = Some(cwd);
        proc.image_exec = Some(image.clone());
        self.worker.submit(image);
        true
    }

    /// Image record for a live pid; synthesizes a `<pid>` path when the
    /// runtime lookup cannot produce one.
    fn image_from_pid(&mut self, pid: Pid) -> Arc<ImageExec> {
        let now = SystemTime::now();
        let image = match self.probes.pid_path(pid) {
            Ok(path) => ImageExec::new(path, pid, now, &self.stats),
            Err(e) => {
                if e.is_oom() {
                    bump(&self.stats.ooms);
                }
                let image = ImageExec::new(format!("<{pid}>"), pid, now, &self.stats);
                image.state().flags.nopath = true;
                image
            }
        };
        image.state().flags.pidlookup = true;
        image
    }
}
