//! Engine task and handles.
//!
//! The correlator owns the process table and must see audit records in
//! commit order; a single task gives it that affinity, the same way the
//! audit thread does in-process. Audit-side callers hold a cloneable
//! [`ProcMonHandle`] and enqueue commands; queries reply over oneshot
//! channels. The kernel-callback side gets its own [`KernelHandle`], which
//! only shares the pre-exec queue and runs synchronously on its caller.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use nix::unistd::Pid;
use tokio::sync::{mpsc, oneshot};

use crate::acquire::Acquirer;
use crate::bus::Bus;
use crate::codesign::SignatureChecker;
use crate::config::Config;
use crate::image::ImageExec;
use crate::prepq::PreExecQueue;
use crate::procmon::ProcMon;
use crate::stats::{ProcMonStats, StatsSnapshot};
use crate::sys::{AuditSubject, StatAttr, SystemProbes};
use crate::worker;

/// Start the engine: correlator task, worker task and event bus.
pub fn start_engine(
    config: Arc<Config>,
    probes: Arc<dyn SystemProbes>,
    checker: Arc<dyn SignatureChecker>,
) -> Engine {
    let stats = Arc::new(ProcMonStats::default());
    let prepq = Arc::new(PreExecQueue::new(stats.clone()));
    let acquirer = Acquirer::new(config.clone(), checker, stats.clone());
    let bus = Bus::new();
    let worker = worker::start_worker(acquirer.clone(), bus.clone());
    let mut procmon = ProcMon::new(config, probes, prepq.clone(), worker, stats.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            handle_request(&mut procmon, req);
        }
        // All audit-side handles are gone; the kernel side must already be
        // quiesced by the daemon's shutdown ordering.
        procmon.fini();
    });

    Engine {
        handle: ProcMonHandle { tx },
        kernel: KernelHandle {
            prepq,
            acquirer,
            stats,
        },
        bus,
    }
}

pub struct Engine {
    pub handle: ProcMonHandle,
    pub kernel: KernelHandle,
    pub bus: Bus,
}

enum Request {
    Fork {
        tv: SystemTime,
        subject: AuditSubject,
        childpid: Pid,
    },
    Spawn {
        tv: SystemTime,
        subject: AuditSubject,
        childpid: Pid,
        imagepath: String,
        attr: Option<StatAttr>,
        argv: Option<Vec<String>>,
        envv: Option<Vec<String>>,
    },
    Exec {
        tv: SystemTime,
        subject: AuditSubject,
        imagepath: String,
        attr: Option<StatAttr>,
        argv: Option<Vec<String>>,
        envv: Option<Vec<String>>,
    },
    Exit {
        tv: SystemTime,
        pid: Pid,
    },
    Wait4 {
        tv: SystemTime,
        pid: Pid,
    },
    Chdir {
        tv: SystemTime,
        pid: Pid,
        path: String,
    },
    Preload {
        pid: Pid,
    },
    ImageByPid {
        pid: Pid,
        tv: SystemTime,
        tx_reply: oneshot::Sender<Option<Arc<ImageExec>>>,
    },
    Getcwd {
        pid: Pid,
        tv: SystemTime,
        tx_reply: oneshot::Sender<Option<String>>,
    },
    SocketCreate {
        pid: Pid,
        fd: i32,
        proto: i32,
    },
    SocketBind {
        pid: Pid,
        fd: i32,
        addr: IpAddr,
        port: u16,
        tx_reply: oneshot::Sender<i32>,
    },
    SocketState {
        pid: Pid,
        fd: i32,
        tx_reply: oneshot::Sender<(i32, Option<(IpAddr, u16)>)>,
    },
    FileOpen {
        subject: AuditSubject,
        fd: i32,
        path: String,
    },
    FdClose {
        pid: Pid,
        fd: i32,
    },
    Stats {
        tx_reply: oneshot::Sender<StatsSnapshot>,
    },
}

fn handle_request(procmon: &mut ProcMon, req: Request) {
    match req {
        Request::Fork {
            tv,
            subject,
            childpid,
        } => procmon.fork(tv, &subject, childpid),
        Request::Spawn {
            tv,
            subject,
            childpid,
            imagepath,
            attr,
            argv,
            envv,
        } => procmon.spawn(tv, &subject, childpid, imagepath, attr, argv, envv),
        Request::Exec {
            tv,
            subject,
            imagepath,
            attr,
            argv,
            envv,
        } => procmon.exec(tv, &subject, imagepath, attr, argv, envv),
        Request::Exit { tv, pid } => procmon.exit(tv, pid),
        Request::Wait4 { tv, pid } => procmon.wait4(tv, pid),
        Request::Chdir { tv, pid, path } => procmon.chdir(tv, pid, path),
        Request::Preload { pid } => procmon.preload(pid),
        Request::ImageByPid { pid, tv, tx_reply } => {
            let _ = tx_reply.send(procmon.image_by_pid(pid, tv));
        }
        Request::Getcwd { pid, tv, tx_reply } => {
            let _ = tx_reply.send(procmon.getcwd(pid, tv));
        }
        Request::SocketCreate { pid, fd, proto } => procmon.socket_create(pid, fd, proto),
        Request::SocketBind {
            pid,
            fd,
            addr,
            port,
            tx_reply,
        } => {
            let _ = tx_reply.send(procmon.socket_bind(pid, fd, addr, port));
        }
        Request::SocketState { pid, fd, tx_reply } => {
            let _ = tx_reply.send(procmon.socket_state(pid, fd));
        }
        Request::FileOpen { subject, fd, path } => procmon.file_open(&subject, fd, path),
        Request::FdClose { pid, fd } => procmon.fd_close(pid, fd),
        Request::Stats { tx_reply } => {
            let _ = tx_reply.send(procmon.snapshot());
        }
    }
}

/// Audit-side handle to the correlator task.
#[derive(Clone)]
pub struct ProcMonHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl ProcMonHandle {
    fn send(&self, req: Request) {
        // The task only stops after every handle is dropped.
        let r = self.tx.send(req);
        assert!(r.is_ok());
    }

    pub fn fork(&self, tv: SystemTime, subject: AuditSubject, childpid: Pid) {
        self.send(Request::Fork {
            tv,
            subject,
            childpid,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        &self,
        tv: SystemTime,
        subject: AuditSubject,
        childpid: Pid,
        imagepath: String,
        attr: Option<StatAttr>,
        argv: Option<Vec<String>>,
        envv: Option<Vec<String>>,
    ) {
        self.send(Request::Spawn {
            tv,
            subject,
            childpid,
            imagepath,
            attr,
            argv,
            envv,
        });
    }

    pub fn exec(
        &self,
        tv: SystemTime,
        subject: AuditSubject,
        imagepath: String,
        attr: Option<StatAttr>,
        argv: Option<Vec<String>>,
        envv: Option<Vec<String>>,
    ) {
        self.send(Request::Exec {
            tv,
            subject,
            imagepath,
            attr,
            argv,
            envv,
        });
    }

    pub fn exit(&self, tv: SystemTime, pid: Pid) {
        self.send(Request::Exit { tv, pid });
    }

    pub fn wait4(&self, tv: SystemTime, pid: Pid) {
        self.send(Request::Wait4 { tv, pid });
    }

    pub fn chdir(&self, tv: SystemTime, pid: Pid, path: String) {
        self.send(Request::Chdir { tv, pid, path });
    }

    pub fn preload(&self, pid: Pid) {
        self.send(Request::Preload { pid });
    }

    pub async fn image_by_pid(&self, pid: Pid, tv: SystemTime) -> Option<Arc<ImageExec>> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(Request::ImageByPid { pid, tv, tx_reply });
        rx_reply.await.unwrap()
    }

    pub async fn getcwd(&self, pid: Pid, tv: SystemTime) -> Option<String> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(Request::Getcwd { pid, tv, tx_reply });
        rx_reply.await.unwrap()
    }

    pub fn socket_create(&self, pid: Pid, fd: i32, proto: i32) {
        self.send(Request::SocketCreate { pid, fd, proto });
    }

    pub async fn socket_bind(&self, pid: Pid, fd: i32, addr: IpAddr, port: u16) -> i32 {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(Request::SocketBind {
            pid,
            fd,
            addr,
            port,
            tx_reply,
        });
        rx_reply.await.unwrap()
    }

    pub async fn socket_state(&self, pid: Pid, fd: i32) -> (i32, Option<(IpAddr, u16)>) {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(Request::SocketState { pid, fd, tx_reply });
        rx_reply.await.unwrap()
    }

    pub fn file_open(&self, subject: AuditSubject, fd: i32, path: String) {
        self.send(Request::FileOpen { subject, fd, path });
    }

    pub fn fd_close(&self, pid: Pid, fd: i32) {
        self.send(Request::FdClose { pid, fd });
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(Request::Stats { tx_reply });
        rx_reply.await.unwrap()
    }
}

/// Kernel-callback-side handle.
///
/// Runs synchronously on the calling thread while the kernel waits for the
/// pre-exec verdict; for scripts it is invoked first for the script, then
/// for the interpreter. Shares only the pre-exec queue and the acquisition
/// context with the rest of the engine.
#[derive(Clone)]
pub struct KernelHandle {
    prepq: Arc<PreExecQueue>,
    acquirer: Acquirer,
    stats: Arc<ProcMonStats>,
}

impl KernelHandle {
    pub fn preexec(&self, tv: SystemTime, pid: Pid, imagepath: &str) {
        let image = ImageExec::new(imagepath.to_string(), pid, tv, &self.stats);
        let _ = image.open(None);
        if let Err(err) = self.acquirer.acquire(&image, true) {
            log::debug!("preexec acquisition incomplete for {imagepath}: {err}");
        }
        self.prepq.append(image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::UnsignedChecker;
    use crate::sys::ProbeError;
    use std::fs;
    use std::time::UNIX_EPOCH;

    /// Probes for a world with a single init-like process.
    struct InitOnly;

    impl SystemProbes for InitOnly {
        fn pid_path(&self, _pid: Pid) -> Result<String, ProbeError> {
            Ok("/sbin/init-like".to_string())
        }
        fn pid_cwd(&self, _pid: Pid) -> Result<String, ProbeError> {
            Ok("/".to_string())
        }
        fn pid_info(&self, pid: Pid) -> Result<(SystemTime, Pid), ProbeError> {
            Ok((UNIX_EPOCH, pid))
        }
        fn alive(&self, _pid: Pid) -> bool {
            true
        }
        fn running_pids(&self) -> Result<Vec<Pid>, ProbeError> {
            Ok(vec![Pid::from_raw(1)])
        }
    }

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

    #[tokio::test]
    async fn full_pipeline_from_preexec_to_event() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, b"end to end").unwrap();
        let tool_path = tool.to_str().unwrap().to_string();

        let engine = start_engine(
            Arc::new(Config::default()),
            Arc::new(InitOnly),
            Arc::new(UnsignedChecker),
        );
        let mut events = engine.bus.get_receiver();

        let tv = SystemTime::now();
        engine.kernel.preexec(tv, Pid::from_raw(100), &tool_path);
        engine.handle.fork(tv, subject(1), Pid::from_raw(100));
        let attr = crate::sys::pathattr(&tool_path).unwrap();
        engine.handle.exec(
            tv,
            subject(100),
            tool_path.clone(),
            Some(attr),
            Some(vec!["tool".to_string()]),
            None,
        );

        // The recovered parent comes through first, then the exec.
        let first = events.recv().await.unwrap();
        assert_eq!(first.path, "/sbin/init-like");
        let second = events.recv().await.unwrap();
        assert_eq!(second.path, tool_path);
        assert!(second.hashes.is_some());
        assert_eq!(second.pid, 100);

        let stats = engine.handle.stats().await;
        assert_eq!(stats.pqmiss, 0);
        assert_eq!(stats.liveacq, 1);
    }

    #[tokio::test]
    async fn queries_marshal_through_the_task() {
        let engine = start_engine(
            Arc::new(Config::default()),
            Arc::new(InitOnly),
            Arc::new(UnsignedChecker),
        );
        let tv = SystemTime::now();
        let pid = Pid::from_raw(42);
        let image = engine.handle.image_by_pid(pid, tv).await.unwrap();
        assert_eq!(image.path, "/sbin/init-like");
        assert_eq!(engine.handle.getcwd(pid, tv).await.as_deref(), Some("/"));

        engine.handle.socket_create(pid, 7, 17);
        let addr: IpAddr = "::1".parse().unwrap();
        assert_eq!(engine.handle.socket_bind(pid, 7, addr, 53).await, 17);
        let (proto, bound) = engine.handle.socket_state(pid, 7).await;
        assert_eq!(proto, 17);
        assert_eq!(bound, Some((addr, 53)));
        engine.handle.fd_close(pid, 7);
        assert_eq!(engine.handle.socket_state(pid, 7).await, (0, None));
    }
}
