//! Executable-image records.
//!
//! An [`ImageExec`] describes one image acquisition: the path observed at
//! exec time plus everything captured around it (stat, digests, signature,
//! argv/env/cwd, the audit subject, the ancestor chain and an optional
//! interpreted-script link). Records are shared via `Arc`; the strong count
//! is the reference count, and per-record mutable state sits behind the
//! record's own mutex so at most one thread mutates an image at a time.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use nix::unistd::Pid;

use crate::codesign::Codesign;
use crate::hashes::Hashes;
use crate::stats::ProcMonStats;
use crate::sys::{AuditSubject, StatAttr};

/// Acquisition-state flags of one image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFlags {
    /// Stat acquired from the file itself.
    pub stat: bool,
    /// Stat failed or mismatched; audit attributes substituted.
    pub attr: bool,
    pub hashes: bool,
    pub shebang: bool,
    /// Acquisition pipeline terminated, successfully or not.
    pub done: bool,
    /// Pid lookup produced no path; a synthetic `<pid>` path was used.
    pub nopath: bool,
    /// Constructed by recovery from a live pid.
    pub pidlookup: bool,
    /// Suppress emission of this image.
    pub nolog: bool,
    /// Propagate suppression to descendant images.
    pub nolog_kids: bool,
    /// Acquisition impaired by kernel-reported memory exhaustion.
    pub enomem: bool,
}

#[derive(Debug)]
pub struct ImageState {
    pub pid: Pid,
    pub fd: Option<File>,
    pub stat: Option<StatAttr>,
    pub flags: ImageFlags,
    pub hashes: Option<Hashes>,
    pub codesign: Option<Codesign>,
    pub argv: Option<Vec<String>>,
    pub envv: Option<Vec<String>>,
    pub cwd: Option<String>,
    pub subject: Option<AuditSubject>,
    /// Fork timestamp of the process this image executed in.
    pub fork_tv: Option<SystemTime>,
    /// Event timestamp.
    pub tv: SystemTime,
    /// Age counter while queued in the pre-exec queue.
    pub pqttl: u32,
    /// Previously executing image of the same process.
    pub prev: Option<Arc<ImageExec>>,
    /// The script file, when this image is an interpreter invoked through a
    /// shebang.
    pub script: Option<Arc<ImageExec>>,
}

pub struct ImageExec {
    pub path: String,
    state: Mutex<ImageState>,
    stats: Arc<ProcMonStats>,
}

impl std::fmt::Debug for ImageExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("ImageExec")
            .field("path", &self.path)
            .field("pid", &st.pid)
            .field("flags", &st.flags)
            .finish()
    }
}

impl ImageExec {
    /// Takes ownership of `path`. The new record holds no fd and nothing
    /// acquired yet.
    pub fn new(
        path: String,
        pid: Pid,
        tv: SystemTime,
        stats: &Arc<ProcMonStats>,
    ) -> Arc<Self> {
        stats.images.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            path,
            state: Mutex::new(ImageState {
                pid,
                fd: None,
                stat: None,
                flags: ImageFlags::default(),
                hashes: None,
                codesign: None,
                argv: None,
                envv: None,
                cwd: None,
                subject: None,
                fork_tv: None,
                tv,
                pqttl: 0,
                prev: None,
                script: None,
            }),
            stats: stats.clone(),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, ImageState> {
        self.state.lock().unwrap()
    }

    /// Acquire stat for the image, opening the file by path.
    ///
    /// No-op if stat or audit attributes were already acquired. Detects a
    /// `#!` prefix while the fd is open. When the open or stat fails, or the
    /// stat identity mismatches a supplied audit attribute, the audit
    /// attribute is installed instead: the audit record is authoritative for
    /// identity because the file may have been replaced since the exec.
    pub fn open(&self, attr: Option<&StatAttr>) -> io::Result<()> {
        let mut st = self.state();
        if st.flags.stat || st.flags.attr {
            return Ok(());
        }

        let fallback = |st: &mut MutexGuard<'_, ImageState>, err: io::Error| match attr {
            Some(a) => {
                st.stat = Some(*a);
                st.flags.attr = true;
                Ok(())
            }
            None => Err(err),
        };

        if st.flags.nopath {
            return fallback(&mut st, io::Error::from(io::ErrorKind::NotFound));
        }

        assert!(!self.path.starts_with("/dev/"));
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => return fallback(&mut st, e),
        };
        let stat = match file.metadata() {
            Ok(md) => StatAttr::from_metadata(&md),
            Err(e) => return fallback(&mut st, e),
        };
        if let Some(a) = attr {
            if !stat.same_identity(a) {
                return fallback(&mut st, io::Error::from(io::ErrorKind::InvalidData));
            }
        }

        let mut buf = [0u8; 2];
        if matches!(file.read_at(&mut buf, 0), Ok(2)) && &buf == b"#!" {
            st.flags.shebang = true;
        }

        st.stat = Some(stat);
        st.fd = Some(file);
        st.flags.stat = true;
        Ok(())
    }

    /// Release the fd if open.
    pub fn close(&self) {
        self.state().fd = None;
    }

    /// True iff the image has a good signature whose identifier or team id
    /// is in `by_ident`, or its path (or, for interpreters, the script
    /// path) is in `by_path`.
    pub fn match_suppressions(
        &self,
        by_ident: &HashSet<String>,
        by_path: &HashSet<String>,
    ) -> bool {
        let st = self.state();
        if let Some(cs) = &st.codesign {
            if cs.is_good() {
                if let Some(ident) = &cs.ident {
                    if by_ident.contains(ident) {
                        return true;
                    }
                }
                if let Some(teamid) = &cs.teamid {
                    if by_ident.contains(teamid) {
                        return true;
                    }
                }
            }
        }
        if by_path.contains(&self.path) {
            return true;
        }
        if let Some(script) = &st.script {
            if by_path.contains(&script.path) {
                return true;
            }
        }
        false
    }
}

impl Drop for ImageExec {
    fn drop(&mut self) {
        self.stats.images.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Prune the exec history of `image` to `max_levels` previous levels.
///
/// Walks back only through images whose strong count observed 1, i.e. the
/// whole path back is exclusively owned; cutting deeper would shorten
/// another fork's view of the same history.
pub fn prune_ancestors(image: &Arc<ImageExec>, max_levels: usize) {
    fn inner(image: &Arc<ImageExec>, level: usize, max_levels: usize) {
        let refs = Arc::strong_count(image);
        let mut st = image.state();
        if st.prev.is_none() {
            return;
        }
        if level >= max_levels {
            st.prev = None;
            return;
        }
        if refs == 1 {
            // Parent lock is held across the descent; prev links form a
            // tree, so the ordering is acyclic.
            if let Some(prev) = &st.prev {
                inner(prev, level + 1, max_levels);
            }
        }
    }
    inner(image, 0, max_levels)
}
