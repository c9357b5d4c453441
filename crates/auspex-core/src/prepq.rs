//! Pre-exec queue.
//!
//! FIFO of images produced by the kernel callback, awaiting their audit exec
//! record. Producers append from the callback thread; the correlator is the
//! only remover. A coarse mutex protects the list; the correlator drives
//! traversal internally while holding the lock across a match attempt.
//!
//! Linking the audit record to the right kernel-side images even when either
//! side drops events is the tricky part of the whole engine: matching is by
//! `(pid, dev, ino)` when the audit layer supplied file attributes and by
//! `(pid, basename)` otherwise, and every lookup ages the entries it skips
//! so that unmatched images cannot accumulate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::Ordering;

use nix::unistd::Pid;

use crate::image::ImageExec;
use crate::stats::{bump, ProcMonStats};
use crate::sys::{self, StatAttr};

/// Lookups an entry survives being skipped by before it is evicted.
pub const MAX_PQ_TTL: u32 = 16;

pub struct PreExecQueue {
    stats: Arc<ProcMonStats>,
    inner: Mutex<VecDeque<Arc<ImageExec>>>,
}

impl PreExecQueue {
    pub fn new(stats: Arc<ProcMonStats>) -> Self {
        Self {
            stats,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Tail insert, producer side.
    pub fn append(&self, image: Arc<ImageExec>) {
        let mut q = self.inner.lock().unwrap();
        q.push_back(image);
        self.stats.pqsize.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Remove and return all queued images, for teardown.
    pub fn drain(&self) -> Vec<Arc<ImageExec>> {
        let mut q = self.inner.lock().unwrap();
        let drained: Vec<_> = q.drain(..).collect();
        self.stats
            .pqsize
            .fetch_sub(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Head-to-tail search for the images belonging to an audit exec.
    ///
    /// The first match wins. When the matched image is a shebang script and
    /// `argv` carries at least the interpreter and the script, the scan
    /// continues for a second match on `(pid, basename(argv[0]))`: the
    /// kernel hook only supplied attributes for the script, so the
    /// interpreter can only be matched by name. Every skipped entry ages by
    /// one; entries reaching the TTL are evicted and released.
    pub fn lookup(
        &self,
        pid: Pid,
        attr: Option<&StatAttr>,
        imagepath: &str,
        argv: Option<&[String]>,
    ) -> (Option<Arc<ImageExec>>, Option<Arc<ImageExec>>) {
        let mut q = self.inner.lock().unwrap();
        bump(&self.stats.pqlookup);

        let mut image: Option<Arc<ImageExec>> = None;
        let mut interp: Option<Arc<ImageExec>> = None;
        let mut i = 0;
        while i < q.len() {
            if image.is_none() {
                let (hit, shebang) = {
                    let st = q[i].state();
                    let hit = st.pid == pid
                        && match attr {
                            Some(a) => st
                                .stat
                                .map_or(false, |s| s.dev == a.dev && s.ino == a.ino),
                            None => sys::basename_eq(&q[i].path, imagepath),
                        };
                    (hit, st.flags.shebang)
                };
                if hit {
                    let found = q.remove(i).unwrap();
                    self.stats.pqsize.fetch_sub(1, Ordering::Relaxed);
                    image = Some(found);
                    // Script executions carry the interpreter as argv[0]
                    // and the script file as argv[1].
                    if shebang && argv.map_or(false, |a| a.len() >= 2) {
                        continue;
                    }
                    break;
                }
            } else {
                let argv = argv.unwrap();
                let hit = {
                    let st = q[i].state();
                    st.pid == pid && sys::basename_eq(&q[i].path, &argv[0])
                };
                if hit {
                    let found = q.remove(i).unwrap();
                    self.stats.pqsize.fetch_sub(1, Ordering::Relaxed);
                    interp = Some(found);
                    break;
                }
            }

            bump(&self.stats.pqskip);
            let ttl = {
                let mut st = q[i].state();
                st.pqttl += 1;
                st.pqttl
            };
            if ttl >= MAX_PQ_TTL {
                let dropped = q.remove(i).unwrap();
                self.stats.pqsize.fetch_sub(1, Ordering::Relaxed);
                bump(&self.stats.pqdrop);
                log::debug!(
                    "prepq: looking for {}[{}]: dropped {}[{}]",
                    imagepath,
                    pid,
                    dropped.path,
                    dropped.state().pid
                );
                continue;
            }
            i += 1;
        }
        debug_assert!(!(interp.is_some() && image.is_none()));
        (image, interp)
    }
}
