//! Image attribute acquisition.
//!
//! Stat, shebang detection, hashing and signature lookup, with cache
//! interposition. Every expensive step is bracketed by before/after stat
//! comparisons: when the on-disk file changes between first observation and
//! completion, the attributes are discarded rather than mis-attributed.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::{CsigCache, HashCache, HashCacheKey};
use crate::codesign::{CsigError, SignatureChecker};
use crate::config::{Config, KernelLevel};
use crate::hashes::hash_file;
use crate::image::ImageExec;
use crate::stats::ProcMonStats;
use crate::sys;

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("no stat or fd available for hashing")]
    NoStat,
    #[error("file changed during acquisition")]
    MovingTarget,
    #[error("i/o during acquisition")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Signature(#[from] CsigError),
}

/// Shared acquisition context: configuration snapshot, both caches, the
/// signature backend and the statistics block.
#[derive(Clone)]
pub struct Acquirer {
    config: Arc<Config>,
    hash_cache: Arc<HashCache>,
    csig_cache: Arc<CsigCache>,
    checker: Arc<dyn SignatureChecker>,
    stats: Arc<ProcMonStats>,
}

impl Acquirer {
    pub fn new(
        config: Arc<Config>,
        checker: Arc<dyn SignatureChecker>,
        stats: Arc<ProcMonStats>,
    ) -> Self {
        let hash_cache = Arc::new(HashCache::new(config.hash_cache_size));
        let csig_cache = Arc::new(CsigCache::new(config.csig_cache_size));
        Self {
            config,
            hash_cache,
            csig_cache,
            checker,
            stats,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ProcMonStats> {
        &self.stats
    }

    /// Run the pipeline on `image` as far as the current stage allows.
    ///
    /// `kern` indicates we are still inside the kernel pre-exec callback;
    /// expensive stages are deferred to the worker according to the
    /// configured kernel level, file size and helper-path rules. Returning
    /// `Ok` without the DONE flag means acquisition was deferred, not
    /// completed.
    pub fn acquire(&self, image: &ImageExec, kern: bool) -> Result<(), AcquireError> {
        let mut st = image.state();

        if st.flags.done {
            return Ok(());
        }

        if kern && self.config.kernel_level < KernelLevel::Hash {
            return Ok(());
        }

        if kern && st.stat.map_or(0, |s| s.size) > self.config.large_file_max {
            return Ok(());
        }

        if !st.flags.hashes {
            if !st.flags.stat || st.fd.is_none() {
                st.flags.done = true;
                return Err(AcquireError::NoStat);
            }
            let stat = st.stat.unwrap();
            let key = HashCacheKey::from(&stat);
            match self.hash_cache.get(&key) {
                Some(hashes) => {
                    log::trace!("hashes for {} from cache", image.path);
                    st.hashes = Some(hashes);
                }
                None => {
                    let fd = st.fd.as_mut().unwrap();
                    let (read, hashes) = match hash_file(self.config.hashes, fd) {
                        Ok(r) => r,
                        Err(e) => {
                            if e.kind() == io::ErrorKind::OutOfMemory {
                                st.flags.enomem = true;
                            }
                            st.fd = None;
                            st.flags.done = true;
                            return Err(e.into());
                        }
                    };
                    if read != stat.size {
                        st.fd = None;
                        st.flags.done = true;
                        return Err(AcquireError::MovingTarget);
                    }
                    // Second stat over the still-open fd; dev and ino
                    // cannot have changed underneath it.
                    let restat = match sys::fdattr(st.fd.as_ref().unwrap()) {
                        Ok(s) => s,
                        Err(e) => {
                            st.fd = None;
                            st.flags.done = true;
                            return Err(e.into());
                        }
                    };
                    if !stat.same_content(&restat) {
                        st.fd = None;
                        st.flags.done = true;
                        return Err(AcquireError::MovingTarget);
                    }
                    self.hash_cache.put(key, hashes.clone());
                    st.hashes = Some(hashes);
                }
            }
            st.flags.hashes = true;
        }

        // Everything below operates on paths, not open file descriptors.
        st.fd = None;

        if kern && self.config.kernel_level < KernelLevel::Csig {
            return Ok(());
        }

        // Scripts are not code-signed.
        if st.flags.shebang {
            st.flags.done = true;
            return Ok(());
        }

        if st.codesign.is_none() && st.flags.hashes {
            if let Some(hashes) = &st.hashes {
                if let Some(cs) = self.csig_cache.get(hashes) {
                    log::trace!("codesign for {} from cache", image.path);
                    st.codesign = Some(cs);
                }
            }
        }

        if st.codesign.is_none() && self.config.codesign {
            // Signature checks of these images may themselves be the cause
            // of the exec being handled; off the callback path only.
            if kern && self.config.codesign_helpers.contains(&image.path) {
                return Ok(());
            }

            let cs = match self.checker.check(&image.path) {
                Ok(cs) => cs,
                Err(e) => {
                    if e.is_oom() {
                        st.flags.enomem = true;
                    }
                    st.flags.done = true;
                    return Err(e.into());
                }
            };
            st.codesign = Some(cs);

            // Third stat, by path: if it fails the result is unusable but
            // the signature stays; if it mismatches, the path now refers to
            // a different file and the signature is discarded.
            let restat = match sys::pathattr(&image.path) {
                Ok(s) => s,
                Err(e) => {
                    st.flags.done = true;
                    return Err(e.into());
                }
            };
            let stat = st.stat.unwrap();
            if !stat.same_file(&restat) {
                st.codesign = None;
                st.flags.done = true;
                return Err(AcquireError::MovingTarget);
            }

            if let (Some(hashes), Some(cs)) = (&st.hashes, &st.codesign) {
                self.csig_cache.put(hashes.clone(), cs.clone());
            }
        }

        st.flags.done = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::{Codesign, CsigStatus, UnsignedChecker};
    use crate::hashes::hex;
    use nix::unistd::Pid;
    use std::fs;
    use std::io::Write;
    use std::time::UNIX_EPOCH;

    fn acquirer(config: Config) -> Acquirer {
        Acquirer::new(
            Arc::new(config),
            Arc::new(UnsignedChecker),
            Arc::new(ProcMonStats::default()),
        )
    }

    fn opened_image(path: &std::path::Path, acq: &Acquirer) -> Arc<ImageExec> {
        let img = ImageExec::new(
            path.to_str().unwrap().to_string(),
            Pid::from_raw(100),
            UNIX_EPOCH,
            acq.stats(),
        );
        img.open(None).unwrap();
        img
    }

    #[test]
    fn acquires_hashes_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"binary contents").unwrap();
        let acq = acquirer(Config::default());
        let img = opened_image(&path, &acq);

        acq.acquire(&img, false).unwrap();
        let st = img.state();
        assert!(st.flags.done);
        assert!(st.flags.hashes);
        assert!(st.fd.is_none());
        let sha = st.hashes.as_ref().unwrap().sha256.unwrap();
        let (_, expect) = hash_file(
            HashKinds::default(),
            &mut fs::File::open(&path).unwrap(),
        )
        .unwrap();
        assert_eq!(sha, expect.sha256.unwrap());
    }

    use crate::hashes::HashKinds;

    #[test]
    fn acquisition_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"abc").unwrap();
        let acq = acquirer(Config::default());
        let img = opened_image(&path, &acq);
        acq.acquire(&img, false).unwrap();
        let first = img.state().hashes.clone();
        // Modifying the file after DONE must not change anything.
        fs::write(&path, b"different").unwrap();
        acq.acquire(&img, false).unwrap();
        assert_eq!(img.state().hashes, first);
    }

    #[test]
    fn mid_acquire_mutation_invalidates_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"original").unwrap();
        let acq = acquirer(Config::default());
        let img = opened_image(&path, &acq);
        // Grow the file between the first stat (open) and hashing; the
        // byte count then disagrees with the recorded size.
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b" grew").unwrap();
        drop(f);

        let err = acq.acquire(&img, false).unwrap_err();
        assert!(matches!(err, AcquireError::MovingTarget));
        let st = img.state();
        assert!(st.flags.done);
        assert!(!st.flags.hashes);
        assert!(st.hashes.is_none());
        // No cache write happened: a fresh image over the new content
        // computes, rather than adopts, its hashes.
        drop(st);
        let fresh = opened_image(&path, &acq);
        acq.acquire(&fresh, false).unwrap();
        assert!(fresh.state().flags.hashes);
    }

    #[test]
    fn cache_hit_adopts_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"cache me").unwrap();
        let acq = acquirer(Config::default());
        let first = opened_image(&path, &acq);
        acq.acquire(&first, false).unwrap();
        let digests = first.state().hashes.clone().unwrap();

        let second = opened_image(&path, &acq);
        acq.acquire(&second, false).unwrap();
        assert_eq!(second.state().hashes.as_ref(), Some(&digests));
    }

    #[test]
    fn kern_defers_below_hash_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"deferred").unwrap();
        let acq = acquirer(Config {
            kernel_level: KernelLevel::Open,
            ..Config::default()
        });
        let img = opened_image(&path, &acq);
        acq.acquire(&img, true).unwrap();
        let st = img.state();
        assert!(!st.flags.done);
        assert!(!st.flags.hashes);
        assert!(st.fd.is_some());
    }

    #[test]
    fn kern_defers_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        fs::write(&path, vec![0u8; 32]).unwrap();
        let acq = acquirer(Config {
            large_file_max: 16,
            ..Config::default()
        });
        let img = opened_image(&path, &acq);
        acq.acquire(&img, true).unwrap();
        assert!(!img.state().flags.done);
        // The worker picks it up unrestricted.
        acq.acquire(&img, false).unwrap();
        assert!(img.state().flags.done);
        assert!(img.state().flags.hashes);
    }

    #[test]
    fn shebang_skips_codesign() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        let acq = acquirer(Config {
            codesign: true,
            ..Config::default()
        });
        let img = opened_image(&path, &acq);
        acq.acquire(&img, false).unwrap();
        let st = img.state();
        assert!(st.flags.done);
        assert!(st.codesign.is_none());
    }

    struct GoodChecker;
    impl SignatureChecker for GoodChecker {
        fn check(&self, _path: &str) -> Result<Codesign, CsigError> {
            Ok(Codesign {
                status: CsigStatus::Good,
                ident: Some("com.example.tool".to_string()),
                teamid: Some("TEAM1".to_string()),
            })
        }
    }

    #[test]
    fn codesign_computed_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"signed tool").unwrap();
        let config = Config {
            codesign: true,
            ..Config::default()
        };
        let acq = Acquirer::new(
            Arc::new(config),
            Arc::new(GoodChecker),
            Arc::new(ProcMonStats::default()),
        );
        let img = opened_image(&path, &acq);
        acq.acquire(&img, false).unwrap();
        let st = img.state();
        assert!(st.flags.done);
        assert!(st.codesign.as_ref().unwrap().is_good());
        drop(st);

        // Same digests resolve from the signature cache even with a
        // checker that would now disagree.
        let acq2 = Acquirer {
            checker: Arc::new(UnsignedChecker),
            ..acq.clone()
        };
        let img2 = opened_image(&path, &acq2);
        acq2.acquire(&img2, false).unwrap();
        assert!(img2.state().codesign.as_ref().unwrap().is_good());
    }

    #[test]
    fn kern_defers_codesign_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verifyd");
        fs::write(&path, b"helper").unwrap();
        let path_str = path.to_str().unwrap().to_string();
        let config = Config {
            codesign: true,
            kernel_level: KernelLevel::Csig,
            codesign_helpers: [path_str].into(),
            ..Config::default()
        };
        let acq = Acquirer::new(
            Arc::new(config),
            Arc::new(GoodChecker),
            Arc::new(ProcMonStats::default()),
        );
        let img = opened_image(&path, &acq);
        acq.acquire(&img, true).unwrap();
        let st = img.state();
        assert!(st.flags.hashes);
        assert!(st.codesign.is_none());
        assert!(!st.flags.done);
    }
}
