//! Engine configuration snapshot.
//!
//! Built once by the daemon at startup and shared read-only. Images that are
//! still in the worker pipeline at teardown carry everything they need from
//! splice time and never reach back into the configuration.

use std::collections::HashSet;
use std::str::FromStr;

use crate::hashes::HashKinds;

/// How much work the kernel-callback side performs while the kernel is
/// waiting for the pre-exec verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KernelLevel {
    /// Kernel callback disabled.
    None,
    /// Open and stat only; hashing is deferred to the worker.
    Open,
    /// Hash during the callback.
    Hash,
    /// Hash and check signatures during the callback.
    Csig,
}

impl FromStr for KernelLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "open" => Ok(Self::Open),
            "hash" => Ok(Self::Hash),
            "csig" => Ok(Self::Csig),
            other => Err(format!("unknown kernel level {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kernel_level: KernelLevel,
    /// Ancestor-chain depth kept on images; `usize::MAX` keeps everything.
    pub ancestors: usize,
    pub hashes: HashKinds,
    /// Whether to compute code signatures at all.
    pub codesign: bool,
    /// Images whose execution may be caused by signature verification
    /// itself; never signature-checked during the kernel callback.
    pub codesign_helpers: HashSet<String>,
    /// Files larger than this are not hashed during the kernel callback.
    pub large_file_max: u64,
    /// Emit exec events for processes recovered by the startup preload.
    pub log_preloaded_exec: bool,
    pub suppress_by_ident: HashSet<String>,
    pub suppress_by_path: HashSet<String>,
    pub suppress_ancestor_ident: HashSet<String>,
    pub suppress_ancestor_path: HashSet<String>,
    pub hash_cache_size: usize,
    pub csig_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel_level: KernelLevel::Hash,
            ancestors: usize::MAX,
            hashes: HashKinds::default(),
            codesign: false,
            codesign_helpers: HashSet::new(),
            large_file_max: 8 * 1024 * 1024,
            log_preloaded_exec: false,
            suppress_by_ident: HashSet::new(),
            suppress_by_path: HashSet::new(),
            suppress_ancestor_ident: HashSet::new(),
            suppress_ancestor_path: HashSet::new(),
            hash_cache_size: 4096,
            csig_cache_size: 1024,
        }
    }
}
