//! Process-monitoring correlation engine.
//!
//! Correlates kernel pre-exec notifications with userland audit records
//! into a deduplicated stream of process-lifecycle events, each enriched
//! with the executing image's identity: path, file attributes, content
//! hashes and code signature.
//!
//! The two event sources are not ordered with respect to each other and
//! either may drop or misreport entries. Kernel-side images wait in the
//! [`prepq::PreExecQueue`]; the [`procmon::ProcMon`] correlator, driven in
//! audit-commit order from a single task (see [`handle`]), matches them to
//! audit records, maintains the process table and the reference-counted
//! graph of historical images, and hands finalized images to the
//! [`worker`], which completes the expensive attribute acquisition and
//! emits events on the [`bus::Bus`].

pub mod acquire;
pub mod bus;
pub mod cache;
pub mod codesign;
pub mod config;
pub mod event;
pub mod handle;
pub mod hashes;
pub mod image;
pub mod prepq;
pub mod procmon;
pub mod proctab;
pub mod stats;
pub mod sys;
pub mod worker;

pub use handle::{start_engine, Engine, KernelHandle, ProcMonHandle};
pub use nix::unistd::Pid;
