use std::sync::Arc;

use anyhow::{ensure, Result};
use auspex_core::codesign::UnsignedChecker;
use auspex_core::sys::{ProcfsProbes, SystemProbes};
use auspex_core::start_engine;
use nix::unistd::geteuid;
use tokio::signal::unix::{signal, SignalKind};

use crate::cli::AuspexdOpts;

pub mod config;
mod logger;

pub use config::DaemonConfig;

/// Run the daemon: build the engine from configuration, preload the
/// process table from the live system and drain events until a signal
/// arrives. The kernel shim and the audit-trail reader attach to the
/// returned engine handles; they are separate components and out of the
/// daemon core's hands.
pub async fn auspexd_run(options: &AuspexdOpts) -> Result<()> {
    log::trace!("Auspex Daemon Options: {:?}", options);

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    let daemon_config = if let Some(custom_file) = &options.config_file {
        DaemonConfig::with_custom_file(custom_file)?
    } else {
        DaemonConfig::new()?
    };

    let engine_config = config::procmon_config(&daemon_config.section("procmon"))?;
    let logger_config = logger::LoggerConfig::from_section(&daemon_config.section("logger"))?;

    let probes = Arc::new(ProcfsProbes);
    let engine = start_engine(
        Arc::new(engine_config),
        probes.clone(),
        Arc::new(UnsignedChecker),
    );

    logger::start_logger(logger_config, &engine.bus);

    // Processes already running when the daemon starts would otherwise
    // only ever be seen through recovery, one at a time.
    let preloaded = match probes.running_pids() {
        Ok(pids) => {
            let count = pids.len();
            for pid in pids {
                engine.handle.preload(pid);
            }
            count
        }
        Err(e) => {
            log::warn!("preload failed: {e}");
            0
        }
    };
    log::info!("auspexd {} started, preloaded {preloaded} processes", crate::version());

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_hup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
        _ = sig_hup.recv() => log::trace!("SIGHUP received"),
    }

    let stats = engine.handle.stats().await;
    log::info!(
        "Terminating: images={} pqsize={} pqmiss={} liveacq={} ooms={}",
        stats.images,
        stats.pqsize,
        stats.pqmiss,
        stats.liveacq,
        stats.ooms
    );

    Ok(())
}
