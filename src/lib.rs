//! Auspex is a host-security telemetry agent that correlates kernel-level
//! execution notifications with userland audit records into a trustworthy,
//! deduplicated stream of process-lifecycle events.
//!
//! The correlation engine lives in [`auspex_core`]; this crate hosts the
//! `auspexd` daemon around it: configuration, the event log sink and the
//! process-table preload at startup. The kernel shim and the audit-trail
//! reader attach to the engine through [`auspex_core::KernelHandle`] and
//! [`auspex_core::ProcMonHandle`].

use std::sync::OnceLock;

pub mod auspexd;
pub mod cli;

pub(crate) fn version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    #[cfg(debug_assertions)]
    let v = VERSION.get_or_init(|| format!("{}+dev", env!("CARGO_PKG_VERSION")));

    #[cfg(not(debug_assertions))]
    let v = VERSION.get_or_init(|| env!("CARGO_PKG_VERSION").to_string());

    v
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::Level) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let default_level = log::Level::Info;
        let level = if override_log_level > default_level {
            override_log_level
        } else {
            default_level
        };
        env_logger::builder()
            .filter_level(level.to_level_filter())
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }
}
