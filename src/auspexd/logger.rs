use std::path::PathBuf;

use anyhow::{Context, Result};
use auspex_core::bus::Bus;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::config::SectionConfig;

/// Event log sink: console rendering and/or a JSON-lines file.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    console: bool,
    file: Option<PathBuf>,
}

impl LoggerConfig {
    pub fn from_section(section: &SectionConfig) -> Result<Self> {
        let console = section.with_default("console", true)?;
        let file = match section.with_default("file", false)? {
            true => Some(PathBuf::from(section.with_default(
                "file_path",
                "/var/log/auspex/events.log".to_string(),
            )?)),
            false => None,
        };
        Ok(Self { console, file })
    }
}

/// Drain events from the bus into the configured sinks until the bus is
/// dropped.
pub fn start_logger(config: LoggerConfig, bus: &Bus) {
    let mut receiver = bus.get_receiver();
    tokio::spawn(async move {
        let mut file = match &config.file {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    let _ = tokio::fs::create_dir_all(dir).await;
                }
                match OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("opening event log {path:?}"))
                {
                    Ok(f) => Some(f),
                    Err(e) => {
                        log::error!("{e:?}");
                        None
                    }
                }
            }
            None => None,
        };

        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("event logger lagged, {missed} events missed");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if config.console {
                println!("{event}");
            }
            if let Some(f) = file.as_mut() {
                match serde_json::to_vec(event.as_ref()) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        if let Err(e) = f.write_all(&line).await {
                            log::error!("writing event log: {e}");
                        }
                    }
                    Err(e) => log::error!("serializing event: {e}"),
                }
            }
        }
        log::debug!("event logger stopped");
    });
}
