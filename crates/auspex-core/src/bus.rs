use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::event::ExecEvent;

/// Broadcast channel carrying finalized events to every subscriber.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Arc<ExecEvent>>,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus is stopped")]
    Stopped,
}

const BUFFER_SIZE: usize = 1000;

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUFFER_SIZE);
        Self { tx }
    }

    pub fn send(&self, event: ExecEvent) {
        log::trace!("event: {event}");
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<Arc<ExecEvent>> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = Bus::new();
        let mut rx = bus.get_receiver();
        bus.send(ExecEvent {
            timestamp: UNIX_EPOCH,
            fork_time: None,
            pid: 1,
            path: "/bin/true".into(),
            argv: None,
            envv: None,
            cwd: None,
            subject: None,
            file: None,
            hashes: None,
            codesign: None,
            script: None,
            ancestors: Vec::new(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "/bin/true");
    }
}
