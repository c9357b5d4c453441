//! Deferred-acquisition worker.
//!
//! Images are submitted with their own reference; the worker finishes the
//! acquisition pipeline off the hot path, prunes ancestor history and
//! decides whether the event is emitted or suppressed. Completion order is
//! not the submission order consumers may assume; every image carries its
//! own timestamps.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::acquire::Acquirer;
use crate::bus::Bus;
use crate::event::ExecEvent;
use crate::image::{prune_ancestors, ImageExec};
use crate::stats::bump;

#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Arc<ImageExec>>,
}

impl WorkerHandle {
    /// Hand one image reference to the worker.
    pub fn submit(&self, image: Arc<ImageExec>) {
        // Submission can only fail during teardown, when the worker task is
        // already gone; the image is simply released then.
        let _ = self.tx.send(image);
    }
}

/// Create the submission side and its queue.
pub fn channel() -> (WorkerHandle, mpsc::UnboundedReceiver<Arc<ImageExec>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkerHandle { tx }, rx)
}

/// Spawn the worker task, emitting finalized events on `bus`.
pub fn start_worker(acquirer: Acquirer, bus: Bus) -> WorkerHandle {
    let (handle, mut rx) = channel();
    tokio::spawn(async move {
        while let Some(image) = rx.recv().await {
            if let Some(event) = process(&image, &acquirer) {
                bus.send(event);
            }
        }
        log::debug!("worker: submission queue closed");
    });
    handle
}

/// Finish one image and decide its fate.
///
/// Returns the event to emit, or `None` when it is suppressed: memory
/// exhaustion during acquisition, a NOLOG mark, or a suppression-set match.
pub fn process(image: &Arc<ImageExec>, acquirer: &Acquirer) -> Option<ExecEvent> {
    let config = acquirer.config().clone();

    if let Err(err) = acquirer.acquire(image, false) {
        log::debug!("acquisition incomplete for {}: {}", image.path, err);
    }
    image.close();

    let script = image.state().script.clone();
    if let Some(script) = &script {
        if let Err(err) = acquirer.acquire(script, false) {
            log::debug!("acquisition incomplete for {}: {}", script.path, err);
        }
        script.close();
    }

    if config.ancestors != usize::MAX {
        prune_ancestors(image, config.ancestors);
    }

    {
        let st = image.state();
        if st.flags.enomem {
            bump(&acquirer.stats().ooms);
            return None;
        }
        if st.flags.nolog {
            return None;
        }
    }

    if image.match_suppressions(&config.suppress_by_ident, &config.suppress_by_path) {
        return None;
    }

    Some(ExecEvent::from_image(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::UnsignedChecker;
    use crate::config::Config;
    use crate::stats::ProcMonStats;
    use nix::unistd::Pid;
    use std::fs;
    use std::time::UNIX_EPOCH;

    fn acquirer(config: Config) -> Acquirer {
        Acquirer::new(
            Arc::new(config),
            Arc::new(UnsignedChecker),
            Arc::new(ProcMonStats::default()),
        )
    }

    fn image_for(path: &std::path::Path, acq: &Acquirer) -> Arc<ImageExec> {
        let img = ImageExec::new(
            path.to_str().unwrap().to_string(),
            Pid::from_raw(77),
            UNIX_EPOCH,
            acq.stats(),
        );
        img.open(None).unwrap();
        img
    }

    #[test]
    fn process_emits_completed_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"tool bytes").unwrap();
        let acq = acquirer(Config::default());
        let img = image_for(&path, &acq);
        let event = process(&img, &acq).unwrap();
        assert_eq!(event.pid, 77);
        assert!(event.hashes.is_some());
        assert!(img.state().flags.done);
    }

    #[test]
    fn process_suppresses_nolog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"quiet").unwrap();
        let acq = acquirer(Config::default());
        let img = image_for(&path, &acq);
        img.state().flags.nolog = true;
        assert!(process(&img, &acq).is_none());
    }

    #[test]
    fn process_suppresses_by_path_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"suppressed").unwrap();
        let config = Config {
            suppress_by_path: [path.to_str().unwrap().to_string()].into(),
            ..Config::default()
        };
        let acq = acquirer(config);
        let img = image_for(&path, &acq);
        assert!(process(&img, &acq).is_none());
    }

    #[test]
    fn process_prunes_ancestors_when_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"pruned").unwrap();
        let config = Config {
            ancestors: 1,
            ..Config::default()
        };
        let acq = acquirer(config);
        let img = image_for(&path, &acq);
        let a1 = ImageExec::new("/bin/a1".into(), Pid::from_raw(1), UNIX_EPOCH, acq.stats());
        let a2 = ImageExec::new("/bin/a2".into(), Pid::from_raw(1), UNIX_EPOCH, acq.stats());
        a1.state().prev = Some(a2);
        img.state().prev = Some(a1);
        let event = process(&img, &acq).unwrap();
        assert_eq!(event.ancestors, vec!["/bin/a1".to_string()]);
    }

    #[tokio::test]
    async fn worker_task_routes_to_bus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"bus bytes").unwrap();
        let acq = acquirer(Config::default());
        let bus = Bus::new();
        let mut rx = bus.get_receiver();
        let worker = start_worker(acq.clone(), bus);
        let img = image_for(&path, &acq);
        worker.submit(img);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.pid, 77);
    }
}
