//! Finalized process-lifecycle events.
//!
//! Built by the worker from a completed image acquisition and broadcast to
//! consumers (log sinks, notifiers). Events own all their data; nothing in
//! an event reaches back into engine state.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codesign::Codesign;
use crate::hashes::{hex, Hashes};
use crate::image::ImageExec;
use crate::sys::{AuditSubject, StatAttr};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl From<&StatAttr> for FileInfo {
    fn from(stat: &StatAttr) -> Self {
        Self {
            dev: stat.dev,
            ino: stat.ino,
            mode: stat.mode,
            uid: stat.uid,
            gid: stat.gid,
            size: stat.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl From<&Hashes> for HashInfo {
    fn from(hashes: &Hashes) -> Self {
        Self {
            md5: hashes.md5.as_ref().map(|d| hex(d)),
            sha1: hashes.sha1.as_ref().map(|d| hex(d)),
            sha256: hashes.sha256.as_ref().map(|d| hex(d)),
        }
    }
}

/// The interpreted script behind a shebang execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptInfo {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<HashInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecEvent {
    pub timestamp: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_time: Option<SystemTime>,
    pub pid: i32,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envv: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<AuditSubject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<HashInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codesign: Option<Codesign>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptInfo>,
    /// Paths of the surviving ancestor chain, nearest first.
    pub ancestors: Vec<String>,
}

impl ExecEvent {
    pub fn from_image(image: &Arc<ImageExec>) -> Self {
        let st = image.state();
        let script = st.script.as_ref().map(|script| {
            let sst = script.state();
            ScriptInfo {
                path: script.path.clone(),
                file: sst.stat.as_ref().map(FileInfo::from),
                hashes: sst.hashes.as_ref().map(HashInfo::from),
            }
        });
        let mut ancestors = Vec::new();
        let mut cur = st.prev.clone();
        while let Some(prev) = cur {
            ancestors.push(prev.path.clone());
            cur = prev.state().prev.clone();
        }
        Self {
            timestamp: st.tv,
            fork_time: st.fork_tv,
            pid: st.pid.as_raw(),
            path: image.path.clone(),
            argv: st.argv.clone(),
            envv: st.envv.clone(),
            cwd: st.cwd.clone(),
            subject: st.subject.clone(),
            file: st.stat.as_ref().map(FileInfo::from),
            hashes: st.hashes.as_ref().map(HashInfo::from),
            codesign: st.codesign.clone(),
            script,
            ancestors,
        }
    }
}

impl fmt::Display for ExecEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = DateTime::<Utc>::from(self.timestamp).format("%Y-%m-%dT%TZ");
        write!(f, "[{time} EXEC {} ({})]", self.path, self.pid)?;
        if let Some(script) = &self.script {
            write!(f, " [script {}]", script.path)?;
        }
        if let Some(argv) = &self.argv {
            write!(f, " {}", argv.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ProcMonStats;
    use nix::unistd::Pid;
    use std::time::UNIX_EPOCH;

    #[test]
    fn event_captures_image_and_chain() {
        let stats = Arc::new(ProcMonStats::default());
        let parent = ImageExec::new("/sbin/init".into(), Pid::from_raw(1), UNIX_EPOCH, &stats);
        let image = ImageExec::new("/bin/ls".into(), Pid::from_raw(100), UNIX_EPOCH, &stats);
        {
            let mut st = image.state();
            st.argv = Some(vec!["ls".into(), "-l".into()]);
            st.cwd = Some("/root".into());
            st.prev = Some(parent);
            st.hashes = Some(Hashes {
                sha256: Some([0xab; 32]),
                ..Default::default()
            });
        }
        let event = ExecEvent::from_image(&image);
        assert_eq!(event.pid, 100);
        assert_eq!(event.path, "/bin/ls");
        assert_eq!(event.ancestors, vec!["/sbin/init".to_string()]);
        assert!(event
            .hashes
            .as_ref()
            .unwrap()
            .sha256
            .as_ref()
            .unwrap()
            .starts_with("abab"));
        assert!(event.script.is_none());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"/bin/ls\""));
        assert!(!json.contains("codesign"));
        let rendered = event.to_string();
        assert!(rendered.contains("EXEC /bin/ls (100)"));
        assert!(rendered.contains("ls -l"));
    }
}
