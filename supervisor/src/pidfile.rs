//! Pid file persistence and process-table liveness checks.
//!
//! The supervisor records the pid of a started listener in a pid file under
//! its state directory. Any later supervisor invocation (including from a
//! different process) reads the file back and reconciles it against the OS
//! process table, so a listener started by one invocation can be stopped or
//! inspected by another.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::warn;

use crate::error::Result;

/// File name of the pid file under the state directory.
const PID_FILE_NAME: &str = "switchboard-listener.pid";

/// Handle to the listener pid file under a state directory.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates a handle to the pid file under `state_dir`.
    ///
    /// The file itself is only created by [`write`](Self::write).
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(PID_FILE_NAME),
        }
    }

    /// Returns the path of the pid file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the recorded pid, if any.
    ///
    /// Returns `Ok(None)` when the file is absent. A file with unparseable
    /// contents is removed and treated as absent, since a corrupt pid file
    /// cannot safely identify a process.
    pub fn read(&self) -> Result<Option<u32>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match contents.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                warn!(path = %self.path.display(), "Removing corrupt pid file");
                self.remove()?;
                Ok(None)
            }
        }
    }

    /// Records `pid`, creating the state directory if needed.
    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{pid}\n"))?;
        Ok(())
    }

    /// Removes the pid file. Removing an absent file is not an error.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Returns `true` if a process with `pid` is alive.
///
/// A zombie counts as dead: it has exited and only awaits reaping, so
/// signalling it can have no effect.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), false);

    match system.process(target) {
        Some(process) => process.status() != ProcessStatus::Zombie,
        None => false,
    }
}

/// Returns how long the process with `pid` has been running.
///
/// Returns `None` if the process does not exist or its start time cannot be
/// determined.
#[must_use]
pub fn process_uptime(pid: u32) -> Option<Duration> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), false);

    let started = system.process(target)?.start_time();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(Duration::from_secs(now.saturating_sub(started)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_absent_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path());

        assert_eq!(pid_file.read().unwrap(), None);
    }

    #[test]
    fn test_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path());

        pid_file.write(1234).unwrap();
        assert_eq!(pid_file.read().unwrap(), Some(1234));
    }

    #[test]
    fn test_write_creates_missing_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state").join("nested");
        let pid_file = PidFile::new(&nested);

        pid_file.write(99).unwrap();
        assert_eq!(pid_file.read().unwrap(), Some(99));
    }

    #[test]
    fn test_corrupt_file_is_removed_and_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path());
        std::fs::write(pid_file.path(), "not a pid\n").unwrap();

        assert_eq!(pid_file.read().unwrap(), None);
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path());

        pid_file.write(7).unwrap();
        pid_file.remove().unwrap();
        pid_file.remove().unwrap();
        assert_eq!(pid_file.read().unwrap(), None);
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait for child");

        assert!(!is_alive(pid));
    }

    #[test]
    fn test_own_process_has_uptime() {
        let uptime = process_uptime(std::process::id());
        assert!(uptime.is_some());
    }
}
