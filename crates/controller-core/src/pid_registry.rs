//! PID-file bookkeeping and orphan-process cleanup across daemon restarts.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Manages `<state_dir>/pids/<instance_id>.pid` files.
pub struct PidRegistry {
    pids_dir: PathBuf,
}

impl PidRegistry {
    pub fn new(pids_dir: impl Into<PathBuf>) -> Self {
        Self {
            pids_dir: pids_dir.into(),
        }
    }

    fn path_for(&self, instance_id: &str) -> PathBuf {
        self.pids_dir.join(format!("{instance_id}.pid"))
    }

    pub fn write_pid(&self, instance_id: &str, pid: u32) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.pids_dir)?;
        std::fs::write(self.path_for(instance_id), pid.to_string())
    }

    pub fn remove_pid(&self, instance_id: &str) {
        let _ = std::fs::remove_file(self.path_for(instance_id));
    }

    pub fn read_pid(&self, instance_id: &str) -> Option<u32> {
        std::fs::read_to_string(self.path_for(instance_id))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Enumerates every `*.pid` file in the pids directory; used at startup
    /// to find orphans left by a crashed previous run.
    fn list_pid_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.pids_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("pid"))
            .collect()
    }

    /// Terminates every PID whose `.pid` file exists, is still running, and
    /// is not in `managed_pids` (the just-reloaded set this daemon run
    /// intends to keep). Always removes the `.pid` file afterward, whether or
    /// not the process was killed. Returns the number of orphans terminated.
    pub fn cleanup_orphans(&self, managed_pids: &HashSet<u32>) -> usize {
        let mut cleaned = 0;
        for path in self.list_pid_files() {
            let Some(pid) = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            else {
                let _ = std::fs::remove_file(&path);
                continue;
            };

            if !managed_pids.contains(&pid) && is_process_running(pid) {
                terminate_with_grace(pid);
                cleaned += 1;
            }
            let _ = std::fs::remove_file(&path);
        }
        cleaned
    }
}

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate_with_grace(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let nix_pid = Pid::from_raw(pid as i32);
    let _ = signal::kill(nix_pid, Signal::SIGTERM);

    for _ in 0..10 {
        if !is_process_running(pid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if is_process_running(pid) {
        let _ = signal::kill(nix_pid, Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate_with_grace(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let reg = PidRegistry::new(dir.path());
        reg.write_pid("abc123", 9999).unwrap();
        assert_eq!(reg.read_pid("abc123"), Some(9999));
        reg.remove_pid("abc123");
        assert_eq!(reg.read_pid("abc123"), None);
    }

    #[test]
    fn cleanup_deletes_invalid_pid_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join("garbage.pid"), "not-a-number").unwrap();

        let reg = PidRegistry::new(dir.path());
        let cleaned = reg.cleanup_orphans(&HashSet::new());
        assert_eq!(cleaned, 0);
        assert!(!dir.path().join("garbage.pid").exists());
    }

    #[test]
    fn cleanup_skips_managed_pids() {
        let dir = TempDir::new().unwrap();
        let reg = PidRegistry::new(dir.path());
        let my_pid = std::process::id();
        reg.write_pid("managed", my_pid).unwrap();

        let mut managed = HashSet::new();
        managed.insert(my_pid);
        let cleaned = reg.cleanup_orphans(&managed);
        assert_eq!(cleaned, 0);
        // File is always removed regardless of management status.
        assert!(!dir.path().join("managed.pid").exists());
    }

    #[test]
    fn cleanup_ignores_pids_that_are_not_running() {
        let dir = TempDir::new().unwrap();
        let reg = PidRegistry::new(dir.path());
        // A PID astronomically unlikely to be alive.
        reg.write_pid("dead", 999_999).unwrap();
        let cleaned = reg.cleanup_orphans(&HashSet::new());
        assert_eq!(cleaned, 0);
    }
}
