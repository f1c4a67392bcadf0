// =============================================================================
// Sentinel files — kill switch and the single-instance pid lock
// =============================================================================
//
// data/KILL_SWITCH          presence halts all trading within one risk check
// data/<name>.pid           single-instance lock; stale locks from dead
//                           processes are reclaimed with a warning
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

pub const KILL_SWITCH_FILE: &str = "KILL_SWITCH";

pub fn kill_switch_path(data_dir: &Path) -> PathBuf {
    data_dir.join(KILL_SWITCH_FILE)
}

/// Cheap enough to call on every risk check.
pub fn kill_switch_present(data_dir: &Path) -> bool {
    kill_switch_path(data_dir).exists()
}

/// Exclusive pid lock. Released (file removed) on drop.
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(data_dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let path = data_dir.join(format!("{name}.pid"));

        if path.exists() {
            let existing = std::fs::read_to_string(&path).unwrap_or_default();
            let existing_pid: Option<u32> = existing.trim().parse().ok();
            match existing_pid {
                Some(pid) if process_alive(pid) => {
                    bail!(
                        "another instance (pid {pid}) holds {}; refusing to start",
                        path.display()
                    );
                }
                Some(pid) => {
                    warn!(stale_pid = pid, path = %path.display(), "reclaiming stale pid lock");
                }
                None => {
                    warn!(path = %path.display(), "reclaiming malformed pid lock");
                }
            }
        }

        let pid = std::process::id();
        std::fs::write(&path, pid.to_string())
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(pid, path = %path.display(), "pid lock acquired");
        Ok(Self { path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove pid lock");
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, assume alive and refuse to start.
    true
}
