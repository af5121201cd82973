//! Miscellaneous utilities: memory statistics and PID file handling.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use log::warn;

// ── Memory (/proc/meminfo) ────────────────────────────────────────────────────

/// Memory figures from `/proc/meminfo`, in kB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb:     u64,
    pub available_kb: u64,
}

impl MemInfo {
    /// Fraction of memory in use, clamped to `0.0..=1.0`.
    pub fn usage_ratio(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        let used = self.total_kb.saturating_sub(self.available_kb);
        (used as f64 / self.total_kb as f64).clamp(0.0, 1.0)
    }
}

/// Read `/proc/meminfo`.  Returns `None` if unavailable (non-Linux, sandbox).
pub fn read_meminfo() -> Option<MemInfo> {
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&content)
}

/// Parse `MemTotal` and `MemAvailable` (falling back to `MemFree` on old
/// kernels without `MemAvailable`).
pub fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let field = |name: &str| -> Option<u64> {
        content.lines().find_map(|line| {
            line.strip_prefix(name)?
                .strip_prefix(':')?
                .split_whitespace()
                .next()?
                .parse()
                .ok()
        })
    };
    let total_kb = field("MemTotal")?;
    let available_kb = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some(MemInfo { total_kb, available_kb })
}

// ── PID file ──────────────────────────────────────────────────────────────────

/// Write the current process PID to `path`.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(path)?;
    writeln!(f, "{}", std::process::id())?;
    Ok(())
}

/// Remove the PID file (best-effort, logs a warning on failure).
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("failed to remove PID file {}: {e}", path.display());
    }
}
