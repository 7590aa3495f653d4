//! Dump artifact handling: expected path, existence check, flush polling,
//! and candidate listing for missing-dump diagnostics.

use crate::config::TerminationConfig;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cap on a single poll step; total wait is bounded separately by
/// `poll_max_wait_ms`.
const MAX_POLL_STEP_MS: u64 = 1000;

/// Expected dump path for a child: `<dump_dir>/core.<pid>`, matching the
/// `core.%p` pattern installed at preparation time.
pub fn expected_dump_path(dump_dir: &Path, pid: u32) -> PathBuf {
    dump_dir.join(format!("core.{pid}"))
}

/// Whether a dump artifact exists at the expected path.
///
/// A pure existence check with no side effects, so repeated calls after one
/// termination always agree.
pub fn detect_crash(dump_path: &Path) -> bool {
    dump_path.exists()
}

/// Poll delay for the given attempt: `initial * 2^attempt`, capped.
fn backoff_ms(initial_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    let shift = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    initial_ms.saturating_mul(shift).min(cap_ms)
}

/// Wait for the dump file to be flushed to disk.
///
/// Dump generation is asynchronous relative to signal delivery, so checking
/// immediately yields false negatives. Rather than a fixed sleep, poll with
/// exponential backoff until the file exists with a stable size across two
/// consecutive polls, giving up after `poll_max_wait_ms`.
pub async fn wait_for_dump(dump_path: &Path, config: &TerminationConfig) -> bool {
    let deadline = Instant::now() + Duration::from_millis(config.poll_max_wait_ms);
    let mut attempt = 0u32;
    let mut last_len: Option<u64> = None;

    loop {
        match std::fs::metadata(dump_path) {
            Ok(meta) => {
                if last_len == Some(meta.len()) {
                    debug!(
                        dump = %dump_path.display(),
                        bytes = meta.len(),
                        "dump file present and stable"
                    );
                    return true;
                }
                last_len = Some(meta.len());
            }
            Err(_) => last_len = None,
        }

        if Instant::now() >= deadline {
            // Seen once but never confirmed stable still counts as found.
            return last_len.is_some();
        }

        let delay = backoff_ms(config.poll_initial_ms, attempt, MAX_POLL_STEP_MS);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        attempt += 1;
    }
}

/// List `core*` files in the dump directory.
///
/// Used for the soft-warning diagnostics when an expected dump is missing:
/// the listing shows whether the pattern drifted or the PID suffix is wrong.
pub fn candidate_dumps(dump_dir: &Path) -> Vec<PathBuf> {
    let pattern = dump_dir.join("core*");
    let pattern = pattern.to_string_lossy();

    let mut found = Vec::new();
    match glob::glob(&pattern) {
        Ok(paths) => {
            for path in paths.flatten() {
                found.push(path);
            }
        }
        Err(e) => warn!(error = %e, pattern = %pattern, "bad dump glob pattern"),
    }
    found.sort();
    found
}
