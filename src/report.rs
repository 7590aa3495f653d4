//! Run outcome classification and the JSON record exposed to a calling
//! harness.
//!
//! The crash report itself stays unstructured text; this module only scans
//! it for stack-frame indicators and serializes the final disposition.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// A gdb frame line: `#0  0x00007f... in abort ()` or `#2  main () at ...`.
static FRAME_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#\d+\s+\S").unwrap());

/// A gdb thread header from `thread apply all bt`.
static THREAD_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Thread\s+\d+\s").unwrap());

/// Count stack-frame lines in debugger output.
pub fn frame_count(report: &str) -> usize {
    FRAME_LINE.find_iter(report).count()
}

/// Count thread headers in debugger output. Single-threaded targets produce
/// frames without a header, so zero here does not mean zero threads.
pub fn thread_count(report: &str) -> usize {
    THREAD_HEADER.find_iter(report).count()
}

/// Final disposition of one supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Target exited on its own with the given code.
    CleanExit { code: i32 },
    /// Target outlived its timeout and was terminated; no dump appeared.
    TimedOut,
    /// A dump was found and symbolized into a report.
    Crashed { report: String },
    /// Target terminated abnormally (fault signal or forced terminate) but
    /// the expected dump never appeared.
    CrashedNoDump,
}

impl RunOutcome {
    /// Stable string tag used in the record file and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::CleanExit { .. } => "clean_exit",
            RunOutcome::TimedOut => "timed_out",
            RunOutcome::Crashed { .. } => "crashed",
            RunOutcome::CrashedNoDump => "crashed_no_dump",
        }
    }
}

/// Everything known about a run once it has reached its final state.
#[derive(Debug)]
pub struct CompletedRun {
    pub outcome: RunOutcome,
    pub target: PathBuf,
    pub args: Vec<String>,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Exit code on natural exit.
    pub exit_code: Option<i32>,
    /// Signal that ended the target, whether self-inflicted or sent by
    /// `terminate()`.
    pub term_signal: Option<i32>,
    pub timed_out: bool,
    /// Dump artifact path, when one was found.
    pub dump_path: Option<PathBuf>,
}

/// The JSON payload written by `--record`.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub target: String,
    pub args: Vec<String>,
    pub pid: u32,
    pub outcome: String,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub timed_out: bool,
    pub dump_file: Option<String>,
    pub frames: Option<usize>,
    pub threads: Option<usize>,
    pub report: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub recorded_at: DateTime<Utc>,
}

impl RunRecord {
    /// Build the record payload from a completed run.
    pub fn from_run(run: &CompletedRun) -> Self {
        let report = match &run.outcome {
            RunOutcome::Crashed { report } => Some(report.clone()),
            _ => None,
        };
        Self {
            target: run.target.display().to_string(),
            args: run.args.clone(),
            pid: run.pid,
            outcome: run.outcome.label().to_string(),
            exit_code: run.exit_code,
            term_signal: run.term_signal,
            timed_out: run.timed_out,
            dump_file: run.dump_path.as_ref().map(|p| p.display().to_string()),
            frames: report.as_deref().map(frame_count),
            threads: report.as_deref().map(thread_count),
            report,
            started_at: run.started_at,
            duration_secs: run.duration.as_secs_f64(),
            recorded_at: Utc::now(),
        }
    }
}

/// Errors raised while writing the record file.
#[derive(Debug)]
pub enum RecordError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Serialize { source } => {
                write!(f, "failed to serialize run record: {}", source)
            }
            RecordError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            RecordError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} to {}: {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Serialize { source } => Some(source),
            RecordError::Write { source, .. } => Some(source),
            RecordError::Rename { source, .. } => Some(source),
        }
    }
}

/// Writes the run record as JSON.
pub struct RecordFile {
    path: PathBuf,
}

impl RecordFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically write the record: write to a temp file in the same
    /// directory, then rename, so readers never see a partial write.
    pub fn write(&self, record: &RunRecord) -> Result<(), RecordError> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| RecordError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".corehound.record.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| RecordError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| RecordError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }
}
