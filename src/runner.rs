//! The crash-capturing process runner: ties host preparation, session
//! supervision, dump detection, and debugger post-processing together.

use crate::config::RunnerConfig;
use crate::debugger::{Debugger, DebuggerError};
use crate::dump;
use crate::host::{HostCrashConfig, HostError};
use crate::report::{self, CompletedRun, RunOutcome};
use crate::session::{RunSession, SessionError, WaitOutcome};
use nix::sys::signal::Signal;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Errors raised while preparing the run infrastructure. Fatal: no
/// subsequent run can be trusted to produce a usable report.
#[derive(Debug)]
pub enum PrepareError {
    Host(HostError),
    Debugger(DebuggerError),
}

impl std::fmt::Display for PrepareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepareError::Host(e) => write!(f, "host preparation failed: {}", e),
            PrepareError::Debugger(e) => write!(f, "debugger check failed: {}", e),
        }
    }
}

impl std::error::Error for PrepareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PrepareError::Host(e) => Some(e),
            PrepareError::Debugger(e) => Some(e),
        }
    }
}

/// Errors raised while supervising a run. Scoped to that run: a harness may
/// attempt further runs afterwards.
#[derive(Debug)]
pub enum RunError {
    Session(SessionError),
    Debugger(DebuggerError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Session(e) => write!(f, "{}", e),
            RunError::Debugger(e) => write!(f, "crash processing failed: {}", e),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Session(e) => Some(e),
            RunError::Debugger(e) => Some(e),
        }
    }
}

impl From<SessionError> for RunError {
    fn from(e: SessionError) -> Self {
        RunError::Session(e)
    }
}

/// Supervises one target process from launch to final disposition and, on
/// crash, produces a readable backtrace.
///
/// Construction runs the environment preparation, so a `CrashRunner` in
/// hand always has a usable debugger. One runner supervises one session at
/// a time; sequential reuse is fine, internal locking does not exist.
pub struct CrashRunner {
    config: RunnerConfig,
    debugger: Debugger,
}

impl CrashRunner {
    /// Prepare the run infrastructure and return a ready runner.
    ///
    /// Raises the core-dump size limit to unlimited, rewrites the kernel
    /// core pattern if it differs from the expected template, and locates
    /// the debugger. Mutates host-wide kernel configuration: callers must
    /// treat this as a global, process-external precondition. Idempotent on
    /// an already-correct host.
    pub fn prepare_environment(config: RunnerConfig) -> Result<CrashRunner, PrepareError> {
        let host = HostCrashConfig::new(&config.host);
        host.ensure().map_err(PrepareError::Host)?;

        let debugger =
            Debugger::locate(&config.debugger.command).map_err(PrepareError::Debugger)?;

        info!(
            debugger = %debugger.path().display(),
            core_pattern = %host.pattern(),
            "run infrastructure is ready"
        );
        Ok(CrashRunner { config, debugger })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Start the target as a child process.
    pub fn launch(&self, target: &Path, args: &[String]) -> Result<RunSession, SessionError> {
        RunSession::launch(
            target,
            args,
            Duration::from_secs(self.config.run.timeout_secs),
            &self.config.run.dump_dir,
        )
    }

    /// Block until natural exit or timeout.
    pub async fn wait_or_timeout(
        &self,
        session: &mut RunSession,
    ) -> Result<WaitOutcome, SessionError> {
        session.wait_or_timeout().await
    }

    /// Force termination and wait for the dump to be flushed.
    ///
    /// Returns whether the expected dump artifact appeared within the poll
    /// window.
    pub async fn terminate(&self, session: &mut RunSession) -> Result<bool, SessionError> {
        session.terminate(&self.config.termination).await?;
        Ok(dump::wait_for_dump(session.dump_path(), &self.config.termination).await)
    }

    /// Whether a dump artifact exists for this session. Side-effect free.
    pub fn detect_crash(&self, session: &RunSession) -> bool {
        dump::detect_crash(session.dump_path())
    }

    /// Symbolize the session's dump into a human-readable crash report.
    pub async fn process_crash(&self, session: &RunSession) -> Result<String, DebuggerError> {
        let report = self
            .debugger
            .backtrace(session.target(), session.dump_path())
            .await?;
        info!(
            frames = report::frame_count(&report),
            threads = report::thread_count(&report),
            "crash report generated"
        );
        Ok(report)
    }

    /// Run the full lifecycle: launch, wait, terminate if needed, detect,
    /// and post-process. With `force_dump` the wait is skipped and the
    /// target is terminated immediately for a diagnostic dump.
    pub async fn supervise(
        &self,
        target: &Path,
        args: &[String],
        force_dump: bool,
    ) -> Result<CompletedRun, RunError> {
        let mut session = self.launch(target, args)?;
        let started_at = session.started_at();
        let pid = session.pid();

        let (outcome, exit_code, term_signal, timed_out) = if force_dump {
            info!(pid, "forcing termination for a diagnostic dump");
            let found = self.terminate(&mut session).await?;
            let outcome = self.classify_dump(&session, found, RunOutcome::CrashedNoDump).await?;
            (outcome, None, Some(Signal::SIGQUIT as i32), false)
        } else {
            match session.wait_or_timeout().await? {
                WaitOutcome::NaturalExit(code) => {
                    (RunOutcome::CleanExit { code }, Some(code), None, false)
                }
                WaitOutcome::Signaled(signal) => {
                    // The dump may still be flushing when the wait returns
                    let found =
                        dump::wait_for_dump(session.dump_path(), &self.config.termination).await;
                    let outcome = self
                        .classify_dump(&session, found, RunOutcome::CrashedNoDump)
                        .await?;
                    (outcome, None, Some(signal), false)
                }
                WaitOutcome::TimedOut => {
                    let found = self.terminate(&mut session).await?;
                    let outcome = self
                        .classify_dump(&session, found, RunOutcome::TimedOut)
                        .await?;
                    (
                        outcome,
                        None,
                        Some(Signal::SIGQUIT as i32),
                        true,
                    )
                }
            }
        };

        let dump_path = match &outcome {
            RunOutcome::Crashed { .. } => Some(session.dump_path().to_path_buf()),
            _ => None,
        };

        Ok(CompletedRun {
            outcome,
            target: target.to_path_buf(),
            args: args.to_vec(),
            pid,
            started_at,
            duration: session.elapsed(),
            exit_code,
            term_signal,
            timed_out,
            dump_path,
        })
    }

    /// Turn dump presence into an outcome: symbolize when found, otherwise
    /// log the soft warning with candidate diagnostics and fall back to
    /// `missing_outcome`.
    async fn classify_dump(
        &self,
        session: &RunSession,
        found: bool,
        missing_outcome: RunOutcome,
    ) -> Result<RunOutcome, RunError> {
        if found && self.detect_crash(session) {
            let report = self
                .process_crash(session)
                .await
                .map_err(RunError::Debugger)?;
            return Ok(RunOutcome::Crashed { report });
        }
        self.log_missing_dump(session);
        Ok(missing_outcome)
    }

    /// Soft error: the run is still complete, but list nearby candidate
    /// dump files to aid debugging of why detection failed (pattern drift,
    /// wrong PID suffix).
    fn log_missing_dump(&self, session: &RunSession) {
        let candidates = dump::candidate_dumps(&self.config.run.dump_dir);
        warn!(
            expected = %session.dump_path().display(),
            ?candidates,
            "expected dump file not found"
        );
    }
}
