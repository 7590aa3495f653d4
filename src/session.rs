/// Single run lifecycle: spawn the target subprocess, wait for exit or
/// timeout, and force termination with a dump-producing quit signal.
use crate::config::TerminationConfig;
use crate::dump;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How the timed wait on the target ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Target exited on its own with the given exit code.
    NaturalExit(i32),
    /// Target was killed by the given signal before the timeout.
    Signaled(i32),
    /// Timeout elapsed with the target still running.
    TimedOut,
}

/// Errors that can occur while supervising the target process.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to spawn the target (bad path, permissions).
    Spawn {
        target: PathBuf,
        source: std::io::Error,
    },
    /// Failed to wait on or reap the target.
    Wait { source: std::io::Error },
    /// Failed to deliver the termination signal.
    Signal { pid: u32, source: Errno },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn { target, source } => {
                write!(f, "failed to spawn target {}: {}", target.display(), source)
            }
            SessionError::Wait { source } => {
                write!(f, "failed to wait on target: {}", source)
            }
            SessionError::Signal { pid, source } => {
                write!(f, "failed to signal target pid {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source, .. } => Some(source),
            SessionError::Wait { source } => Some(source),
            SessionError::Signal { source, .. } => Some(source),
        }
    }
}

/// One supervised execution of a target program.
///
/// Holds the ownership handle to the spawned process. Exactly one session
/// is live per runner invocation; a harness running many targets is
/// expected to run sessions sequentially.
#[derive(Debug)]
pub struct RunSession {
    target: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    dump_path: PathBuf,
}

impl RunSession {
    /// Spawn the target with the given arguments.
    ///
    /// The child runs in `dump_dir` (the dump directory is the working
    /// directory at launch time) and in its own process group so terminal
    /// signals aimed at the runner do not reach it.
    pub fn launch(
        target: &Path,
        args: &[String],
        timeout: Duration,
        dump_dir: &Path,
    ) -> Result<RunSession, SessionError> {
        info!(
            target = %target.display(),
            ?args,
            timeout_secs = timeout.as_secs(),
            "launching target"
        );

        let child = Command::new(target)
            .args(args)
            .current_dir(dump_dir)
            .process_group(0)
            .spawn()
            .map_err(|e| SessionError::Spawn {
                target: target.to_path_buf(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        let dump_path = dump::expected_dump_path(dump_dir, pid);
        info!(pid, dump = %dump_path.display(), "target started");

        Ok(RunSession {
            target: target.to_path_buf(),
            args: args.to_vec(),
            timeout,
            child,
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            dump_path,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Argument list the target was launched with.
    #[allow(dead_code)]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Expected dump path for this session (`core.<pid>` in the dump dir).
    /// Only meaningful once the target has been signaled and the dump poll
    /// has run.
    pub fn dump_path(&self) -> &Path {
        &self.dump_path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock time since launch.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the target is still running.
    pub fn is_running(&mut self) -> Result<bool, SessionError> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| SessionError::Wait { source: e })?;
        Ok(status.is_none())
    }

    /// Block until the target exits naturally or the configured timeout
    /// elapses, whichever is first. Does not itself determine crash status:
    /// a signaled exit is reported as-is and dump detection happens later.
    pub async fn wait_or_timeout(&mut self) -> Result<WaitOutcome, SessionError> {
        match tokio::time::timeout(self.timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                let outcome = match status.code() {
                    Some(code) => WaitOutcome::NaturalExit(code),
                    None => WaitOutcome::Signaled(status.signal().unwrap_or(0)),
                };
                info!(pid = self.pid, ?outcome, "target exited");
                Ok(outcome)
            }
            Ok(Err(e)) => Err(SessionError::Wait { source: e }),
            Err(_) => {
                warn!(
                    pid = self.pid,
                    timeout_secs = self.timeout.as_secs(),
                    "target still running at timeout"
                );
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    /// Force an end to execution with a dump-producing quit signal.
    ///
    /// Waits the configured grace interval first so any in-flight fault
    /// handling inside the target can complete, then sends SIGQUIT (quit
    /// with core, not an immediate kill) and reaps the child. A target that
    /// ignores SIGQUIT is killed outright after `poll_max_wait_ms`.
    ///
    /// Callers poll for the dump file afterwards; dump writing is
    /// asynchronous relative to signal delivery.
    pub async fn terminate(&mut self, config: &TerminationConfig) -> Result<(), SessionError> {
        tokio::time::sleep(Duration::from_millis(config.pre_signal_grace_ms)).await;

        let already_exited = self
            .child
            .try_wait()
            .map_err(|e| SessionError::Wait { source: e })?
            .is_some();

        if already_exited {
            debug!(pid = self.pid, "target already exited, skipping signal");
            return Ok(());
        }

        info!(pid = self.pid, "sending quit signal");
        match kill(Pid::from_raw(self.pid as i32), Signal::SIGQUIT) {
            Ok(()) => {}
            // Exited between the check and the signal
            Err(Errno::ESRCH) => {
                debug!(pid = self.pid, "target gone before signal delivery");
            }
            Err(e) => {
                return Err(SessionError::Signal {
                    pid: self.pid,
                    source: e,
                })
            }
        }

        let reap_window = Duration::from_millis(config.poll_max_wait_ms);
        match tokio::time::timeout(reap_window, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, ?status, "target reaped after quit signal");
            }
            Ok(Err(e)) => return Err(SessionError::Wait { source: e }),
            Err(_) => {
                warn!(pid = self.pid, "target ignored quit signal, killing");
                self.child
                    .kill()
                    .await
                    .map_err(|e| SessionError::Wait { source: e })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_termination() -> TerminationConfig {
        TerminationConfig {
            pre_signal_grace_ms: 50,
            poll_initial_ms: 10,
            poll_max_wait_ms: 500,
        }
    }

    fn launch_sh(dir: &Path, script: &str, timeout: Duration) -> RunSession {
        RunSession::launch(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            timeout,
            dir,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_clean_exit_returns_real_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = RunSession::launch(
            Path::new("/bin/true"),
            &[],
            Duration::from_secs(5),
            dir.path(),
        )
        .unwrap();

        let started = Instant::now();
        let outcome = session.wait_or_timeout().await.unwrap();
        assert_eq!(outcome, WaitOutcome::NaturalExit(0));
        // Well under the 5s timeout
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = launch_sh(dir.path(), "exit 42", Duration::from_secs(5));
        assert_eq!(
            session.wait_or_timeout().await.unwrap(),
            WaitOutcome::NaturalExit(42)
        );
    }

    #[tokio::test]
    async fn test_signaled_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = launch_sh(dir.path(), "kill -TERM $$", Duration::from_secs(5));
        assert_eq!(
            session.wait_or_timeout().await.unwrap(),
            WaitOutcome::Signaled(Signal::SIGTERM as i32)
        );
    }

    #[tokio::test]
    async fn test_timeout_leaves_target_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = launch_sh(dir.path(), "sleep 10", Duration::from_millis(200));

        let started = Instant::now();
        let outcome = session.wait_or_timeout().await.unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        // Timed out at ~200ms, not after the sleep finished
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(session.is_running().unwrap());

        session.terminate(&fast_termination()).await.unwrap();
        assert!(!session.is_running().unwrap());
    }

    #[tokio::test]
    async fn test_terminate_after_natural_exit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = launch_sh(dir.path(), "exit 0", Duration::from_secs(5));
        session.wait_or_timeout().await.unwrap();
        // Terminating an already-exited target succeeds without signaling
        session.terminate(&fast_termination()).await.unwrap();
        assert!(!session.is_running().unwrap());
    }

    #[tokio::test]
    async fn test_terminate_kills_quit_ignoring_target() {
        let dir = tempfile::tempdir().unwrap();
        // Shell that traps SIGQUIT and keeps sleeping
        let mut session = launch_sh(
            dir.path(),
            "trap '' QUIT; sleep 30",
            Duration::from_millis(100),
        );
        assert_eq!(
            session.wait_or_timeout().await.unwrap(),
            WaitOutcome::TimedOut
        );

        session.terminate(&fast_termination()).await.unwrap();
        assert!(!session.is_running().unwrap());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunSession::launch(
            Path::new("/nonexistent-binary-xyz"),
            &[],
            Duration::from_secs(1),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_dump_path_uses_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = launch_sh(dir.path(), "exit 0", Duration::from_secs(5));
        let expected = dir.path().join(format!("core.{}", session.pid()));
        assert_eq!(session.dump_path(), expected);
        session.wait_or_timeout().await.unwrap();
    }

    #[tokio::test]
    async fn test_detect_crash_idempotent_after_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = launch_sh(dir.path(), "sleep 10", Duration::from_millis(100));
        assert_eq!(
            session.wait_or_timeout().await.unwrap(),
            WaitOutcome::TimedOut
        );
        session.terminate(&fast_termination()).await.unwrap();

        let first = dump::detect_crash(session.dump_path());
        let second = dump::detect_crash(session.dump_path());
        assert_eq!(first, second);
    }
}
