//! External debugger integration.
//!
//! Locates gdb once at preparation time and runs it non-interactively
//! against the target binary and a dump artifact, capturing the textual
//! backtrace output.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

/// Env var that overrides debugger lookup entirely.
const DEBUGGER_ENV: &str = "COREHOUND_GDB";

/// Fallback locations checked after `PATH`.
const COMMON_LOCATIONS: &[&str] = &["/usr/bin/gdb", "/usr/local/bin/gdb"];

/// A located debugger binary.
#[derive(Debug, Clone)]
pub struct Debugger {
    path: PathBuf,
}

/// Errors raised while locating or invoking the debugger.
#[derive(Debug)]
pub enum DebuggerError {
    /// The debugger binary could not be found. Fatal at preparation time:
    /// the runner cannot fulfill its crash-reporting contract without it.
    NotFound { command: String },
    /// The debugger was found but could not be executed.
    Invoke { source: std::io::Error },
}

impl std::fmt::Display for DebuggerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebuggerError::NotFound { command } => {
                write!(f, "could not find debugger '{}'", command)
            }
            DebuggerError::Invoke { source } => {
                write!(f, "failed to invoke debugger: {}", source)
            }
        }
    }
}

impl std::error::Error for DebuggerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DebuggerError::NotFound { .. } => None,
            DebuggerError::Invoke { source } => Some(source),
        }
    }
}

impl Debugger {
    /// Locate the debugger binary.
    ///
    /// Resolution order: `COREHOUND_GDB` env override, an explicit path in
    /// `command` (anything containing a slash), a `PATH` walk, then a short
    /// list of common install locations.
    pub fn locate(command: &str) -> Result<Self, DebuggerError> {
        if let Ok(p) = env::var(DEBUGGER_ENV) {
            let path = PathBuf::from(p);
            if path.exists() {
                return Ok(Self { path });
            }
        }

        if command.contains('/') {
            let path = PathBuf::from(command);
            if path.exists() {
                return Ok(Self { path });
            }
            return Err(DebuggerError::NotFound {
                command: command.to_string(),
            });
        }

        if let Ok(paths) = env::var("PATH") {
            for dir in env::split_paths(&paths) {
                let exe = dir.join(command);
                if exe.exists() {
                    return Ok(Self { path: exe });
                }
            }
        }

        for p in COMMON_LOCATIONS {
            let path = PathBuf::from(p);
            if path.exists() {
                return Ok(Self { path });
            }
        }

        Err(DebuggerError::NotFound {
            command: command.to_string(),
        })
    }

    /// Resolved path of the debugger binary.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Argument list for a non-interactive backtrace: pagination off, full
    /// stack of the faulting thread (`where`), then stacks of every thread.
    fn invocation_args(target: &Path, dump: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            OsString::from("-q"),
            target.as_os_str().to_os_string(),
            dump.as_os_str().to_os_string(),
        ];
        for ex in [
            "set pagination off",
            "set trace-commands on",
            "where",
            "thread apply all bt",
            "quit",
        ] {
            args.push(OsString::from("-ex"));
            args.push(OsString::from(ex));
        }
        args
    }

    /// Run the debugger against `target` and its dump artifact, returning
    /// the combined stdout+stderr text. Expected to take seconds on large
    /// binaries; there is no cancellation once started.
    pub async fn backtrace(&self, target: &Path, dump: &Path) -> Result<String, DebuggerError> {
        let args = Self::invocation_args(target, dump);
        info!(
            debugger = %self.path.display(),
            target = %target.display(),
            dump = %dump.display(),
            "invoking debugger"
        );

        let output = Command::new(&self.path)
            .args(&args)
            .output()
            .await
            .map_err(|e| DebuggerError::Invoke { source: e })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_args_shape() {
        let args = Debugger::invocation_args(Path::new("/bin/app"), Path::new("/tmp/core.42"));
        assert_eq!(args[0], OsString::from("-q"));
        assert_eq!(args[1], OsString::from("/bin/app"));
        assert_eq!(args[2], OsString::from("/tmp/core.42"));
        // Each directive is preceded by -ex
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered.iter().filter(|a| *a == "-ex").count(), 5);
        assert!(rendered.contains(&"set pagination off".to_string()));
        assert!(rendered.contains(&"where".to_string()));
        assert!(rendered.contains(&"thread apply all bt".to_string()));
        assert_eq!(rendered.last().unwrap(), "quit");
    }

    #[test]
    fn test_locate_explicit_path() {
        let debugger = Debugger::locate("/bin/sh").unwrap();
        assert_eq!(debugger.path(), Path::new("/bin/sh"));
    }

    #[test]
    fn test_locate_missing_explicit_path() {
        let err = Debugger::locate("/nonexistent/gdb-xyz").unwrap_err();
        assert!(matches!(err, DebuggerError::NotFound { .. }));
        assert!(err.to_string().contains("could not find debugger"));
    }

    #[test]
    fn test_locate_missing_command() {
        let err = Debugger::locate("no-such-debugger-xyz").unwrap_err();
        assert!(matches!(err, DebuggerError::NotFound { .. }));
    }

    #[test]
    fn test_locate_on_path() {
        // sh is on PATH everywhere we run tests
        let debugger = Debugger::locate("sh").unwrap();
        assert!(debugger.path().ends_with("sh"));
    }

    #[tokio::test]
    async fn test_backtrace_relays_invocation() {
        // echo stands in for gdb: its output is the argument list, which
        // lets us check the full command line without a real debugger.
        let debugger = Debugger::locate("/bin/echo").unwrap();
        let text = debugger
            .backtrace(Path::new("/bin/app"), Path::new("/tmp/core.42"))
            .await
            .unwrap();
        assert!(text.contains("-q /bin/app /tmp/core.42"));
        assert!(text.contains("set pagination off"));
        assert!(text.contains("thread apply all bt"));
    }

    #[tokio::test]
    async fn test_backtrace_invoke_error() {
        let debugger = Debugger {
            path: PathBuf::from("/nonexistent/gdb-xyz"),
        };
        let err = debugger
            .backtrace(Path::new("/bin/app"), Path::new("/tmp/core.42"))
            .await
            .unwrap_err();
        assert!(matches!(err, DebuggerError::Invoke { .. }));
    }
}
