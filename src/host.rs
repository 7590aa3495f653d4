//! Host-global crash configuration: core-dump rlimit and kernel core pattern.
//!
//! Both settings are process-external state shared by every run on the host.
//! `ensure()` treats them as an idempotent precondition: it reads first and
//! only writes when the current value differs from the desired one.

use crate::config::HostConfig;
use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};
use std::path::PathBuf;
use tracing::{debug, info};

/// Desired host crash configuration with an idempotent `ensure` operation.
///
/// The core-pattern file path is a field rather than a hardcoded `/proc`
/// location so tests can point it at a temp file.
#[derive(Debug, Clone)]
pub struct HostCrashConfig {
    pattern: String,
    pattern_file: PathBuf,
}

/// Errors raised while mutating host crash configuration.
#[derive(Debug)]
pub enum HostError {
    /// Could not read or raise the core-dump size limit.
    Rlimit { source: nix::errno::Errno },
    /// Could not read the kernel core-pattern file.
    PatternRead {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Could not rewrite the kernel core-pattern file (typically a
    /// privilege problem); never swallowed.
    PatternWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::Rlimit { source } => {
                write!(f, "failed to set core dump size limit: {}", source)
            }
            HostError::PatternRead { path, source } => {
                write!(
                    f,
                    "failed to read core pattern file {}: {}",
                    path.display(),
                    source
                )
            }
            HostError::PatternWrite { path, source } => {
                write!(
                    f,
                    "failed to write core pattern file {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostError::Rlimit { source } => Some(source),
            HostError::PatternRead { source, .. } => Some(source),
            HostError::PatternWrite { source, .. } => Some(source),
        }
    }
}

impl HostCrashConfig {
    /// Build the desired host configuration from the config file section.
    pub fn new(config: &HostConfig) -> Self {
        Self {
            pattern: config.core_pattern.clone(),
            pattern_file: config.core_pattern_file.clone(),
        }
    }

    /// The dump filename template this host is expected to use.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Bring the host into the desired state: unlimited core-dump size and
    /// the expected core pattern. Repeated calls on an already-correct host
    /// perform no writes.
    pub fn ensure(&self) -> Result<(), HostError> {
        self.ensure_core_limit()?;
        self.ensure_core_pattern()?;
        Ok(())
    }

    /// Equivalent of `ulimit -c unlimited`, applied only when either the
    /// soft or hard limit is still bounded.
    fn ensure_core_limit(&self) -> Result<(), HostError> {
        let (soft, hard) =
            getrlimit(Resource::RLIMIT_CORE).map_err(|e| HostError::Rlimit { source: e })?;
        if soft != RLIM_INFINITY || hard != RLIM_INFINITY {
            info!("raising core dump size limit to unlimited");
            setrlimit(Resource::RLIMIT_CORE, RLIM_INFINITY, RLIM_INFINITY)
                .map_err(|e| HostError::Rlimit { source: e })?;
        } else {
            debug!("core dump size limit already unlimited");
        }
        Ok(())
    }

    /// Rewrite the kernel core pattern when it differs from the expected
    /// template. The explicit `%p` suffix keeps dump filenames predictable
    /// across kernels that would otherwise write a bare `core` file.
    fn ensure_core_pattern(&self) -> Result<(), HostError> {
        let current = std::fs::read_to_string(&self.pattern_file).map_err(|e| {
            HostError::PatternRead {
                path: self.pattern_file.clone(),
                source: e,
            }
        })?;
        let current = current.trim();

        if current != self.pattern {
            info!(
                current = %current,
                desired = %self.pattern,
                "rewriting core pattern"
            );
            std::fs::write(&self.pattern_file, &self.pattern).map_err(|e| {
                HostError::PatternWrite {
                    path: self.pattern_file.clone(),
                    source: e,
                }
            })?;
        } else {
            debug!(pattern = %current, "core pattern already correct");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    fn host_with_pattern_file(path: PathBuf) -> HostCrashConfig {
        HostCrashConfig::new(&HostConfig {
            core_pattern: "core.%p".to_string(),
            core_pattern_file: path,
        })
    }

    #[test]
    fn test_pattern_rewritten_when_wrong() {
        let dir = tempfile::tempdir().unwrap();
        let pattern_file = dir.path().join("core_pattern");
        std::fs::write(&pattern_file, "core\n").unwrap();

        let host = host_with_pattern_file(pattern_file.clone());
        host.ensure_core_pattern().unwrap();

        assert_eq!(std::fs::read_to_string(&pattern_file).unwrap(), "core.%p");
    }

    #[test]
    fn test_pattern_left_alone_when_correct() {
        let dir = tempfile::tempdir().unwrap();
        let pattern_file = dir.path().join("core_pattern");
        std::fs::write(&pattern_file, "core.%p\n").unwrap();

        // Backdate the mtime so an unexpected rewrite would be visible.
        let old = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&pattern_file, old).unwrap();

        let host = host_with_pattern_file(pattern_file.clone());
        host.ensure_core_pattern().unwrap();

        let mtime = FileTime::from_last_modification_time(
            &std::fs::metadata(&pattern_file).unwrap(),
        );
        assert_eq!(mtime, old);
    }

    #[test]
    fn test_ensure_core_pattern_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pattern_file = dir.path().join("core_pattern");
        std::fs::write(&pattern_file, "core\n").unwrap();

        let host = host_with_pattern_file(pattern_file.clone());
        host.ensure_core_pattern().unwrap();

        let old = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&pattern_file, old).unwrap();

        // Second run sees the correct pattern and must not write again.
        host.ensure_core_pattern().unwrap();
        let mtime = FileTime::from_last_modification_time(
            &std::fs::metadata(&pattern_file).unwrap(),
        );
        assert_eq!(mtime, old);
    }

    #[test]
    fn test_missing_pattern_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_with_pattern_file(dir.path().join("nope"));
        let err = host.ensure_core_pattern().unwrap_err();
        assert!(matches!(err, HostError::PatternRead { .. }));
        assert!(err.to_string().contains("failed to read core pattern"));
    }

    #[test]
    fn test_unwritable_pattern_file_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let pattern_file = dir.path().join("core_pattern");
        std::fs::write(&pattern_file, "core\n").unwrap();

        let mut perms = std::fs::metadata(&pattern_file).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o444);
        std::fs::set_permissions(&pattern_file, perms).unwrap();

        let host = host_with_pattern_file(pattern_file.clone());
        let result = host.ensure_core_pattern();
        // Root bypasses file modes, so only assert the error shape when the
        // write actually failed.
        if let Err(err) = result {
            assert!(matches!(err, HostError::PatternWrite { .. }));
        }
    }
}
