//! Host interaction.
//!
//! Everything the reconciliation flows need from the operating system goes
//! through [`SystemFacade`]:
//!
//! ```text
//! SystemFacade
//!     +-- HostSystem       (std::process, atomic file writes, os-release, euid)
//!     +-- RecordingSystem  (in-memory files, scripted command outputs)
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::fs_safe;

/// Default location of the os-release file.
pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Errors from host interaction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SystemError {
    /// The program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        source: io::Error,
    },

    /// The program exited with a status the caller does not accept.
    #[error("{program} exited with {}: {stderr}", .code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    ExitStatus {
        /// Program name.
        program: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Affected path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The os-release file is missing the fields needed to identify the
    /// release.
    #[error("cannot determine release: {reason}")]
    OsRelease {
        /// What was missing.
        reason: String,
    },
}

impl SystemError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run printing `stdout`.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A run that exited with `code`.
    #[must_use]
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Accept the output only if it exited with one of `allowed`.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ExitStatus`] otherwise.
    pub fn ensure_exit_in(self, program: &str, allowed: &[i32]) -> Result<Self, SystemError> {
        if self.code.is_some_and(|c| allowed.contains(&c)) {
            Ok(self)
        } else {
            Err(SystemError::ExitStatus {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr,
            })
        }
    }
}

/// Identity of the running release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Codename, e.g. `"jammy"`.
    pub series: String,
    /// Numeric version, e.g. `"22.04"`.
    pub version_id: String,
}

impl ReleaseInfo {
    /// Convenience constructor.
    #[must_use]
    pub fn new(series: impl Into<String>, version_id: impl Into<String>) -> Self {
        Self {
            series: series.into(),
            version_id: version_id.into(),
        }
    }
}

/// Parse an os-release file.
///
/// The series is `VERSION_CODENAME`, or the first word inside the
/// parentheses of `VERSION` when the codename field is absent.
///
/// # Errors
///
/// Returns [`SystemError::OsRelease`] if no series can be found.
pub fn parse_os_release(content: &str) -> Result<ReleaseInfo, SystemError> {
    let fields: BTreeMap<&str, &str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim().trim_matches(|c| c == '"' || c == '\'')))
        .collect();

    let series = fields
        .get("VERSION_CODENAME")
        .filter(|v| !v.is_empty())
        .map(|v| (*v).to_string())
        .or_else(|| {
            let version = fields.get("VERSION")?;
            let start = version.find('(')?;
            let inner = &version[start + 1..];
            let word = inner.split(|c: char| c == ')' || c.is_whitespace()).next()?;
            (!word.is_empty()).then(|| word.to_lowercase())
        })
        .ok_or_else(|| SystemError::OsRelease {
            reason: "neither VERSION_CODENAME nor a codename in VERSION".to_string(),
        })?;

    let version_id = fields.get("VERSION_ID").map(|v| (*v).to_string()).unwrap_or_default();

    Ok(ReleaseInfo { series, version_id })
}

/// Operating-system collaborator.
pub trait SystemFacade: Send + Sync {
    /// Run `program` with `args` and capture its output. A non-zero exit is
    /// not an error at this level.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Spawn`] if the program could not be started.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, SystemError>;

    /// Atomically replace `path` with `content`.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Io`] on failure.
    fn write_file(&self, path: &Path, content: &[u8], mode: u32) -> Result<(), SystemError>;

    /// Read `path` as UTF-8, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Io`] for failures other than a missing file.
    fn read_file(&self, path: &Path) -> Result<Option<String>, SystemError>;

    /// Remove a file; returns whether one was removed.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Io`] for failures other than a missing file.
    fn remove_file_if_exists(&self, path: &Path) -> Result<bool, SystemError>;

    /// Recursively remove a directory; returns whether one was removed.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Io`] for failures other than a missing
    /// directory.
    fn remove_dir_if_exists(&self, path: &Path) -> Result<bool, SystemError>;

    /// Whether anything exists at `path`.
    fn path_exists(&self, path: &Path) -> bool;

    /// Whether the optional helper executable at `path` is installed.
    fn helper_present(&self, path: &Path) -> bool;

    /// Whether `name` resolves to an executable on `PATH`.
    fn command_exists(&self, name: &str) -> bool;

    /// Identity of the running release.
    ///
    /// # Errors
    ///
    /// Returns an error if the release cannot be determined.
    fn release_info(&self) -> Result<ReleaseInfo, SystemError>;

    /// Whether the effective user is root.
    fn is_root(&self) -> bool;
}

/// The real host.
#[derive(Debug, Clone)]
pub struct HostSystem {
    os_release_path: PathBuf,
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSystem {
    /// Host reading release info from [`OS_RELEASE_PATH`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            os_release_path: PathBuf::from(OS_RELEASE_PATH),
        }
    }

    /// Host reading release info from a different file.
    #[must_use]
    pub fn with_os_release_path(path: impl Into<PathBuf>) -> Self {
        Self {
            os_release_path: path.into(),
        }
    }
}

impl SystemFacade for HostSystem {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, SystemError> {
        debug!(program, ?args, "running command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| SystemError::Spawn {
                program: program.to_string(),
                source,
            })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn write_file(&self, path: &Path, content: &[u8], mode: u32) -> Result<(), SystemError> {
        fs_safe::atomic_write(path, content, mode).map_err(|e| SystemError::io(path, e))
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>, SystemError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SystemError::io(path, e)),
        }
    }

    fn remove_file_if_exists(&self, path: &Path) -> Result<bool, SystemError> {
        fs_safe::remove_if_exists(path).map_err(|e| SystemError::io(path, e))
    }

    fn remove_dir_if_exists(&self, path: &Path) -> Result<bool, SystemError> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SystemError::io(path, e)),
        }
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn helper_present(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn command_exists(&self, name: &str) -> bool {
        let Some(paths) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
    }

    fn release_info(&self) -> Result<ReleaseInfo, SystemError> {
        let content = fs::read_to_string(&self.os_release_path)
            .map_err(|e| SystemError::io(&self.os_release_path, e))?;
        parse_os_release(&content)
    }

    fn is_root(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory host
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RecordingState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    helpers: BTreeSet<PathBuf>,
    commands_available: BTreeSet<String>,
    scripts: BTreeMap<String, VecDeque<Result<CommandOutput, String>>>,
    failing_writes: BTreeSet<PathBuf>,
    invocations: Vec<Vec<String>>,
    release: Option<ReleaseInfo>,
    root: bool,
}

/// In-memory [`SystemFacade`] that records what the code under test did.
///
/// Scripted command outputs are consumed in order per program; the last one
/// stays in place and answers every later call. Unscripted programs succeed
/// with empty output.
#[derive(Debug)]
pub struct RecordingSystem {
    state: Mutex<RecordingState>,
}

impl Default for RecordingSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSystem {
    /// Root user, `run-parts` available, no release configured.
    #[must_use]
    pub fn new() -> Self {
        let state = RecordingState {
            root: true,
            commands_available: BTreeSet::from(["run-parts".to_string()]),
            ..RecordingState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the running release.
    #[must_use]
    pub fn with_release(self, series: &str, version_id: &str) -> Self {
        self.state().release = Some(ReleaseInfo::new(series, version_id));
        self
    }

    /// Set whether the caller is root.
    pub fn set_root(&self, root: bool) {
        self.state().root = root;
    }

    /// Make `name` resolvable on `PATH` (or not).
    pub fn set_command_available(&self, name: &str, available: bool) {
        let mut state = self.state();
        if available {
            state.commands_available.insert(name.to_string());
        } else {
            state.commands_available.remove(name);
        }
    }

    /// Install a helper executable.
    pub fn add_helper(&self, path: impl Into<PathBuf>) {
        self.state().helpers.insert(path.into());
    }

    /// Queue an output for the next call to `program`.
    pub fn script(&self, program: &str, output: CommandOutput) {
        self.state()
            .scripts
            .entry(program.to_string())
            .or_default()
            .push_back(Ok(output));
    }

    /// Queue a spawn failure for the next call to `program`.
    pub fn script_spawn_failure(&self, program: &str, message: &str) {
        self.state()
            .scripts
            .entry(program.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    /// Make every write to `path` fail.
    pub fn fail_writes_to(&self, path: impl Into<PathBuf>) {
        self.state().failing_writes.insert(path.into());
    }

    /// Seed a file.
    pub fn put_file(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.state().files.insert(path.into(), content.into());
    }

    /// Seed a directory.
    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        self.state().dirs.insert(path.into());
    }

    /// Current content of `path` as UTF-8.
    #[must_use]
    pub fn file(&self, path: &Path) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Every command run so far, as `[program, args...]`.
    #[must_use]
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.state().invocations.clone()
    }

    /// Invocations of one program.
    #[must_use]
    pub fn invocations_of(&self, program: &str) -> Vec<Vec<String>> {
        self.state()
            .invocations
            .iter()
            .filter(|argv| argv.first().is_some_and(|p| p == program))
            .cloned()
            .collect()
    }
}

impl SystemFacade for RecordingSystem {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, SystemError> {
        let mut state = self.state();
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().map(|a| (*a).to_string()));
        state.invocations.push(argv);

        let scripted = match state.scripts.get_mut(program) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        match scripted {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(SystemError::Spawn {
                program: program.to_string(),
                source: io::Error::other(message),
            }),
            None => Ok(CommandOutput::success("")),
        }
    }

    fn write_file(&self, path: &Path, content: &[u8], _mode: u32) -> Result<(), SystemError> {
        let mut state = self.state();
        if state.failing_writes.contains(path) {
            return Err(SystemError::io(
                path,
                io::Error::new(io::ErrorKind::PermissionDenied, "write refused"),
            ));
        }
        state.files.insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>, SystemError> {
        Ok(self.file(path))
    }

    fn remove_file_if_exists(&self, path: &Path) -> Result<bool, SystemError> {
        Ok(self.state().files.remove(path).is_some())
    }

    fn remove_dir_if_exists(&self, path: &Path) -> Result<bool, SystemError> {
        let mut state = self.state();
        let had_dir = state.dirs.remove(path);
        let before = state.files.len();
        state.files.retain(|p, _| !p.starts_with(path));
        state.dirs.retain(|d| !d.starts_with(path));
        Ok(had_dir || state.files.len() != before)
    }

    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state();
        state.files.contains_key(path)
            || state.dirs.contains(path)
            || state.files.keys().any(|p| p.starts_with(path))
    }

    fn helper_present(&self, path: &Path) -> bool {
        self.state().helpers.contains(path)
    }

    fn command_exists(&self, name: &str) -> bool {
        self.state().commands_available.contains(name)
    }

    fn release_info(&self) -> Result<ReleaseInfo, SystemError> {
        self.state()
            .release
            .clone()
            .ok_or_else(|| SystemError::OsRelease {
                reason: "no release configured".to_string(),
            })
    }

    fn is_root(&self) -> bool {
        self.state().root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release_prefers_codename() {
        let content = r#"
NAME="Ubuntu"
VERSION="22.04.3 LTS (Jammy Jellyfish)"
VERSION_ID="22.04"
VERSION_CODENAME=jammy
"#;
        assert_eq!(parse_os_release(content).unwrap(), ReleaseInfo::new("jammy", "22.04"));
    }

    #[test]
    fn test_parse_os_release_falls_back_to_version() {
        let content = "VERSION=\"16.04.7 LTS (Xenial Xerus)\"\nVERSION_ID=\"16.04\"\n";
        assert_eq!(parse_os_release(content).unwrap(), ReleaseInfo::new("xenial", "16.04"));
    }

    #[test]
    fn test_parse_os_release_without_series_fails() {
        let err = parse_os_release("NAME=Ubuntu\nVERSION_ID=\"22.04\"\n").unwrap_err();
        assert!(matches!(err, SystemError::OsRelease { .. }));
    }

    #[test]
    fn test_ensure_exit_in() {
        assert!(CommandOutput::exited(1, "", "").ensure_exit_in("lsof", &[0, 1]).is_ok());
        let err = CommandOutput::exited(2, "", "boom")
            .ensure_exit_in("lsof", &[0, 1])
            .unwrap_err();
        assert_eq!(err.to_string(), "lsof exited with status 2: boom");
    }

    #[test]
    fn test_recording_system_scripts_are_consumed_then_sticky() {
        let sys = RecordingSystem::new();
        sys.script("lsof", CommandOutput::success("apt 1 root"));
        sys.script("lsof", CommandOutput::exited(1, "", ""));

        assert_eq!(sys.run("lsof", &["/lock"]).unwrap().stdout, "apt 1 root");
        assert_eq!(sys.run("lsof", &["/lock"]).unwrap().code, Some(1));
        assert_eq!(sys.run("lsof", &["/lock"]).unwrap().code, Some(1));
        assert_eq!(sys.invocations_of("lsof").len(), 3);
    }

    #[test]
    fn test_recording_system_files_and_dirs() {
        let sys = RecordingSystem::new();
        let file = Path::new("/var/lib/uapro/apt/esm/lists/a");
        sys.write_file(file, b"x", 0o644).unwrap();
        assert!(sys.path_exists(Path::new("/var/lib/uapro/apt/esm")));

        assert!(
            sys.remove_dir_if_exists(Path::new("/var/lib/uapro/apt/esm"))
                .unwrap()
        );
        assert!(sys.file(file).is_none());
        assert!(
            !sys.remove_dir_if_exists(Path::new("/var/lib/uapro/apt/esm"))
                .unwrap()
        );
    }

    #[test]
    fn test_host_system_roundtrips_files() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostSystem::with_os_release_path(dir.path().join("os-release"));
        let target = dir.path().join("messages").join("motd");

        assert_eq!(host.read_file(&target).unwrap(), None);
        host.write_file(&target, b"hello\n\n", 0o644).unwrap();
        assert_eq!(host.read_file(&target).unwrap().as_deref(), Some("hello\n\n"));
        assert!(host.remove_file_if_exists(&target).unwrap());
        assert!(!host.remove_file_if_exists(&target).unwrap());

        fs::write(dir.path().join("os-release"), "VERSION_CODENAME=noble\nVERSION_ID=24.04\n").unwrap();
        assert_eq!(host.release_info().unwrap().series, "noble");
    }
}
