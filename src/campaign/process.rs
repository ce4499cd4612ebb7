//! Blocking subprocess execution bounded by a timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Time allowed to collect output after a child exits close to its deadline.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Subprocess errors. A timeout is not an error, see [`RunOutcome`].
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program path.
        program: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Waiting on the child failed.
    #[error("failed to wait for {program}: {source}")]
    Wait {
        /// Program path.
        program: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Captured result of a subprocess that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code; a negative value `-N` means the process died from signal `N`.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ExecutionResult {
    /// True if the process exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Lossy UTF-8 view of stdout.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Lossy UTF-8 view of stderr.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Outcome of one bounded subprocess call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process finished within its budget.
    Completed(ExecutionResult),
    /// The budget expired and the process group was killed.
    TimedOut,
}

impl RunOutcome {
    /// Completed result, if any.
    pub fn completed(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::TimedOut => None,
        }
    }
}

/// Program, arguments and environment for one subprocess call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<OsString>,
    /// Variables added to the inherited environment.
    pub env: BTreeMap<String, OsString>,
    /// Inherited variables the child must not see.
    pub env_removed: BTreeSet<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// New command for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            env_removed: BTreeSet::new(),
            cwd: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        let key = key.into();
        self.env_removed.remove(&key);
        self.env.insert(key, value.into());
        self
    }

    /// Hide an inherited variable from the child.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.env.remove(&key);
        self.env_removed.insert(key);
        self
    }

    /// Set several environment variables.
    pub fn envs<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (key, value) in vars {
            self.env_removed.remove(key);
            self.env.insert(key.clone(), value.into());
        }
        self
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    fn display_program(&self) -> String {
        self.program.display().to_string()
    }
}

/// Run `spec` to completion or until `timeout` expires.
///
/// The child gets its own process group so that a timeout kills every
/// descendant, not only the direct child. Descendants still alive when the
/// child exits are killed too, and the budget also bounds reading the
/// child's output.
pub fn run_with_timeout(spec: &CommandSpec, timeout: Duration) -> Result<RunOutcome, ProcessError> {
    let mut command = Command::new(&spec.program);
    for key in &spec.env_removed {
        command.env_remove(key);
    }
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.display_program(),
        source,
    })?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if Instant::now() >= deadline => {
                kill_process_group(&mut child);
                break None;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                kill_process_group(&mut child);
                return Err(ProcessError::Wait {
                    program: spec.display_program(),
                    source,
                });
            }
        }
    };
    // the group outlives its leader while any member is alive
    signal_group(child.id());

    let drain_deadline = deadline.max(Instant::now() + DRAIN_GRACE);
    let output = join_drain(stdout, drain_deadline).zip(join_drain(stderr, drain_deadline));
    Ok(match (status, output) {
        (Some(status), Some((stdout, stderr))) => RunOutcome::Completed(ExecutionResult {
            exit_code: exit_code(status),
            stdout,
            stderr,
        }),
        (status, _) => {
            tracing::debug!(
                program = %spec.display_program(),
                timeout_secs = timeout.as_secs_f64(),
                exited = status.is_some(),
                "process timed out"
            );
            RunOutcome::TimedOut
        }
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

/// Output of one pipe, or `None` if it is still open at `deadline`. A reader
/// still blocked then is left detached.
fn join_drain(handle: Option<JoinHandle<Vec<u8>>>, deadline: Instant) -> Option<Vec<u8>> {
    let Some(handle) = handle else {
        return Some(Vec::new());
    };
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
    Some(handle.join().unwrap_or_default())
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

fn kill_process_group(child: &mut Child) {
    signal_group(child.id());
    if let Err(err) = child.kill() {
        if err.kind() != std::io::ErrorKind::InvalidInput {
            tracing::warn!(pid = child.id(), error = %err, "failed to kill child process");
        }
    }
    if let Err(err) = child.wait() {
        tracing::warn!(pid = child.id(), error = %err, "failed to reap child process");
    }
}

/// SIGKILL the process group led by `pid`. An empty group is not an error.
fn signal_group(pid: u32) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(pid) {
            // SAFETY: kill(2) with a negative pid signals the process group we
            // created for this child; it touches no memory.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!(pgid, error = %err, "failed to kill process group");
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
