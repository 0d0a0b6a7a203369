//! ImageMagick transform engine.
//!
//! Runs `<binary> <source> <args...> <dest>` as a child process with piped
//! output and a hard wall-clock timeout. Stdout and stderr are drained on
//! reader threads (bounded) so a chatty child can never block on a full pipe;
//! the parent polls `try_wait` and kills the child once the deadline passes.
//!
//! On Unix the child leads its own process group and a timeout kills the
//! whole group. Delegates and wrapper scripts fork, and a surviving
//! grandchild would otherwise hold the output pipes open past the deadline.

use super::engine::{EngineError, TransformEngine};
use super::params::{TransformParam, render_args};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Per-stream cap on captured diagnostics.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct MagickEngine {
    binary: PathBuf,
    timeout: Duration,
}

impl MagickEngine {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Full argument vector passed to the binary.
    pub fn command_args(source: &Path, params: &[TransformParam], dest: &Path) -> Vec<String> {
        let mut args = Vec::with_capacity(params.len() * 2 + 2);
        args.push(source.to_string_lossy().into_owned());
        args.extend(render_args(params));
        args.push(dest.to_string_lossy().into_owned());
        args
    }
}

impl TransformEngine for MagickEngine {
    fn transform(
        &self,
        source: &Path,
        params: &[TransformParam],
        dest: &Path,
    ) -> Result<(), EngineError> {
        let args = Self::command_args(source, params, dest);
        tracing::debug!(binary = %self.binary.display(), args = ?args, "running transform engine");

        let run = run_with_timeout(&self.binary, &args, self.timeout)?;
        if run.timed_out {
            return Err(EngineError::TimedOut(self.timeout));
        }
        if !run.status.success() {
            return Err(EngineError::Failed {
                diagnostic: failure_diagnostic(&run),
            });
        }
        Ok(())
    }
}

struct ChildRun {
    status: ExitStatus,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

fn failure_diagnostic(run: &ChildRun) -> String {
    let stderr = run.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = run.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("engine exited with {}", run.status)
}

fn run_with_timeout(program: &Path, args: &[String], timeout: Duration) -> io::Result<ChildRun> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;

        cmd.pre_exec(|| {
            // SAFETY: runs in the forked child; `setpgid` is async-signal-safe.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not captured"));
    };
    let stdout_handle = thread::spawn(move || read_bounded(stdout));
    let stderr_handle = thread::spawn(move || read_bounded(stderr));

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            break kill_process_tree(&mut child)?;
        }
        thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
    };

    let stdout = join_reader(stdout_handle, "stdout")??;
    let stderr = join_reader(stderr_handle, "stderr")??;

    Ok(ChildRun {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
    })
}

fn kill_process_tree(child: &mut Child) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        // The group id is the child's pid, set by `setpgid(0, 0)` at spawn.
        let pgid = child.id() as libc::pid_t;
        // SAFETY: plain syscall; ESRCH for an already-empty group is ignored.
        unsafe {
            let _ = libc::kill(-pgid, libc::SIGKILL);
        }
        child.wait()
    }

    #[cfg(not(unix))]
    {
        // The child may exit between try_wait and kill.
        let _ = child.kill();
        child.wait()
    }
}

fn join_reader(
    handle: thread::JoinHandle<io::Result<Vec<u8>>>,
    stream: &'static str,
) -> io::Result<io::Result<Vec<u8>>> {
    handle
        .join()
        .map_err(|_| io::Error::other(format!("{stream} reader thread panicked")))
}

/// Read a stream to EOF, keeping at most [`MAX_CAPTURE_BYTES`].
fn read_bounded(mut reader: impl Read) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let remaining = MAX_CAPTURE_BYTES.saturating_sub(out.len());
        out.extend_from_slice(&buf[..n.min(remaining)]);
    }
    Ok(out)
}
