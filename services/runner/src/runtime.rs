//! Runtime invoker: runs a bundle through an external OCI runtime.
//!
//! The runtime (`crun`, `runc`, or anything with the same command line) is
//! invoked as
//!
//! ```text
//! <runtime> --root=<state-dir> run --bundle=<bundle> <run-id>
//! ```
//!
//! The input payload is written to its stdin and everything it writes to
//! stdout is the function's output. Stderr is kept only for diagnostics.
//!
//! The child runs in its own process group. If the deadline passes, the
//! whole group is killed and reaped, then the runtime is asked to force-delete
//! the container so no sandbox outlives the run.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::runner::RunId;

/// Most stderr kept for error reports.
const MAX_STDERR: usize = 64 * 1024;

/// How long the force-delete after a timeout may take.
const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from invoking the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to create runtime state directory {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn runtime {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("runtime I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("runtime exited with {status}: {stderr}")]
    Exit {
        status: ExitStatus,
        stderr: String,
        /// Whatever the function wrote to stdout before failing.
        output: Vec<u8>,
    },

    #[error("runtime did not exit before the deadline")]
    Timeout,
}

/// Invokes one OCI runtime binary with one state directory.
#[derive(Debug, Clone)]
pub struct RuntimeInvoker {
    binary: PathBuf,
    root: PathBuf,
}

impl RuntimeInvoker {
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            root: root.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Create the runtime state directory with mode 0700.
    pub fn prepare(&self) -> Result<(), RuntimeError> {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

        let setup = |source| RuntimeError::Setup {
            path: self.root.clone(),
            source,
        };
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)
            .map_err(setup)?;
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700)).map_err(setup)?;
        Ok(())
    }

    /// Arguments for running `bundle` as container `run_id`.
    pub fn run_args(&self, bundle: &Path, run_id: &RunId) -> Vec<OsString> {
        vec![
            flag("--root=", &self.root),
            OsString::from("run"),
            flag("--bundle=", bundle),
            OsString::from(run_id.to_string()),
        ]
    }

    /// Run `bundle` with `input` on stdin and return its stdout.
    pub async fn run(
        &self,
        bundle: &Path,
        run_id: &RunId,
        input: &[u8],
        deadline: Instant,
    ) -> Result<Vec<u8>, RuntimeError> {
        debug!(binary = %self.binary.display(), bundle = %bundle.display(), run_id = %run_id, "Starting runtime");

        let mut child = Command::new(&self.binary)
            .args(self.run_args(bundle, run_id))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let write_input = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(input).await {
                // The function may exit without reading its input.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
            // stdin is dropped here, closing the pipe.
        };

        let outcome = tokio::time::timeout_at(deadline, async {
            tokio::join!(
                write_input,
                read_all(stdout, usize::MAX),
                read_all(stderr, MAX_STDERR),
                child.wait(),
            )
        })
        .await;

        let (written, output, diagnostics, status) = match outcome {
            Ok(results) => results,
            Err(_) => {
                self.terminate(&mut child, run_id).await;
                return Err(RuntimeError::Timeout);
            }
        };

        let status = status?;
        written?;
        let output = output?;
        let stderr = String::from_utf8_lossy(&diagnostics?).trim().to_string();

        if !status.success() {
            return Err(RuntimeError::Exit {
                status,
                stderr,
                output,
            });
        }

        info!(run_id = %run_id, output_bytes = output.len(), "Function exited");
        Ok(output)
    }

    /// Kill the runtime's process group, reap it, and force-delete the
    /// container.
    async fn terminate(&self, child: &mut Child, run_id: &RunId) {
        warn!(run_id = %run_id, "Deadline reached, killing runtime");

        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(error = %e, "killpg failed, killing child only");
            }
        }
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Runtime already gone");
        }

        let delete = Command::new(&self.binary)
            .arg(flag("--root=", &self.root))
            .arg("delete")
            .arg("--force")
            .arg(run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(DELETE_TIMEOUT, delete).await {
            Ok(Ok(status)) if status.success() => debug!(run_id = %run_id, "Container deleted"),
            Ok(Ok(status)) => debug!(run_id = %run_id, %status, "Runtime delete failed"),
            Ok(Err(e)) => warn!(run_id = %run_id, error = %e, "Failed to run runtime delete"),
            Err(_) => warn!(run_id = %run_id, "Runtime delete timed out"),
        }
    }
}

fn flag(name: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(name);
    arg.push(path);
    arg
}

/// Read a pipe to the end, keeping at most `limit` bytes. The pipe is always
/// drained so the child never blocks on a full buffer.
async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let Some(mut pipe) = pipe else {
        return Ok(out);
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        let room = limit.saturating_sub(out.len());
        out.extend_from_slice(&buf[..n.min(room)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// A stand-in runtime: a shell script that checks its arguments and then
    /// runs `body` for `run`, exiting 0 for anything else.
    fn fake_runtime(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-runtime");
        let script = format!(
            "#!/bin/sh\n\
             case \"$1\" in --root=*) ;; *) echo \"bad root: $1\" >&2; exit 64 ;; esac\n\
             [ \"$2\" = run ] || exit 0\n\
             case \"$3\" in --bundle=*) ;; *) echo \"bad bundle: $3\" >&2; exit 64 ;; esac\n\
             BUNDLE=\"${{3#--bundle=}}\"\n\
             {body}\n"
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn setup(body: &str) -> (tempfile::TempDir, RuntimeInvoker, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path(), body);
        let invoker = RuntimeInvoker::new(runtime, dir.path().join("state"));
        invoker.prepare().unwrap();
        let bundle = dir.path().join("bundle");
        fs::create_dir(&bundle).unwrap();
        (dir, invoker, bundle)
    }

    /// Whether `pid` exists and is not a zombie waiting to be reaped.
    fn running(pid: i32) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    fn soon(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn test_run_args() {
        let invoker = RuntimeInvoker::new("/usr/bin/crun", "/fnbox/runtime");
        let run_id = RunId::new();
        let args = invoker.run_args(Path::new("/fnbox/overlay/bundles/x"), &run_id);
        assert_eq!(
            args,
            vec![
                OsString::from("--root=/fnbox/runtime"),
                OsString::from("run"),
                OsString::from("--bundle=/fnbox/overlay/bundles/x"),
                OsString::from(run_id.to_string()),
            ]
        );
    }

    #[test]
    fn test_prepare_creates_private_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache").join("runtime");
        let invoker = RuntimeInvoker::new("crun", &root);
        invoker.prepare().unwrap();
        invoker.prepare().unwrap();

        let mode = fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_prepare_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();
        let invoker = RuntimeInvoker::new("crun", file.join("runtime"));
        assert!(matches!(invoker.prepare(), Err(RuntimeError::Setup { .. })));
    }

    #[tokio::test]
    async fn test_stdin_is_echoed_to_output() {
        let (_dir, invoker, bundle) = setup("cat");
        let output = invoker
            .run(&bundle, &RunId::new(), b"{\"hello\":1}", soon(10))
            .await
            .unwrap();
        assert_eq!(output, b"{\"hello\":1}");
    }

    #[tokio::test]
    async fn test_large_input_and_output() {
        let (_dir, invoker, bundle) = setup("cat");
        let input = vec![b'x'; 4 * 1024 * 1024];
        let output = invoker
            .run(&bundle, &RunId::new(), &input, soon(30))
            .await
            .unwrap();
        assert_eq!(output.len(), input.len());
    }

    #[tokio::test]
    async fn test_output_without_reading_input() {
        let (_dir, invoker, bundle) = setup("printf ignored-input");
        let input = vec![b'x'; 1024 * 1024];
        let output = invoker
            .run(&bundle, &RunId::new(), &input, soon(10))
            .await
            .unwrap();
        assert_eq!(output, b"ignored-input");
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_diagnostics() {
        let (_dir, invoker, bundle) = setup("printf partial; echo boom >&2; exit 3");
        let err = invoker
            .run(&bundle, &RunId::new(), b"", soon(10))
            .await
            .unwrap_err();
        match err {
            RuntimeError::Exit {
                status,
                stderr,
                output,
            } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "boom");
                assert_eq!(output, b"partial");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = RuntimeInvoker::new(dir.path().join("no-such-runtime"), dir.path());
        let err = invoker
            .run(dir.path(), &RunId::new(), b"", soon(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_process_group() {
        let (_dir, invoker, bundle) =
            setup("echo $$ > \"$BUNDLE/pid\"; sleep 60 & echo $! > \"$BUNDLE/sleeper\"; wait");
        let started = std::time::Instant::now();

        let err = invoker
            .run(&bundle, &RunId::new(), b"", Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(8));

        for name in ["pid", "sleeper"] {
            let pid: i32 = fs::read_to_string(bundle.join(name))
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            let mut alive = true;
            for _ in 0..50 {
                if !running(pid) {
                    alive = false;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert!(!alive, "{name} process {pid} still running");
        }
    }
}
