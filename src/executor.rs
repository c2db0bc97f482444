use std::io;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::control::Signal;
use crate::identity::Identity;
use crate::pipes::StdioEndpoints;

/// The single byte reported to the caller for each executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusByte {
    Success = 0,
    Failure = 1,
    /// Reaping failed but the child reported a successful exit
    AnomalousSuccess = 2,
}

impl StatusByte {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished(StatusByte),
    /// The abort signal fired first; the child is left running.
    Aborted,
}

/// Spawns `argv` as `identity` bound to `stdio`.
///
/// The parent's copies of the three handles are closed before this
/// returns, whether or not the spawn succeeded.
pub fn spawn(argv: &[String], identity: Identity, stdio: StdioEndpoints) -> io::Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

    let StdioEndpoints {
        stdin,
        stdout,
        stderr,
    } = stdio;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        // The standard library clears supplementary groups when a
        // privileged parent sets a uid without an explicit group list.
        .uid(identity.uid)
        .gid(identity.gid)
        .kill_on_drop(false);

    command.spawn()
}

/// Runs one instruction to completion, or until `abort` fires.
pub async fn execute(
    argv: &[String],
    identity: Identity,
    stdio: StdioEndpoints,
    abort: &mut Signal,
) -> Completion {
    info!(
        "Executing {:?} as uid={} gid={}",
        argv, identity.uid, identity.gid
    );

    let mut child = match spawn(argv, identity, stdio) {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to spawn {}: {e}", argv.first().map(String::as_str).unwrap_or(""));
            return Completion::Finished(StatusByte::Failure);
        }
    };

    let waiter = tokio::spawn(async move {
        let waited = child.wait().await;
        let reported = child.try_wait();
        (waited, reported)
    });

    tokio::select! {
        joined = waiter => match joined {
            Ok((waited, reported)) => Completion::Finished(status_byte(waited, reported)),
            Err(e) => {
                warn!("Wait task failed: {e}");
                Completion::Finished(StatusByte::Failure)
            }
        },
        _ = abort.fired() => Completion::Aborted,
    }
}

/// Maps the wait outcome and the child's own reported state to a status byte.
pub fn status_byte(
    waited: io::Result<ExitStatus>,
    reported: io::Result<Option<ExitStatus>>,
) -> StatusByte {
    match waited {
        Ok(status) if status.success() => StatusByte::Success,
        Ok(status) => {
            debug!("Runner exited with {status}");
            StatusByte::Failure
        }
        Err(e) => match reported {
            Ok(Some(status)) if status.success() => {
                warn!("Wait failed ({e}) but the child reported success");
                StatusByte::AnomalousSuccess
            }
            _ => {
                warn!("Wait failed: {e}");
                StatusByte::Failure
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn own_identity() -> Identity {
        Identity {
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
        }
    }

    fn stdio_in(dir: &Path) -> StdioEndpoints {
        for name in ["in", "out", "err"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        StdioEndpoints {
            stdin: std::fs::File::open(dir.join("in")).unwrap(),
            stdout: std::fs::OpenOptions::new()
                .write(true)
                .open(dir.join("out"))
                .unwrap(),
            stderr: std::fs::OpenOptions::new()
                .write(true)
                .open(dir.join("err"))
                .unwrap(),
        }
    }

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_status_byte_values() {
        assert_eq!(StatusByte::Success.as_byte(), 0);
        assert_eq!(StatusByte::Failure.as_byte(), 1);
        assert_eq!(StatusByte::AnomalousSuccess.as_byte(), 2);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_byte(Ok(exited(0)), Ok(None)), StatusByte::Success);
        assert_eq!(status_byte(Ok(exited(3)), Ok(None)), StatusByte::Failure);
        assert_eq!(
            status_byte(Err(io::Error::other("reap")), Ok(Some(exited(0)))),
            StatusByte::AnomalousSuccess
        );
        assert_eq!(
            status_byte(Err(io::Error::other("reap")), Ok(Some(exited(1)))),
            StatusByte::Failure
        );
        assert_eq!(
            status_byte(Err(io::Error::other("reap")), Ok(None)),
            StatusByte::Failure
        );
        assert_eq!(
            status_byte(Err(io::Error::other("reap")), Err(io::Error::other("gone"))),
            StatusByte::Failure
        );
    }

    #[tokio::test]
    async fn test_execute_success_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let stdio = stdio_in(dir.path());
        let mut abort = Signal::never();
        let completion = execute(
            &argv(&["/bin/sh", "-c", "echo out; echo err >&2"]),
            own_identity(),
            stdio,
            &mut abort,
        )
        .await;
        assert_eq!(completion, Completion::Finished(StatusByte::Success));
        assert_eq!(std::fs::read_to_string(dir.path().join("out")).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("err")).unwrap(), "err\n");
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut abort = Signal::never();
        let completion = execute(
            &argv(&["/bin/sh", "-c", "exit 7"]),
            own_identity(),
            stdio_in(dir.path()),
            &mut abort,
        )
        .await;
        assert_eq!(completion, Completion::Finished(StatusByte::Failure));
    }

    #[tokio::test]
    async fn test_execute_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut abort = Signal::never();
        let completion = execute(
            &argv(&["/nonexistent/runner", "-e", "trace=net"]),
            own_identity(),
            stdio_in(dir.path()),
            &mut abort,
        )
        .await;
        assert_eq!(completion, Completion::Finished(StatusByte::Failure));
    }

    #[tokio::test]
    async fn test_execute_empty_argv() {
        let dir = tempfile::tempdir().unwrap();
        let mut abort = Signal::never();
        let completion = execute(&[], own_identity(), stdio_in(dir.path()), &mut abort).await;
        assert_eq!(completion, Completion::Finished(StatusByte::Failure));
    }

    #[tokio::test]
    async fn test_abort_preempts_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut abort) = Signal::channel();
        tx.send(()).unwrap();
        let completion = execute(
            &argv(&["/bin/sh", "-c", "sleep 30"]),
            own_identity(),
            stdio_in(dir.path()),
            &mut abort,
        )
        .await;
        assert_eq!(completion, Completion::Aborted);
    }
}
