//! Opens the three stdio endpoints named by an instruction.
//!
//! Opening happens inside a privileged section: a native thread created
//! for one instruction that switches its filesystem gid to the
//! instruction's group, checks the switch took effect, opens stdin,
//! stdout and stderr in that order and then exits. The filesystem gid is
//! a per-thread credential, so the switch never leaks into the runtime's
//! worker threads and no thread is reused after being switched.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{setfsgid, Gid};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ExecError;
use crate::instruction::Instruction;

/// Open handles for one instruction. Dropping the value closes all three.
#[derive(Debug)]
pub struct StdioEndpoints {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

impl StdioEndpoints {
    /// Writes a single text line to the caller's stdout endpoint.
    pub fn write_stdout_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdout.write_all(format!("{line}\n").as_bytes())?;
        self.stdout.flush()
    }
}

#[derive(Debug, Clone)]
struct PipePaths {
    stdin: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
}

/// Opens stdio endpoints, optionally enforcing their permission bits.
#[derive(Debug, Clone, Default)]
pub struct PipeResolver {
    expected_mode: Option<u32>,
}

impl PipeResolver {
    pub fn new(expected_mode: Option<u32>) -> Self {
        Self { expected_mode }
    }

    /// Runs the privileged section for `instruction` and returns its handles.
    ///
    /// Opening a FIFO blocks until the caller opens the other end, so the
    /// returned future can stay pending for a long time. Dropping it leaves
    /// the thread blocked; that only happens when the daemon is exiting.
    pub async fn open(&self, instruction: &Instruction) -> Result<StdioEndpoints, ExecError> {
        let paths = PipePaths {
            stdin: instruction.stdin_pipe_path.clone(),
            stdout: instruction.stdout_pipe_path.clone(),
            stderr: instruction.stderr_pipe_path.clone(),
        };
        let gid = instruction.gid;
        let expected_mode = self.expected_mode;

        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("privileged-open".to_string())
            .spawn(move || {
                let _ = tx.send(open_privileged(gid, &paths, expected_mode));
            })
            .map_err(|e| ExecError::PrivilegedSection(format!("spawn: {e}")))?;

        rx.await.map_err(|_| {
            ExecError::PrivilegedSection("thread exited without a result".to_string())
        })?
    }
}

fn open_privileged(
    gid: u32,
    paths: &PipePaths,
    expected_mode: Option<u32>,
) -> Result<StdioEndpoints, ExecError> {
    switch_fsgid(gid)?;

    // Early returns drop (and close) whatever was already opened.
    let stdin = open_checked(&paths.stdin, OpenOptions::new().read(true), expected_mode)?;
    let stdout = open_checked(&paths.stdout, OpenOptions::new().write(true), expected_mode)?;
    let stderr = open_checked(&paths.stderr, OpenOptions::new().write(true), expected_mode)?;

    debug!("Opened stdio endpoints as fsgid {gid}");
    Ok(StdioEndpoints {
        stdin,
        stdout,
        stderr,
    })
}

fn switch_fsgid(gid: u32) -> Result<(), ExecError> {
    let requested = Gid::from_raw(gid);
    setfsgid(requested);
    // setfsgid never reports failure; an invalid id is refused and
    // returns the current value instead.
    let actual = setfsgid(Gid::from_raw(u32::MAX));
    if actual != requested {
        return Err(ExecError::CredentialSwitch {
            requested: gid,
            actual: actual.as_raw(),
        });
    }
    Ok(())
}

fn open_checked(
    path: &Path,
    options: &OpenOptions,
    expected_mode: Option<u32>,
) -> Result<File, ExecError> {
    let file = options.open(path).map_err(|source| ExecError::PipeOpen {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(expected) = expected_mode {
        verify_mode(&file, path, expected)?;
    }
    Ok(file)
}

/// Compares the permission bits of an open handle with `expected`.
///
/// The check runs on the handle rather than the path so a node swapped
/// after the open cannot pass in place of the one actually used.
pub fn verify_mode(file: &File, path: &Path, expected: u32) -> Result<(), ExecError> {
    let metadata = file.metadata().map_err(|source| ExecError::PipeOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let actual = metadata.permissions().mode() & 0o7777;
    if actual != expected & 0o7777 {
        return Err(ExecError::PermissionMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}
