//! The mailbox directory: fixed named pipes shared with the caller.
use std::io;
use std::path::PathBuf;

use nix::sys::stat::Mode;
use std::os::unix::fs::PermissionsExt;
use tracing::{debug, info, warn};

pub const COMMAND: &str = "command";
pub const STDIN: &str = "stdin";
pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";
pub const EXIT_CODE: &str = "exitcode";
pub const ABORT: &str = "abort";

/// Every node created under the base directory, in creation order.
pub const NODES: [&str; 6] = [COMMAND, STDIN, STDOUT, STDERR, EXIT_CODE, ABORT];

#[derive(Debug, Clone)]
pub struct Mailbox {
    base_dir: PathBuf,
    mode: u32,
}

impl Mailbox {
    pub fn new(base_dir: PathBuf, mode: u32) -> Self {
        Self { base_dir, mode }
    }

    pub fn path(&self, node: &str) -> PathBuf {
        self.base_dir.join(node)
    }

    pub fn command_path(&self) -> PathBuf {
        self.path(COMMAND)
    }

    pub fn exit_code_path(&self) -> PathBuf {
        self.path(EXIT_CODE)
    }

    pub fn abort_path(&self) -> PathBuf {
        self.path(ABORT)
    }

    /// Clears stale nodes and creates a fresh set of FIFOs.
    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        self.teardown();
        for node in NODES {
            let path = self.path(node);
            nix::unistd::mkfifo(&path, Mode::from_bits_truncate(self.mode))
                .map_err(io::Error::from)?;
            // mkfifo is subject to the umask
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(self.mode))?;
            debug!("Created {} ({:o})", path.display(), self.mode);
        }
        info!("Mailbox ready in {}", self.base_dir.display());
        Ok(())
    }

    /// Removes every node. Missing nodes are fine, so this can run any
    /// number of times.
    pub fn teardown(&self) {
        for node in NODES {
            let path = self.path(node);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {e}", path.display()),
            }
        }
    }
}
