pub mod mailbox;
pub mod reporter;
pub mod source;

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;

use crate::config::SourceConfig;
use mailbox::Mailbox;
use reporter::{FifoReporter, ResultReporter, StreamReporter};
use source::{FifoSource, InstructionSource, StreamSource};

/// Where instructions come from and where status bytes go.
pub struct Transport {
    pub source: Box<dyn InstructionSource>,
    pub reporter: Box<dyn ResultReporter>,
    /// Present when the transport created filesystem nodes that must be
    /// removed on abort
    pub mailbox: Option<Mailbox>,
}

impl Transport {
    /// Primary abort pipe contributed by the transport, if any.
    pub fn abort_pipe(&self) -> Option<PathBuf> {
        self.mailbox.as_ref().map(Mailbox::abort_path)
    }
}

/// Sets up the transport selected in config.
/// Every variant yields the same source/reporter pair.
pub fn open(config: &SourceConfig) -> io::Result<Transport> {
    match config {
        SourceConfig::Stream => Ok(Transport {
            source: Box::new(StreamSource::new(tokio::io::BufReader::new(tokio::io::stdin()))),
            reporter: Box::new(StreamReporter::new(tokio::io::stdout())),
            mailbox: None,
        }),
        SourceConfig::Fifo { path } => Ok(Transport {
            source: Box::new(FifoSource::new(path.clone())),
            reporter: Box::new(StreamReporter::new(tokio::io::stdout())),
            mailbox: None,
        }),
        SourceConfig::Mailbox { base_dir, mode } => {
            let mailbox = Mailbox::new(base_dir.clone(), *mode);
            mailbox.create()?;
            Ok(Transport {
                source: Box::new(FifoSource::new(mailbox.command_path())),
                reporter: Box::new(FifoReporter::new(mailbox.exit_code_path())),
                mailbox: Some(mailbox),
            })
        }
    }
}

/// Runs a blocking filesystem operation on a dedicated native thread.
///
/// FIFO opens can block indefinitely. A detached thread keeps them from
/// pinning the runtime's blocking pool when the daemon exits.
pub(crate) async fn on_thread<T, F>(name: &str, path: &Path, op: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce(PathBuf) -> io::Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let path = path.to_path_buf();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(op(path));
        })?;
    rx.await
        .map_err(|_| io::Error::other(format!("{name} thread exited without a result")))?
}
