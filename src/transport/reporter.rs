use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::executor::StatusByte;

/// Emits one status byte per executed instruction.
#[async_trait]
pub trait ResultReporter: Send {
    async fn report(&mut self, status: StatusByte) -> io::Result<()>;
}

/// Writes status bytes to a stream (the daemon's stdout).
pub struct StreamReporter<W> {
    writer: W,
}

impl<W> StreamReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> ResultReporter for StreamReporter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn report(&mut self, status: StatusByte) -> io::Result<()> {
        self.writer.write_all(&[status.as_byte()]).await?;
        self.writer.flush().await
    }
}

/// Opens the exit-code relay for every byte and closes it afterwards.
pub struct FifoReporter {
    path: PathBuf,
}

impl FifoReporter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ResultReporter for FifoReporter {
    async fn report(&mut self, status: StatusByte) -> io::Result<()> {
        let byte = status.as_byte();
        super::on_thread("exit-code-writer", &self.path, move |path| {
            let mut relay = OpenOptions::new().write(true).open(path)?;
            relay.write_all(&[byte])
        })
        .await
    }
}
