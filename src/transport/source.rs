use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Delivers raw newline-delimited instruction records.
#[async_trait]
pub trait InstructionSource: Send {
    /// Returns the next record, or `None` once the caller is done.
    async fn next_record(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Reads records from a continuous byte stream (the daemon's stdin).
pub struct StreamSource<R> {
    reader: R,
}

impl<R> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> InstructionSource for StreamSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut record = Vec::new();
        let n = self.reader.read_until(b'\n', &mut record).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

/// Reopens a mailbox path for every record, reads one line and closes it.
pub struct FifoSource {
    path: PathBuf,
}

impl FifoSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl InstructionSource for FifoSource {
    async fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        super::on_thread("mailbox-reader", &self.path, |path| {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut record = Vec::new();
            let n = reader.read_until(b'\n', &mut record)?;
            debug!("Read {n} bytes from {}", path.display());
            Ok((n > 0).then_some(record))
        })
        .await
    }
}

/// Moves record reading onto its own task.
///
/// The hand-off holds a single record, so a record that shows up while
/// an instruction is still running stays visible to the daemon loop,
/// which treats it as a protocol violation. The channel closes at end of
/// stream; a transport error is forwarded once and ends the task.
pub fn spawn_reader(mut source: Box<dyn InstructionSource>) -> mpsc::Receiver<io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            match source.next_record().await {
                Ok(Some(record)) => {
                    if tx.send(Ok(record)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Instruction stream ended");
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use std::io::Write;

    #[tokio::test]
    async fn test_stream_source_splits_lines() {
        let data: &[u8] = b"{\"a\":1}\n{\"b\":2}\nlast-without-newline";
        let mut source = StreamSource::new(tokio::io::BufReader::new(data));
        assert_eq!(source.next_record().await.unwrap().unwrap(), b"{\"a\":1}\n");
        assert_eq!(source.next_record().await.unwrap().unwrap(), b"{\"b\":2}\n");
        assert_eq!(
            source.next_record().await.unwrap().unwrap(),
            b"last-without-newline"
        );
        assert!(source.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_source_empty() {
        let data: &[u8] = b"";
        let mut source = StreamSource::new(tokio::io::BufReader::new(data));
        assert!(source.next_record().await.unwrap().is_none());
    }

    fn write_once(path: &std::path::Path, line: &'static str) -> std::thread::JoinHandle<()> {
        let path = path.to_path_buf();
        std::thread::spawn(move || {
            let mut f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            f.write_all(line.as_bytes()).unwrap();
        })
    }

    #[tokio::test]
    async fn test_fifo_source_reopens_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("command");
        nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o600)).unwrap();
        let mut source = FifoSource::new(path.clone());

        // The reader has closed its end before next_record returns, so each
        // writer below pairs with a fresh open.
        for line in ["{\"createNewUser\":true}\n", "{\"command\":[\"ls\"]}\n"] {
            let writer = write_once(&path, line);
            assert_eq!(source.next_record().await.unwrap().unwrap(), line.as_bytes());
            writer.join().unwrap();
        }

        // An empty open/close ends the stream
        let writer = write_once(&path, "");
        assert!(source.next_record().await.unwrap().is_none());
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_fifo_source_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FifoSource::new(dir.path().join("missing"));
        assert!(source.next_record().await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_reader_closes_at_end() {
        let data: &[u8] = b"one\ntwo\n";
        let mut rx = spawn_reader(Box::new(StreamSource::new(tokio::io::BufReader::new(data))));
        assert_eq!(rx.recv().await.unwrap().unwrap(), b"one\n");
        assert_eq!(rx.recv().await.unwrap().unwrap(), b"two\n");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_reader_forwards_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = spawn_reader(Box::new(FifoSource::new(dir.path().join("missing"))));
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }
}
