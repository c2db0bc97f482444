//! Abort and shutdown watchers.
//!
//! Each watcher sits on its own native thread blocked opening a signal
//! pipe. A writer opening the pipe is the signal; no payload is needed.
//! The watchers fire at most once and never stop the daemon themselves:
//! the daemon loop races them at every point where it waits.
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::ControlConfig;

/// A one-shot event that, once fired, stays fired.
///
/// If the sending side goes away without firing, the signal never fires.
#[derive(Debug)]
pub struct Signal {
    rx: Option<oneshot::Receiver<()>>,
    latched: bool,
}

impl Signal {
    pub fn channel() -> (oneshot::Sender<()>, Signal) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Signal {
                rx: Some(rx),
                latched: false,
            },
        )
    }

    #[cfg(test)]
    pub fn never() -> Signal {
        Signal {
            rx: None,
            latched: false,
        }
    }

    /// Resolves once the signal has fired. Cancel-safe.
    pub async fn fired(&mut self) {
        if self.latched {
            return;
        }
        if let Some(rx) = self.rx.as_mut() {
            let received = rx.await.is_ok();
            self.rx = None;
            if received {
                self.latched = true;
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

/// The two control-plane signals the daemon races against.
#[derive(Debug)]
pub struct ControlPlane {
    pub abort: Signal,
    pub shutdown: Signal,
}

impl ControlPlane {
    /// Starts both watchers. `abort_primary` replaces the configured abort
    /// pipe as the first path tried (the configured one becomes the fallback).
    pub fn start(config: &ControlConfig, abort_primary: Option<PathBuf>) -> Self {
        let (abort_path, abort_fallback) = match abort_primary {
            Some(primary) => (primary, config.abort_pipe.clone()),
            None => (config.abort_pipe.clone(), config.fallback_abort_pipe.clone()),
        };
        Self {
            abort: watch("abort", abort_path, abort_fallback),
            shutdown: watch(
                "shutdown",
                config.shutdown_pipe.clone(),
                config.fallback_shutdown_pipe.clone(),
            ),
        }
    }
}

/// Spawns a watcher thread for one signal pipe.
pub fn watch(name: &'static str, primary: PathBuf, fallback: PathBuf) -> Signal {
    let (tx, signal) = Signal::channel();
    let spawned = std::thread::Builder::new()
        .name(format!("{name}-watcher"))
        .spawn(move || match open_either(&primary, &fallback) {
            Ok(path) => {
                info!("{name} signal received on {}", path.display());
                let _ = tx.send(());
            }
            Err(e) => {
                warn!(
                    "{name} watcher disabled, cannot open {} or {}: {e}",
                    primary.display(),
                    fallback.display()
                );
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start {name} watcher: {e}");
    }
    signal
}

// Opening a FIFO for reading blocks until a writer shows up.
fn open_either(primary: &Path, fallback: &Path) -> io::Result<PathBuf> {
    let path = match File::open(primary) {
        Ok(_) => primary,
        Err(_) => {
            File::open(fallback)?;
            fallback
        }
    };
    Ok(path.to_path_buf())
}
