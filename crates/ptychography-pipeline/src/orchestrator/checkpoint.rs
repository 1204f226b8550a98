//! Background checkpoint writer.

use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::persistence::SessionStore;
use crate::session::{LogEntry, ReconstructionSession};

/// A checkpoint that reached the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub iteration: usize,
    pub location: PathBuf,
}

/// Saves submitted sessions in order on its own thread.
pub(crate) struct CheckpointWriter {
    sender: Option<Sender<ReconstructionSession>>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointWriter {
    /// Failures are logged and appended to `log`; successes to `saved`.
    pub fn spawn(
        store: Arc<dyn SessionStore>,
        saved: Arc<Mutex<Vec<CheckpointRecord>>>,
        log: Arc<Mutex<Vec<LogEntry>>>,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<ReconstructionSession>();
        let handle = thread::Builder::new()
            .name("ptycho-checkpoint".into())
            .spawn(move || {
                for session in receiver {
                    let iteration = session.iteration();
                    match store.save(&session) {
                        Ok(location) => {
                            info!("checkpoint {iteration} written to {}", location.display());
                            saved
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(CheckpointRecord {
                                    iteration,
                                    location,
                                });
                        }
                        Err(e) => {
                            warn!("checkpoint at iteration {iteration} failed: {e}");
                            log.lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(LogEntry::failure(
                                    "checkpoint",
                                    format!("iteration {iteration}: {e}"),
                                ));
                        }
                    }
                }
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    pub fn submit(&self, session: ReconstructionSession) {
        if let Some(sender) = &self.sender {
            if sender.send(session).is_err() {
                warn!("checkpoint writer has stopped; checkpoint dropped");
            }
        }
    }

    /// Wait for every submitted checkpoint to be written.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("checkpoint writer panicked");
            }
        }
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
