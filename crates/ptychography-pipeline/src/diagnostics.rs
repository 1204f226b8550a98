//! Append-only iteration history with a blocking, restartable stream.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ptychography_engines::IterationMetrics;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Diagnostics of one completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration index.
    pub iteration: usize,
    /// Wall time of this iteration's step (s).
    pub step_time_s: f64,
    /// Wall time of all iterations of the session so far (s).
    pub elapsed_s: f64,
    pub metrics: IterationMetrics,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("diagnostics sink is closed")]
    Closed,
    #[error("record for iteration {got} does not follow iteration {last}")]
    OutOfOrder { last: usize, got: usize },
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<IterationRecord>,
    closed: bool,
}

/// Records iterations in order; closed once the run is terminal.
#[derive(Debug, Default)]
pub struct DiagnosticsSink {
    inner: Mutex<Inner>,
    appended: Condvar,
}

impl DiagnosticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that continues a restored history.
    pub fn with_history(records: Vec<IterationRecord>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records,
                closed: false,
            }),
            appended: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, record: IterationRecord) -> Result<(), RecordError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RecordError::Closed);
        }
        if let Some(last) = inner.records.last() {
            if record.iteration <= last.iteration {
                return Err(RecordError::OutOfOrder {
                    last: last.iteration,
                    got: record.iteration,
                });
            }
        }
        inner.records.push(record);
        self.appended.notify_all();
        Ok(())
    }

    /// Mark the history complete; blocked streams drain and end.
    pub fn close(&self) {
        self.lock().closed = true;
        self.appended.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the history.
    pub fn records(&self) -> Vec<IterationRecord> {
        self.lock().records.clone()
    }

    pub fn latest(&self) -> Option<IterationRecord> {
        self.lock().records.last().cloned()
    }

    /// Stream from the first record.
    pub fn stream(self: &Arc<Self>) -> DiagnosticsStream {
        DiagnosticsStream {
            sink: Arc::clone(self),
            cursor: 0,
        }
    }

    fn wait_for(&self, cursor: usize, deadline: Option<Instant>) -> Option<IterationRecord> {
        let mut inner = self.lock();
        loop {
            if let Some(record) = inner.records.get(cursor) {
                return Some(record.clone());
            }
            if inner.closed {
                return None;
            }
            inner = match deadline {
                None => self
                    .appended
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.appended
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// Lazy iterator over a sink's records in iteration order.
///
/// `next` blocks while the sink is open and no further record exists yet;
/// once the sink is closed the stream ends after the last record.
#[derive(Debug, Clone)]
pub struct DiagnosticsStream {
    sink: Arc<DiagnosticsSink>,
    cursor: usize,
}

impl DiagnosticsStream {
    /// Next record if one is already available.
    pub fn poll_next(&mut self) -> Option<IterationRecord> {
        let record = self.sink.lock().records.get(self.cursor).cloned();
        if record.is_some() {
            self.cursor += 1;
        }
        record
    }

    /// Like `next`, but gives up after `timeout`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<IterationRecord> {
        let record = self.sink.wait_for(self.cursor, Some(Instant::now() + timeout));
        if record.is_some() {
            self.cursor += 1;
        }
        record
    }

    /// Rewind to the first record.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    /// Number of records consumed so far.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

impl Iterator for DiagnosticsStream {
    type Item = IterationRecord;

    fn next(&mut self) -> Option<IterationRecord> {
        let record = self.sink.wait_for(self.cursor, None);
        if record.is_some() {
            self.cursor += 1;
        }
        record
    }
}
