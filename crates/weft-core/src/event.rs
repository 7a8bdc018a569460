use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::types::{RunEvent, RunId, TraceEntry};

/// Fan-out of trace entries from running workflows.
///
/// Every entry a run records is published here tagged with its [`RunId`].
/// Subscribers either watch everything or follow one run until it finishes.
/// A slow subscriber loses the oldest entries instead of blocking the run.
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// `capacity` is how many entries a subscriber may fall behind by.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish one entry of `run_id`. Returns how many subscribers got it.
    pub fn publish(&self, run_id: &RunId, entry: TraceEntry) -> usize {
        self.tx
            .send(RunEvent {
                run_id: run_id.clone(),
                entry,
            })
            .unwrap_or(0)
    }

    /// Every entry of every run published from now on.
    pub fn subscribe(&self) -> RunSubscription {
        RunSubscription {
            rx: self.tx.subscribe(),
            run_id: None,
            finished: false,
            missed: 0,
        }
    }

    /// Entries of one run, ending after its `run_finished` entry.
    pub fn follow(&self, run_id: RunId) -> RunSubscription {
        RunSubscription {
            run_id: Some(run_id),
            ..self.subscribe()
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A subscriber's view of the bus. See [`EventBus::subscribe`] and
/// [`EventBus::follow`].
pub struct RunSubscription {
    rx: broadcast::Receiver<RunEvent>,
    run_id: Option<RunId>,
    finished: bool,
    missed: u64,
}

impl RunSubscription {
    /// Wait for the next entry. `None` once the followed run has finished or
    /// every publisher is gone.
    pub async fn next(&mut self) -> Option<RunEvent> {
        while !self.finished {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(n)) => self.missed += n,
                Err(RecvError::Closed) => return None,
            }
        }
        None
    }

    /// Like [`next`](Self::next) but only returns what is already buffered.
    pub fn try_next(&mut self) -> Option<RunEvent> {
        while !self.finished {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(n)) => self.missed += n,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
        None
    }

    /// Entries dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.run_id.as_ref()
    }

    fn accept(&mut self, event: RunEvent) -> Option<RunEvent> {
        let Some(run_id) = &self.run_id else {
            return Some(event);
        };
        if event.run_id != *run_id {
            return None;
        }
        self.finished = event.is_finished();
        Some(event)
    }
}
