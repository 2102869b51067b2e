//! In-process publish/subscribe between one terminal and its clients.
//!
//! # Architecture
//!
//! - [`Publisher`]: owned by exactly one terminal; maps consumer id to
//!   [`Consumer`] and fans output chunks out to them.
//! - [`Consumer`]: one client attachment. Holds three bounded queues:
//!   stdin-to-remote, stdout-from-remote and stderr-from-remote. The
//!   receiving ends of the output queues ([`ConsumerOutput`]) belong to the
//!   client adapter, whose outbound task is the single worker draining them.
//!
//! Delivery into output queues never blocks: a full queue drops the chunk
//! for that consumer only, and a closed queue is skipped. One slow client
//! therefore cannot stall the terminal's read loop or other clients, and
//! each consumer still sees chunks in emission order.
//!
//! The stdin queue is drained by at most one task at a time. The drain's
//! stop token lives here so attaching or granting write twice never starts
//! a second drain, and a stopped drain can be started again later.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Which remote stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Outcome of a non-blocking delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue full; the chunk was discarded for this consumer.
    Dropped,
    /// Consumer shut down.
    Closed,
}

/// Receiving ends of a consumer's output queues.
pub struct ConsumerOutput {
    pub stdout: mpsc::Receiver<Bytes>,
    pub stderr: mpsc::Receiver<Bytes>,
}

/// Handle to a running input drain.
pub(crate) struct DrainTicket {
    pub generation: u64,
    pub stop: CancellationToken,
}

pub struct Consumer {
    id: String,
    stdin_tx: mpsc::Sender<Bytes>,
    stdin_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    stdout_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    stderr_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    drain: Mutex<Option<(u64, CancellationToken)>>,
    drain_generation: AtomicU64,
    closed: AtomicBool,
}

impl Consumer {
    /// Create a consumer whose queues each hold `capacity` messages.
    pub fn new(id: impl Into<String>, capacity: usize) -> (Arc<Self>, ConsumerOutput) {
        let capacity = capacity.max(1);
        let (stdin_tx, stdin_rx) = mpsc::channel(capacity);
        let (stdout_tx, stdout_rx) = mpsc::channel(capacity);
        let (stderr_tx, stderr_rx) = mpsc::channel(capacity);

        let consumer = Arc::new(Self {
            id: id.into(),
            stdin_tx,
            stdin_rx: tokio::sync::Mutex::new(stdin_rx),
            stdout_tx: Mutex::new(Some(stdout_tx)),
            stderr_tx: Mutex::new(Some(stderr_tx)),
            drain: Mutex::new(None),
            drain_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        (
            consumer,
            ConsumerOutput {
                stdout: stdout_rx,
                stderr: stderr_rx,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a client message for the remote stdin.
    pub fn push_input(&self, message: Bytes) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }
        match self.stdin_tx.try_send(message) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queue a chunk of remote output for the client.
    pub fn deliver(&self, stream: OutputStream, chunk: &Bytes) -> Delivery {
        let slot = match stream {
            OutputStream::Stdout => &self.stdout_tx,
            OutputStream::Stderr => &self.stderr_tx,
        };

        let sender = slot.lock().clone();
        match sender {
            None => Delivery::Closed,
            Some(tx) => match tx.try_send(chunk.clone()) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Dropped,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }

    /// Claim the right to run the input drain.
    ///
    /// Returns `None` while another drain is registered. The stop token is a
    /// child of `parent`, so cancelling the terminal stops every drain.
    pub(crate) fn begin_drain(&self, parent: &CancellationToken) -> Option<DrainTicket> {
        if self.is_closed() {
            return None;
        }

        let mut drain = self.drain.lock();
        if drain.is_some() {
            return None;
        }

        let generation = self.drain_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = parent.child_token();
        *drain = Some((generation, stop.clone()));
        Some(DrainTicket { generation, stop })
    }

    /// Signal the running drain to stop. Returns true if one was running.
    pub(crate) fn stop_drain(&self) -> bool {
        match self.drain.lock().take() {
            Some((_, stop)) => {
                stop.cancel();
                true
            }
            None => false,
        }
    }

    /// Called by a drain on exit; clears the slot if it still belongs to it.
    pub(crate) fn drain_finished(&self, generation: u64) {
        let mut drain = self.drain.lock();
        if matches!(drain.as_ref(), Some((current, _)) if *current == generation) {
            *drain = None;
        }
    }

    pub fn is_draining(&self) -> bool {
        self.drain.lock().is_some()
    }

    /// Exclusive access to the stdin queue for the active drain.
    pub(crate) fn stdin(&self) -> &tokio::sync::Mutex<mpsc::Receiver<Bytes>> {
        &self.stdin_rx
    }

    /// Stop input, close the output queues. Returns true on the first call.
    ///
    /// Chunks already queued are still delivered; the adapter sees the
    /// queues close after them.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stop_drain();
        self.stdout_tx.lock().take();
        self.stderr_tx.lock().take();
        true
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("draining", &self.is_draining())
            .finish()
    }
}

/// Fan-out hub owned by one terminal.
#[derive(Default)]
pub struct Publisher {
    consumers: DashMap<String, Arc<Consumer>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer, returning any consumer it displaced.
    pub fn add_consumer(&self, consumer: Arc<Consumer>) -> Option<Arc<Consumer>> {
        self.consumers.insert(consumer.id().to_string(), consumer)
    }

    pub fn remove_consumer(&self, consumer_id: &str) -> Option<Arc<Consumer>> {
        self.consumers.remove(consumer_id).map(|(_, c)| c)
    }

    /// Remove `consumer` only if it is still the one registered under its id.
    pub fn remove_if_current(&self, consumer: &Arc<Consumer>) -> bool {
        self.consumers
            .remove_if(consumer.id(), |_, current| Arc::ptr_eq(current, consumer))
            .is_some()
    }

    pub fn get(&self, consumer_id: &str) -> Option<Arc<Consumer>> {
        self.consumers.get(consumer_id).map(|c| Arc::clone(c.value()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.consumers.iter().map(|c| c.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Deliver `chunk` to every consumer whose id passes `allowed`.
    ///
    /// Returns the ids whose queue was full.
    pub fn publish(
        &self,
        stream: OutputStream,
        chunk: &Bytes,
        allowed: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let targets: Vec<Arc<Consumer>> = self
            .consumers
            .iter()
            .filter(|c| allowed(c.key()))
            .map(|c| Arc::clone(c.value()))
            .collect();

        let mut dropped = Vec::new();
        for consumer in targets {
            if consumer.deliver(stream, chunk) == Delivery::Dropped {
                dropped.push(consumer.id().to_string());
            }
        }
        dropped
    }

    /// Remove and return every consumer.
    pub fn drain(&self) -> Vec<Arc<Consumer>> {
        let ids: Vec<String> = self.consumers.iter().map(|c| c.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove_consumer(&id))
            .collect()
    }
}
