//! Bridges one client message endpoint to one terminal consumer.
//!
//! The adapter runs two tasks. The inbound task reads client messages and
//! queues each as one stdin chunk; the outbound task forwards each queued
//! stdout/stderr chunk as one binary frame. Whichever side stops first
//! stops the other, and the endpoint is closed exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::fanout::{Consumer, ConsumerOutput, Delivery};

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Endpoint closed")]
    Closed,

    #[error("Endpoint I/O error: {0}")]
    Io(String),
}

/// A bidirectional message transport to one client (a WebSocket in
/// production).
#[async_trait]
pub trait MessageEndpoint: Send + Sync {
    /// Next message. `Ok(None)` on a clean close, `Err` on an unexpected one.
    async fn read_message(&self) -> Result<Option<Bytes>, EndpointError>;

    /// Send one binary frame.
    async fn write_frame(&self, data: &[u8]) -> Result<(), EndpointError>;

    /// Send a close frame and release the transport.
    async fn close(&self) -> Result<(), EndpointError>;
}

/// Closes an endpoint at most once.
struct EndpointCloser {
    endpoint: Arc<dyn MessageEndpoint>,
    closed: AtomicBool,
}

impl EndpointCloser {
    async fn close(&self, client_id: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.endpoint.close().await {
            debug!("Closing endpoint for client {} failed: {}", client_id, e);
        }
    }
}

pub struct TerminalClientAdapter {
    client_id: String,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl TerminalClientAdapter {
    /// Start pumping between `endpoint` and `consumer`.
    pub fn spawn(
        endpoint: Arc<dyn MessageEndpoint>,
        consumer: Arc<Consumer>,
        output: ConsumerOutput,
    ) -> Self {
        let client_id = consumer.id().to_string();
        let stop = CancellationToken::new();
        let closer = Arc::new(EndpointCloser {
            endpoint,
            closed: AtomicBool::new(false),
        });

        let inbound = tokio::spawn(inbound_pump(
            Arc::clone(&closer),
            consumer,
            stop.clone(),
        ));
        let outbound = tokio::spawn(outbound_pump(closer, output, client_id.clone(), stop));

        Self {
            client_id,
            inbound,
            outbound,
        }
    }

    /// Wait until both pumps have exited.
    pub async fn finished(self) {
        if let Err(e) = self.inbound.await {
            warn!("Inbound pump for client {} panicked: {}", self.client_id, e);
        }
        if let Err(e) = self.outbound.await {
            warn!("Outbound pump for client {} panicked: {}", self.client_id, e);
        }
    }
}

/// A run of stdin messages dropped on a full queue. Only the first drop of
/// a run is logged.
#[derive(Debug, Default)]
struct DropRun {
    dropped: u64,
}

impl DropRun {
    /// Count one drop. True for the first drop of a run.
    fn dropped(&mut self) -> bool {
        self.dropped += 1;
        self.dropped == 1
    }

    /// End the run and return how many messages it dropped.
    fn end(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

async fn inbound_pump(closer: Arc<EndpointCloser>, consumer: Arc<Consumer>, stop: CancellationToken) {
    let client_id = consumer.id().to_string();
    let mut drops = DropRun::default();

    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            message = closer.endpoint.read_message() => message,
        };

        match message {
            Ok(Some(data)) => match consumer.push_input(data) {
                Delivery::Delivered => {
                    let dropped = drops.end();
                    if dropped > 0 {
                        debug!(
                            "Stdin queue for client {} draining again, {} message(s) dropped",
                            client_id, dropped
                        );
                    }
                }
                Delivery::Dropped => {
                    if drops.dropped() {
                        warn!(
                            "Stdin queue full for client {}, dropping input until it drains",
                            client_id
                        );
                    }
                }
                Delivery::Closed => break,
            },
            Ok(None) => {
                debug!("Client {} closed its endpoint", client_id);
                break;
            }
            Err(e) => {
                warn!("Client {} endpoint closed unexpectedly: {}", client_id, e);
                break;
            }
        }
    }

    stop.cancel();
    closer.close(&client_id).await;
}

async fn outbound_pump(
    closer: Arc<EndpointCloser>,
    mut output: ConsumerOutput,
    client_id: String,
    stop: CancellationToken,
) {
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let chunk = tokio::select! {
            _ = stop.cancelled() => break,
            chunk = output.stdout.recv(), if stdout_open => match chunk {
                Some(chunk) => chunk,
                None => {
                    stdout_open = false;
                    continue;
                }
            },
            chunk = output.stderr.recv(), if stderr_open => match chunk {
                Some(chunk) => chunk,
                None => {
                    stderr_open = false;
                    continue;
                }
            },
        };

        if let Err(e) = closer.endpoint.write_frame(&chunk).await {
            debug!("Write to client {} failed: {}", client_id, e);
            break;
        }
    }

    if !stdout_open && !stderr_open {
        debug!("Output queues closed for client {}", client_id);
    }

    stop.cancel();
    closer.close(&client_id).await;
}
