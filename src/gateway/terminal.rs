//! A shared interactive PTY session with per-client permissions.
//!
//! ## Data flow
//!
//! ```text
//!   remote stdout ──pump──┐                      ┌──> consumer A queue ──> adapter A
//!                         ├──> Publisher::publish ┤
//!   remote stderr ──pump──┘   (readers only)     └──> consumer B queue ──> adapter B
//!
//!   consumer A stdin queue ──drain (writers only)──> PtyControl::write
//! ```
//!
//! The creating client is always both a reader and a writer. Other clients
//! must be granted with [`Terminal::allow`] before they can attach. Revoking
//! write stops the client's drain and the drain re-checks the write set for
//! every message, so no stdin message is forwarded after a revoke returns.
//!
//! Teardown runs once: it stops both pumps and every drain, shuts down all
//! consumers (closing their endpoints), closes the PTY and unregisters the
//! sub-session from the parent connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::adapter::{MessageEndpoint, TerminalClientAdapter};
use super::connection::ServerConnection;
use super::error::{GatewayError, GatewayResult};
use super::fanout::{Consumer, DrainTicket, OutputStream, Publisher};
use super::transport::{BoxedReader, PtyControl};
use super::types::{Dimensions, TerminalInfo};

/// Smallest read buffer a pump uses, whatever the terminal size.
pub const MIN_READ_CHUNK: usize = 64;

/// Read buffer size for a terminal of `dims`.
pub fn read_chunk_size(dims: Dimensions) -> usize {
    (dims.rows as usize)
        .saturating_mul(dims.cols as usize)
        .max(MIN_READ_CHUNK)
}

#[derive(Debug, Default, Clone)]
struct Permissions {
    readers: HashSet<String>,
    writers: HashSet<String>,
}

impl Permissions {
    fn can_read(&self, client_id: &str) -> bool {
        self.readers.contains(client_id)
    }

    fn can_write(&self, client_id: &str) -> bool {
        self.writers.contains(client_id)
    }

    fn sorted(set: &HashSet<String>) -> Vec<String> {
        let mut ids: Vec<String> = set.iter().cloned().collect();
        ids.sort();
        ids
    }
}

pub struct Terminal {
    id: String,
    connection: Arc<ServerConnection>,
    dims: Mutex<Dimensions>,
    chunk_size: usize,
    queue_capacity: usize,
    permissions: RwLock<Permissions>,
    publisher: Publisher,
    control: Arc<dyn PtyControl>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Terminal {
    /// Open a PTY on `connection` and start the output pumps.
    ///
    /// `id` is both the terminal id and the creating client's id.
    pub async fn open(
        id: impl Into<String>,
        connection: Arc<ServerConnection>,
        dims: Dimensions,
        queue_capacity: usize,
    ) -> GatewayResult<Arc<Self>> {
        let id = id.into();
        let streams = connection.open_terminal_session(&id, dims).await?;

        let mut permissions = Permissions::default();
        permissions.readers.insert(id.clone());
        permissions.writers.insert(id.clone());

        let terminal = Arc::new(Self {
            id,
            connection,
            dims: Mutex::new(dims),
            chunk_size: read_chunk_size(dims),
            queue_capacity,
            permissions: RwLock::new(permissions),
            publisher: Publisher::new(),
            control: streams.control,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(Arc::clone(&terminal).pump(streams.stdout, OutputStream::Stdout));
        tokio::spawn(Arc::clone(&terminal).pump(streams.stderr, OutputStream::Stderr));

        info!(
            "Terminal {} opened on {} ({}x{})",
            terminal.id,
            terminal.connection.key(),
            dims.cols,
            dims.rows
        );

        Ok(terminal)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }

    pub fn dimensions(&self) -> Dimensions {
        *self.dims.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fires when the terminal has been torn down.
    pub fn closed(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether `client_id` may attach.
    pub fn is_allowed(&self, client_id: &str) -> bool {
        self.permissions.read().can_read(client_id)
    }

    pub fn can_write(&self, client_id: &str) -> bool {
        self.permissions.read().can_write(client_id)
    }

    /// Grant read access, and grant or revoke write access.
    ///
    /// The creator keeps write access whatever `can_write` says.
    pub fn allow(self: &Arc<Self>, client_id: &str, can_write: bool) {
        let can_write = can_write || client_id == self.id;

        let was_writer = {
            let mut permissions = self.permissions.write();
            let was_writer = permissions.can_write(client_id);
            permissions.readers.insert(client_id.to_string());
            if can_write {
                permissions.writers.insert(client_id.to_string());
            } else {
                permissions.writers.remove(client_id);
            }
            was_writer
        };

        debug!(
            "Terminal {}: client {} allowed (write: {})",
            self.id, client_id, can_write
        );

        if let Some(consumer) = self.publisher.get(client_id) {
            if can_write {
                self.start_drain(&consumer);
            } else if was_writer {
                consumer.stop_drain();
            }
        }
    }

    /// Register a consumer. Refused when the terminal is closed or the
    /// client is not allowed.
    ///
    /// A consumer already registered under the same id is shut down.
    pub fn add_consumer(self: &Arc<Self>, consumer: Arc<Consumer>) -> bool {
        if self.is_closed() || !self.is_allowed(consumer.id()) {
            return false;
        }

        if let Some(previous) = self.publisher.add_consumer(Arc::clone(&consumer)) {
            debug!(
                "Terminal {}: client {} re-attached, closing previous attachment",
                self.id,
                consumer.id()
            );
            previous.shutdown();
        }

        if self.can_write(consumer.id()) {
            self.start_drain(&consumer);
        }

        // Teardown may have drained the publisher before the insert above
        if self.is_closed() {
            consumer.shutdown();
        }

        true
    }

    /// Unregister `consumer` if it is still the current attachment for its id.
    pub fn remove_consumer(&self, consumer: &Arc<Consumer>) {
        if self.publisher.remove_if_current(consumer) {
            debug!("Terminal {}: client {} detached", self.id, consumer.id());
        }
        consumer.shutdown();
    }

    /// Attach a client endpoint as consumer `client_id`.
    pub fn attach(
        self: &Arc<Self>,
        client_id: &str,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<()> {
        if self.is_closed() {
            return Err(GatewayError::UnknownKey(self.id.clone()));
        }

        let (consumer, output) = Consumer::new(client_id, self.queue_capacity);
        if !self.add_consumer(Arc::clone(&consumer)) {
            return Err(GatewayError::PermissionDenied {
                terminal: self.id.clone(),
                client: client_id.to_string(),
            });
        }

        let adapter = TerminalClientAdapter::spawn(endpoint, Arc::clone(&consumer), output);
        let terminal = Arc::clone(self);
        tokio::spawn(async move {
            adapter.finished().await;
            terminal.remove_consumer(&consumer);
        });

        Ok(())
    }

    /// Store the new size and issue a window change.
    pub async fn resize(&self, dims: Dimensions) -> GatewayResult<()> {
        if self.is_closed() {
            return Err(GatewayError::UnknownKey(self.id.clone()));
        }
        *self.dims.lock() = dims;
        self.control.window_change(dims).await
    }

    /// Tear the terminal down. Idempotent.
    pub async fn close(&self) {
        self.teardown().await;
    }

    pub fn info(&self) -> TerminalInfo {
        let permissions = self.permissions.read();
        TerminalInfo {
            id: self.id.clone(),
            connection_key: self.connection.key().to_string(),
            dimensions: self.dimensions(),
            consumers: self.publisher.ids(),
            readers: Permissions::sorted(&permissions.readers),
            writers: Permissions::sorted(&permissions.writers),
        }
    }

    fn start_drain(self: &Arc<Self>, consumer: &Arc<Consumer>) {
        if let Some(ticket) = consumer.begin_drain(&self.shutdown) {
            tokio::spawn(Arc::clone(self).drain(Arc::clone(consumer), ticket));
        }
    }

    /// Forward one consumer's stdin queue to the PTY while it may write.
    async fn drain(self: Arc<Self>, consumer: Arc<Consumer>, ticket: DrainTicket) {
        let DrainTicket { generation, stop } = ticket;

        // A stopped predecessor may still hold the queue for a moment
        let mut stdin = tokio::select! {
            _ = stop.cancelled() => {
                consumer.drain_finished(generation);
                return;
            }
            stdin = consumer.stdin().lock() => stdin,
        };

        // Input typed while the client could not write is not replayed
        let mut discarded = 0usize;
        while stdin.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(
                "Terminal {}: discarded {} queued message(s) from {}",
                self.id,
                discarded,
                consumer.id()
            );
        }

        loop {
            let message = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                message = stdin.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            if !self.can_write(consumer.id()) {
                break;
            }

            if let Err(e) = self.control.write(&message).await {
                warn!("Terminal {}: stdin write failed: {}", self.id, e);
                break;
            }
        }

        drop(stdin);
        consumer.drain_finished(generation);
    }

    async fn pump(self: Arc<Self>, mut reader: BoxedReader, stream: OutputStream) {
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!("Terminal {}: remote {} reached end of stream", self.id, stream);
                    break;
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    let dropped = {
                        let permissions = self.permissions.read();
                        self.publisher
                            .publish(stream, &chunk, |id| permissions.can_read(id))
                    };
                    for client_id in dropped {
                        warn!(
                            "Terminal {}: {} queue full for client {}, dropping chunk",
                            self.id, stream, client_id
                        );
                    }
                }
                Err(e) => {
                    warn!("Terminal {}: remote {} read failed: {}", self.id, stream, e);
                    break;
                }
            }
        }

        self.teardown().await;
    }

    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        for consumer in self.publisher.drain() {
            consumer.shutdown();
        }
        self.control.close().await;
        self.connection.close_session(&self.id);

        info!("Terminal {} closed", self.id);
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.id)
            .field("connection", &self.connection.key())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fingerprint::Fingerprint;
    use crate::gateway::testing::{MockEndpoint, MockPty, MockTransport};
    use crate::gateway::types::{AuthSpec, ConnectTarget};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    async fn open_terminal(id: &str) -> (Arc<Terminal>, MockPty, Arc<MockTransport>) {
        let target = ConnectTarget::new("h1", 22, "user1");
        let fingerprint = Fingerprint::compute(&target, &AuthSpec::password("pw1"));
        let transport = MockTransport::new();
        let connection = Arc::new(ServerConnection::new(
            target,
            fingerprint,
            transport.clone(),
        ));
        let terminal = Terminal::open(id, connection, Dimensions::new(24, 80), 64)
            .await
            .unwrap();
        let pty = transport.take_pty().unwrap();
        (terminal, pty, transport)
    }

    mod chunk_size {
        use super::*;

        #[test]
        fn test_rows_times_cols() {
            assert_eq!(read_chunk_size(Dimensions::new(24, 80)), 1920);
        }

        #[test]
        fn test_floor_applies_to_tiny_terminals() {
            assert_eq!(read_chunk_size(Dimensions::new(2, 3)), MIN_READ_CHUNK);
        }
    }

    mod permissions {
        use super::*;

        #[tokio::test]
        async fn test_creator_is_reader_and_writer() {
            let (terminal, _pty, _) = open_terminal("sess1").await;
            assert!(terminal.is_allowed("sess1"));
            assert!(terminal.can_write("sess1"));
            assert!(!terminal.is_allowed("peer"));
        }

        #[tokio::test]
        async fn test_creator_cannot_be_demoted() {
            let (terminal, _pty, _) = open_terminal("sess1").await;
            terminal.allow("sess1", false);
            assert!(terminal.can_write("sess1"));
        }

        #[tokio::test]
        async fn test_unlisted_client_is_refused() {
            let (terminal, _pty, _) = open_terminal("sess1").await;
            let (endpoint, _client) = MockEndpoint::pair();
            let result = terminal.attach("peer", endpoint);
            assert!(matches!(
                result,
                Err(GatewayError::PermissionDenied { .. })
            ));
            assert!(terminal.publisher.ids().is_empty());
        }

        #[tokio::test]
        async fn test_info_lists_permissions() {
            let (terminal, _pty, _) = open_terminal("sess1").await;
            terminal.allow("peer", false);
            let info = terminal.info();
            assert_eq!(info.readers, vec!["peer".to_string(), "sess1".to_string()]);
            assert_eq!(info.writers, vec!["sess1".to_string()]);
            assert_eq!(info.connection_key, "user1:h1:22");
        }
    }

    mod io {
        use super::*;

        #[tokio::test]
        async fn test_output_reaches_every_reader() {
            let (terminal, mut pty, _) = open_terminal("sess1").await;
            terminal.allow("peer", false);

            let (owner_ep, mut owner) = MockEndpoint::pair();
            let (peer_ep, mut peer) = MockEndpoint::pair();
            terminal.attach("sess1", owner_ep).unwrap();
            terminal.attach("peer", peer_ep).unwrap();

            pty.emit(b"prompt$ ").await;

            assert_eq!(owner.read_until(b"prompt$ ", WAIT).await, b"prompt$ ");
            assert_eq!(peer.read_until(b"prompt$ ", WAIT).await, b"prompt$ ");
        }

        #[tokio::test]
        async fn test_stderr_is_forwarded() {
            let (terminal, mut pty, _) = open_terminal("sess1").await;
            let (endpoint, mut client) = MockEndpoint::pair();
            terminal.attach("sess1", endpoint).unwrap();

            pty.emit_stderr(b"oops").await;
            assert_eq!(client.read_until(b"oops", WAIT).await, b"oops");
        }

        #[tokio::test]
        async fn test_writer_input_reaches_pty() {
            let (terminal, mut pty, _) = open_terminal("sess1").await;
            let (endpoint, client) = MockEndpoint::pair();
            terminal.attach("sess1", endpoint).unwrap();

            client.send(b"ls\n");
            assert_eq!(pty.next_input(WAIT).await.unwrap(), b"ls\n");
        }

        #[tokio::test]
        async fn test_read_only_input_is_not_forwarded() {
            let (terminal, mut pty, _) = open_terminal("sess1").await;
            terminal.allow("peer", false);
            let (endpoint, client) = MockEndpoint::pair();
            terminal.attach("peer", endpoint).unwrap();

            client.send(b"rm -rf /\n");
            assert!(pty.next_input(Duration::from_millis(200)).await.is_none());
        }

        #[tokio::test]
        async fn test_revoke_then_grant_discards_backlog() {
            let (terminal, mut pty, _) = open_terminal("sess1").await;
            terminal.allow("peer", true);
            let (endpoint, client) = MockEndpoint::pair();
            terminal.attach("peer", endpoint).unwrap();

            client.send(b"one\n");
            assert_eq!(pty.next_input(WAIT).await.unwrap(), b"one\n");

            terminal.allow("peer", false);
            client.send(b"ignored\n");
            assert!(pty.next_input(Duration::from_millis(200)).await.is_none());

            terminal.allow("peer", true);
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.send(b"two\n");
            assert_eq!(pty.next_input(WAIT).await.unwrap(), b"two\n");
        }

        #[tokio::test]
        async fn test_resize_updates_dimensions() {
            let (terminal, pty, _) = open_terminal("sess1").await;
            terminal.resize(Dimensions::new(50, 200)).await.unwrap();
            assert_eq!(terminal.dimensions(), Dimensions::new(50, 200));
            assert_eq!(pty.control.resizes(), vec![Dimensions::new(50, 200)]);
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_remote_eof_tears_down_once() {
            let (terminal, pty, _) = open_terminal("sess1").await;
            let (endpoint, _client) = MockEndpoint::pair();
            terminal.attach("sess1", endpoint.clone()).unwrap();
            let closed = terminal.closed();
            let control = Arc::clone(&pty.control);

            drop(pty);

            tokio::time::timeout(WAIT, closed.cancelled()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert!(terminal.is_closed());
            assert_eq!(endpoint.close_count(), 1);
            assert_eq!(control.close_count(), 1);
            assert!(terminal.connection().sub_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let (terminal, pty, _) = open_terminal("sess1").await;
            terminal.close().await;
            terminal.close().await;
            assert_eq!(pty.control.close_count(), 1);
            assert!(terminal.resize(Dimensions::default()).await.is_err());
        }

        #[tokio::test]
        async fn test_reattach_replaces_previous_endpoint() {
            let (terminal, _pty, _) = open_terminal("sess1").await;
            let (first, _c1) = MockEndpoint::pair();
            let (second, _c2) = MockEndpoint::pair();
            terminal.attach("sess1", first.clone()).unwrap();
            terminal.attach("sess1", second.clone()).unwrap();

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(first.close_count(), 1);
            assert_eq!(second.close_count(), 0);
            assert_eq!(terminal.publisher.ids(), vec!["sess1".to_string()]);
        }

        #[tokio::test]
        async fn test_client_close_removes_consumer() {
            let (terminal, _pty, _) = open_terminal("sess1").await;
            let (endpoint, client) = MockEndpoint::pair();
            terminal.attach("sess1", endpoint).unwrap();
            client.close();

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(terminal.publisher.ids().is_empty());
            assert!(!terminal.is_closed());
        }

        #[tokio::test]
        async fn test_attach_after_close_fails() {
            let (terminal, _pty, _) = open_terminal("sess1").await;
            terminal.close().await;
            let (endpoint, _client) = MockEndpoint::pair();
            assert!(matches!(
                terminal.attach("sess1", endpoint),
                Err(GatewayError::UnknownKey(_))
            ));
        }
    }
}
