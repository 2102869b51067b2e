//! One physical SSH connection shared by terminals, commands and tunnels.
//!
//! A `ServerConnection` wraps an [`SshTransport`] with the identity it was
//! created for, a table of open sub-sessions, and a lease count. Terminals
//! and tunnel routes hold leases; the registry closes the connection when
//! the last lease is released. A connection that has started closing
//! refuses new leases, so a concurrent resolve dials a fresh one instead
//! of reviving it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{GatewayError, GatewayResult};
use super::fingerprint::Fingerprint;
use super::transport::{BoxedStream, CommandOutput, PtyStreams, SshTransport};
use super::types::{ConnectTarget, ConnectionInfo, Dimensions};

/// Kind of an open sub-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubSessionKind {
    Terminal,
    Command,
}

#[derive(Debug, Default)]
struct Leases {
    count: usize,
    closing: bool,
}

pub struct ServerConnection {
    key: String,
    target: ConnectTarget,
    fingerprint: Fingerprint,
    transport: Arc<dyn SshTransport>,
    sub_sessions: DashMap<String, SubSessionKind>,
    leases: Mutex<Leases>,
    closed: CancellationToken,
    disconnected: AtomicBool,
    connected_at: DateTime<Utc>,
}

impl ServerConnection {
    pub fn new(
        target: ConnectTarget,
        fingerprint: Fingerprint,
        transport: Arc<dyn SshTransport>,
    ) -> Self {
        Self {
            key: target.key(),
            target,
            fingerprint,
            transport,
            sub_sessions: DashMap::new(),
            leases: Mutex::new(Leases::default()),
            closed: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
            connected_at: Utc::now(),
        }
    }

    /// Canonical registry key `user:host:port`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Connectivity flag: false once closed or once the transport dropped.
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && !self.transport.is_closed()
    }

    /// Fires when the connection is closed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Take a lease. Fails once the connection has begun closing.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut leases = self.leases.lock();
        if leases.closing {
            return false;
        }
        leases.count += 1;
        true
    }

    /// Drop a lease. Returns true when this was the last one, in which case
    /// the connection is marked closing and the caller must close it.
    pub(crate) fn release(&self) -> bool {
        let mut leases = self.leases.lock();
        leases.count = leases.count.saturating_sub(1);
        if leases.count == 0 && !leases.closing {
            leases.closing = true;
            return true;
        }
        false
    }

    pub fn lease_count(&self) -> usize {
        self.leases.lock().count
    }

    /// Open a PTY sub-session registered under `id`.
    pub async fn open_terminal_session(
        &self,
        id: &str,
        dims: Dimensions,
    ) -> GatewayResult<PtyStreams> {
        match self.sub_sessions.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(GatewayError::Session(format!(
                    "Sub-session {} already open on {}",
                    id, self.key
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(SubSessionKind::Terminal);
            }
        }

        match self.transport.open_pty(dims).await {
            Ok(streams) => Ok(streams),
            Err(e) => {
                self.sub_sessions.remove(id);
                Err(e)
            }
        }
    }

    /// Forget a sub-session.
    pub fn close_session(&self, id: &str) {
        if self.sub_sessions.remove(id).is_some() {
            debug!("Sub-session {} closed on {}", id, self.key);
        }
    }

    /// Run a command on a fresh sub-session.
    pub async fn execute(&self, command: &str) -> GatewayResult<CommandOutput> {
        if !self.is_connected() {
            return Err(GatewayError::Session(format!(
                "Connection {} is closed",
                self.key
            )));
        }

        let id = format!("exec-{}", uuid::Uuid::new_v4());
        self.sub_sessions.insert(id.clone(), SubSessionKind::Command);
        let result = self.transport.exec(command).await;
        self.sub_sessions.remove(&id);
        result
    }

    /// Open a forwarded channel to `host:port` through this connection.
    pub async fn forward(&self, host: &str, port: u16) -> GatewayResult<BoxedStream> {
        self.transport.open_direct_tcpip(host, port).await
    }

    pub fn sub_sessions(&self) -> Vec<(String, SubSessionKind)> {
        self.sub_sessions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Close the transport and fire the closed signal. Idempotent.
    pub async fn close(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        self.transport.disconnect().await;
        info!("SSH connection closed: {}", self.key);
    }

    pub fn info(&self) -> ConnectionInfo {
        let mut sub_sessions: Vec<String> = self
            .sub_sessions()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        sub_sessions.sort();

        ConnectionInfo {
            key: self.key.clone(),
            host: self.target.host.clone(),
            port: self.target.port,
            username: self.target.username.clone(),
            fingerprint: self.fingerprint.short(),
            leases: self.lease_count(),
            sub_sessions,
            connected_at: self.connected_at.to_rfc3339(),
            routed_via: None,
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("key", &self.key)
            .field("fingerprint", &self.fingerprint)
            .field("leases", &self.lease_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::MockTransport;
    use crate::gateway::types::AuthSpec;

    fn connection() -> (ServerConnection, Arc<MockTransport>) {
        let target = ConnectTarget::new("h1", 22, "user1");
        let fingerprint = Fingerprint::compute(&target, &AuthSpec::password("pw1"));
        let transport = MockTransport::new();
        (
            ServerConnection::new(target, fingerprint, transport.clone()),
            transport,
        )
    }

    mod leases {
        use super::*;

        #[test]
        fn test_last_release_marks_closing() {
            let (conn, _) = connection();
            assert!(conn.try_acquire());
            assert!(conn.try_acquire());
            assert!(!conn.release());
            assert!(conn.release());
            assert!(!conn.try_acquire());
        }

        #[test]
        fn test_release_without_lease_closes() {
            let (conn, _) = connection();
            assert!(conn.release());
            assert!(!conn.release());
        }
    }

    mod sub_sessions {
        use super::*;

        #[tokio::test]
        async fn test_terminal_session_is_tracked() {
            let (conn, transport) = connection();
            let _streams = conn
                .open_terminal_session("sess1", Dimensions::new(24, 80))
                .await
                .unwrap();
            assert_eq!(
                conn.sub_sessions(),
                vec![("sess1".to_string(), SubSessionKind::Terminal)]
            );
            assert_eq!(transport.pty_dimensions(), vec![Dimensions::new(24, 80)]);

            conn.close_session("sess1");
            assert!(conn.sub_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_duplicate_terminal_id_is_rejected() {
            let (conn, _) = connection();
            let _streams = conn
                .open_terminal_session("sess1", Dimensions::default())
                .await
                .unwrap();
            let result = conn
                .open_terminal_session("sess1", Dimensions::default())
                .await;
            assert!(matches!(result, Err(GatewayError::Session(_))));
        }

        #[tokio::test]
        async fn test_execute_uses_transient_sub_session() {
            let (conn, _) = connection();
            let output = conn.execute("echo hi").await.unwrap();
            assert_eq!(output.stdout, b"hi\n");
            assert!(conn.sub_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_execute_after_close_fails() {
            let (conn, transport) = connection();
            conn.close().await;
            assert!(transport.is_disconnected());
            let result = conn.execute("echo hi").await;
            assert!(matches!(result, Err(GatewayError::Session(_))));
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_close_fires_signal_once() {
            let (conn, transport) = connection();
            let closed = conn.closed();
            assert!(conn.is_connected());

            conn.close().await;
            conn.close().await;

            assert!(closed.is_cancelled());
            assert!(!conn.is_connected());
            assert_eq!(transport.disconnect_count(), 1);
        }

        #[test]
        fn test_info_snapshot() {
            let (conn, _) = connection();
            let info = conn.info();
            assert_eq!(info.key, "user1:h1:22");
            assert_eq!(info.port, 22);
            assert_eq!(info.fingerprint.len(), 12);
            assert_eq!(info.leases, 0);
        }
    }
}
