//! SSH hop chaining through an already-connected parent.
//!
//! A route makes a host reachable only from the parent look like a local
//! one: the inner SSH connection dials a loopback listener, and every
//! connection accepted there is carried inside a `direct-tcpip` channel
//! (RFC 4254) of the parent's encrypted transport.
//!
//! # Architecture
//!
//! 1. **Parent lease**: the route holds a lease on the parent connection for
//!    as long as the inner connection lives.
//! 2. **Loopback listener**: bound to `127.0.0.1:0`. The first forwarded
//!    channel is opened eagerly so an unreachable target fails the route
//!    request instead of the later handshake.
//! 3. **Bridges**: each accepted socket is copied byte-for-byte in both
//!    directions with `tokio::io::copy_bidirectional` until both directions
//!    finish or either reports an error.
//! 4. **Inner connection**: resolved through the registry at
//!    `user:localhost:<port>`. When it closes, the listener and its bridges
//!    stop and the parent lease is returned.
//!
//! # Feature Gate
//!
//! This module is only compiled when the `tunnel` feature is enabled.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::CredentialPolicy;
use super::connection::ServerConnection;
use super::error::{GatewayError, GatewayResult};
use super::fingerprint::Fingerprint;
use super::storage::ConnectionRegistry;
use super::transport::BoxedStream;
use super::types::{ConnectParams, ConnectTarget, ResolvePolicy, SecretBytes};

/// Host name used for the inner hop's loopback target.
pub const LOOPBACK_HOST: &str = "localhost";

/// A live route.
#[derive(Debug, Clone)]
struct RouteRecord {
    parent_key: String,
    alias_fingerprint: Fingerprint,
}

/// Result of a successful route: the inner key and its leased connection.
#[derive(Debug)]
pub struct Routed {
    pub inner_key: String,
    pub port: u16,
    pub connection: Arc<ServerConnection>,
}

pub struct TunnelRouter {
    registry: Arc<ConnectionRegistry>,
    credentials: CredentialPolicy,
    routes: Arc<DashMap<String, RouteRecord>>,
}

impl TunnelRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, credentials: CredentialPolicy) -> Self {
        Self {
            registry,
            credentials,
            routes: Arc::new(DashMap::new()),
        }
    }

    /// Build an inner connection to `target` through the connection at
    /// `parent_key`.
    ///
    /// `otp_code` is the already-minted code when `target` names an OTP
    /// identity. The returned connection carries one lease for the caller.
    pub async fn route(
        &self,
        name: &str,
        target: &ConnectParams,
        otp_code: Option<String>,
        parent_key: &str,
    ) -> GatewayResult<Routed> {
        let parent = self
            .registry
            .acquire(parent_key)
            .map_err(|_| GatewayError::TunnelPrerequisiteMissing(parent_key.to_string()))?;

        match self.establish(name, target, otp_code, &parent).await {
            Ok(routed) => Ok(routed),
            Err(e) => {
                self.registry.release(&parent).await;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        name: &str,
        target: &ConnectParams,
        otp_code: Option<String>,
        parent: &Arc<ServerConnection>,
    ) -> GatewayResult<Routed> {
        let outer = target.target();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| GatewayError::Forward(format!("Failed to bind loopback listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| GatewayError::Forward(format!("Failed to get local address: {}", e)))?
            .port();

        let first_channel = parent.forward(&outer.host, outer.port).await?;

        let stop = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(parent),
            outer.host.clone(),
            outer.port,
            first_channel,
            stop.clone(),
        ));

        let fetched_key = match target.private_key_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => match fetch_private_key(parent, path).await {
                Ok(key) => Some(key),
                Err(e) => {
                    stop.cancel();
                    return Err(e);
                }
            },
            None => None,
        };

        let auth = match target.auth_spec(&self.credentials, otp_code, fetched_key) {
            Ok(auth) => auth,
            Err(e) => {
                stop.cancel();
                return Err(e);
            }
        };
        let inner = ConnectTarget::new(LOOPBACK_HOST, port, outer.username.clone());
        let inner_key = inner.key();

        let connection = match self
            .registry
            .resolve(&inner, &auth, ResolvePolicy::Reuse)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                stop.cancel();
                return Err(e);
            }
        };

        self.routes.insert(
            inner_key.clone(),
            RouteRecord {
                parent_key: parent.key().to_string(),
                alias_fingerprint: Fingerprint::compute(&outer, &auth),
            },
        );

        tokio::spawn(watch_inner(
            connection.closed(),
            stop,
            inner_key.clone(),
            Arc::clone(&self.routes),
            Arc::clone(&self.registry),
            Arc::clone(parent),
        ));

        info!(
            "Route {}: {} -> {}:{} via {} on 127.0.0.1:{}",
            name,
            inner_key,
            outer.host,
            outer.port,
            parent.key(),
            port
        );

        Ok(Routed {
            inner_key,
            port,
            connection,
        })
    }

    /// Let operations addressed to `alias_key` reach the tunnel-backed
    /// connection at `inner_key`.
    pub fn update_route_key(&self, inner_key: &str, alias_key: &str) -> GatewayResult<()> {
        let record = self
            .routes
            .get(inner_key)
            .map(|r| r.value().clone())
            .ok_or_else(|| GatewayError::UnknownKey(inner_key.to_string()))?;

        self.registry
            .alias(inner_key, alias_key, record.alias_fingerprint)
    }

    /// Parent key of the route at `inner_key`.
    pub fn parent_of(&self, inner_key: &str) -> Option<String> {
        self.routes.get(inner_key).map(|r| r.parent_key.clone())
    }
}

/// Tear the route down once the inner connection closes.
async fn watch_inner(
    inner_closed: CancellationToken,
    stop: CancellationToken,
    inner_key: String,
    routes: Arc<DashMap<String, RouteRecord>>,
    registry: Arc<ConnectionRegistry>,
    parent: Arc<ServerConnection>,
) {
    inner_closed.cancelled().await;
    stop.cancel();
    routes.remove(&inner_key);
    registry.release(&parent).await;
    info!("Route {} closed", inner_key);
}

async fn accept_loop(
    listener: TcpListener,
    parent: Arc<ServerConnection>,
    host: String,
    port: u16,
    first_channel: BoxedStream,
    stop: CancellationToken,
) {
    let mut pending = Some(first_channel);

    loop {
        let (socket, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting tunnel connection: {}", e);
                    break;
                }
            },
        };

        debug!("Tunnel connection from {} to {}:{}", peer, host, port);

        let channel = match pending.take() {
            Some(channel) => channel,
            None => match parent.forward(&host, port).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            },
        };

        tokio::spawn(bridge(socket, channel, stop.child_token()));
    }

    debug!("Tunnel listener for {}:{} stopped", host, port);
}

async fn bridge(mut socket: TcpStream, mut channel: BoxedStream, stop: CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut channel) => match result {
            Ok((sent, received)) => {
                debug!("Tunnel bridge finished ({} bytes out, {} bytes in)", sent, received);
            }
            Err(e) => debug!("Tunnel bridge ended: {}", e),
        },
    }
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Read a private key from the parent host. The bytes are never logged.
async fn fetch_private_key(
    parent: &ServerConnection,
    path: &str,
) -> GatewayResult<SecretBytes> {
    let output = parent
        .execute(&format!("cat -- {}", shell_quote(path)))
        .await?;

    if output.exit_code != Some(0) || output.stdout.is_empty() {
        return Err(GatewayError::Forward(format!(
            "Failed to read private key {} on {}",
            path,
            parent.key()
        )));
    }

    debug!("Fetched private key {} from {}", path, parent.key());
    Ok(SecretBytes::new(output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::MockConnector;
    use crate::gateway::types::AuthSpec;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        connector: Arc<MockConnector>,
        router: TunnelRouter,
        parent: Arc<ServerConnection>,
    }

    async fn fixture() -> Fixture {
        let connector = MockConnector::new();
        let registry = Arc::new(ConnectionRegistry::new(connector.clone()));
        let parent = registry
            .resolve(
                &ConnectTarget::new("H1", 22, "u"),
                &AuthSpec::password("pw1"),
                ResolvePolicy::Reuse,
            )
            .await
            .unwrap();
        Fixture {
            router: TunnelRouter::new(Arc::clone(&registry), CredentialPolicy::default()),
            registry,
            connector,
            parent,
        }
    }

    fn h2_params() -> ConnectParams {
        ConnectParams {
            host: "H2".to_string(),
            port: Some(2222),
            user: "u".to_string(),
            pass: Some("pw2".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/home/u/.ssh/id"), "'/home/u/.ssh/id'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_route_requires_parent() {
        let f = fixture().await;
        let result = f
            .router
            .route("sess1", &h2_params(), None, "u:nowhere:22")
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::TunnelPrerequisiteMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_route_yields_loopback_key_without_redialing_parent() {
        let f = fixture().await;
        let routed = f
            .router
            .route("sess1", &h2_params(), None, "u:H1:22")
            .await
            .unwrap();

        assert_eq!(routed.inner_key, format!("u:localhost:{}", routed.port));
        assert_eq!(f.connector.dial_count("H1"), 1);
        assert_eq!(f.connector.dial_count(LOOPBACK_HOST), 1);
        assert_eq!(f.parent.lease_count(), 2);

        let parent_transport = f.connector.transport("u:H1:22").unwrap();
        assert_eq!(parent_transport.forwards(), vec![("H2".to_string(), 2222)]);

        let again = f
            .registry
            .resolve(
                &ConnectTarget::new(LOOPBACK_HOST, routed.port, "u"),
                &h2_params()
                    .auth_spec(&CredentialPolicy::default(), None, None)
                    .unwrap(),
                ResolvePolicy::Reuse,
            )
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&again, &routed.connection));
        assert_eq!(f.connector.dial_count("H1"), 1);
        assert_eq!(f.connector.dial_count(LOOPBACK_HOST), 1);
    }

    #[tokio::test]
    async fn test_loopback_connections_are_bridged() {
        let f = fixture().await;
        let routed = f
            .router
            .route("sess1", &h2_params(), None, "u:H1:22")
            .await
            .unwrap();

        for message in [&b"first"[..], &b"second"[..]] {
            let mut socket = TcpStream::connect(("127.0.0.1", routed.port)).await.unwrap();
            socket.write_all(message).await.unwrap();
            let mut echoed = vec![0u8; message.len()];
            tokio::time::timeout(WAIT, socket.read_exact(&mut echoed))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(echoed, message);
        }

        let parent_transport = f.connector.transport("u:H1:22").unwrap();
        assert_eq!(parent_transport.forwards().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_route() {
        let f = fixture().await;
        f.connector.transport("u:H1:22").unwrap().fail_forward();

        let result = f.router.route("sess1", &h2_params(), None, "u:H1:22").await;
        assert!(matches!(result, Err(GatewayError::Forward(_))));
        assert_eq!(f.parent.lease_count(), 1);
        assert_eq!(f.connector.dial_count(LOOPBACK_HOST), 0);
    }

    #[tokio::test]
    async fn test_private_key_fetched_through_parent() {
        let f = fixture().await;
        let parent_transport = f.connector.transport("u:H1:22").unwrap();
        parent_transport.put_file("/home/u/.ssh/id_ed25519", b"-----BEGIN KEY-----");

        let params = ConnectParams {
            pass: None,
            private_key_path: Some("/home/u/.ssh/id_ed25519".to_string()),
            ..h2_params()
        };
        f.router
            .route("sess1", &params, None, "u:H1:22")
            .await
            .unwrap();

        assert_eq!(
            parent_transport.commands(),
            vec!["cat -- '/home/u/.ssh/id_ed25519'".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_key_file_fails_route() {
        let f = fixture().await;
        let params = ConnectParams {
            private_key_path: Some("/missing".to_string()),
            ..h2_params()
        };
        let result = f.router.route("sess1", &params, None, "u:H1:22").await;
        assert!(matches!(result, Err(GatewayError::Forward(_))));
        assert_eq!(f.parent.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_alias_reaches_inner_connection() {
        let f = fixture().await;
        let routed = f
            .router
            .route("sess1", &h2_params(), None, "u:H1:22")
            .await
            .unwrap();
        f.router.update_route_key(&routed.inner_key, "u:H2:2222").unwrap();

        let via_alias = f
            .registry
            .resolve(
                &h2_params().target(),
                &h2_params()
                    .auth_spec(&CredentialPolicy::default(), None, None)
                    .unwrap(),
                ResolvePolicy::Reuse,
            )
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&via_alias, &routed.connection));
        assert_eq!(f.connector.dial_count("H2"), 0);
    }

    #[tokio::test]
    async fn test_inner_close_releases_parent() {
        let f = fixture().await;
        let routed = f
            .router
            .route("sess1", &h2_params(), None, "u:H1:22")
            .await
            .unwrap();
        assert_eq!(f.router.parent_of(&routed.inner_key).as_deref(), Some("u:H1:22"));

        f.registry.release(&routed.connection).await;

        tokio::time::timeout(WAIT, async {
            while f.parent.lease_count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(f.router.routes.is_empty());
        assert!(f.router.parent_of(&routed.inner_key).is_none());
        assert!(f.parent.is_connected());
    }
}
