//! Gateway operations exposed to the front end.
//!
//! - `init`: connect (or reuse a connection) and open a terminal
//! - `route`: open a terminal on a host reached through a connected parent
//! - `resize`: change a terminal's PTY size
//! - `allow_share`: grant a peer read or read/write access to a terminal
//! - `share_session`: attach a peer's endpoint to a terminal
//! - `exec`: run a one-shot command on a connection
//! - `close_terminal`, `terminals`, `connections`: management

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use super::adapter::MessageEndpoint;
use super::client::RusshConnector;
use super::config::GatewayConfig;
use super::connection::ServerConnection;
use super::error::{GatewayError, GatewayResult};
#[cfg(feature = "tunnel")]
use super::forward::TunnelRouter;
use super::otp::{NoOtp, OtpProvider};
use super::protocol::{Action, Request};
use super::storage::{ConnectionRegistry, DashMapTerminalStorage, TerminalStorage};
use super::terminal::Terminal;
use super::transport::Connector;
use super::types::{
    ConnectParams, ConnectionInfo, Dimensions, ExecParams, ResizeParams, ShareParams,
    TerminalInfo,
};
#[cfg(feature = "tunnel")]
use super::types::RouteParams;

/// What the front end should do with the client endpoint after a request.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// The endpoint is attached to a terminal and owned by its adapter.
    Attached,
    /// Send one frame, then close.
    Output(Bytes),
    /// Close the endpoint.
    Done,
}

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    terminals: Arc<DashMapTerminalStorage>,
    #[cfg(feature = "tunnel")]
    router: TunnelRouter,
    otp: Arc<dyn OtpProvider>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        otp: Arc<dyn OtpProvider>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(connector));
        Self {
            #[cfg(feature = "tunnel")]
            router: TunnelRouter::new(Arc::clone(&registry), config.credentials.clone()),
            config,
            registry,
            terminals: Arc::new(DashMapTerminalStorage::new()),
            otp,
        }
    }

    /// Gateway dialing real servers, without an OTP backend.
    pub fn from_config(config: GatewayConfig) -> Self {
        let connector = Arc::new(RusshConnector::new(&config));
        Self::new(config, connector, Arc::new(NoOtp))
    }

    /// Run one front-end request.
    pub async fn dispatch(
        &self,
        request: &Request,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<Reply> {
        let name = request.session_name.as_str();
        debug!("Dispatching {} for {}", request.action, name);

        match request.action {
            Action::Init => {
                let params: ConnectParams = request.params()?;
                self.init(name, &params, endpoint).await?;
                Ok(Reply::Attached)
            }
            Action::Route => self.dispatch_route(request, endpoint).await,
            Action::Resize => {
                let params: ResizeParams = request.params()?;
                self.resize(name, params.rows, params.cols).await?;
                Ok(Reply::Done)
            }
            Action::AllowShareSession => {
                let params: ShareParams = request.params()?;
                self.allow_share(name, &params.id, params.write)?;
                Ok(Reply::Done)
            }
            Action::ShareSession => {
                let params: ShareParams = request.params()?;
                self.share_session(&params.id, name, endpoint)?;
                Ok(Reply::Attached)
            }
            Action::Exec => {
                let params: ExecParams = request.params()?;
                let key = match params.key.filter(|k| !k.is_empty()) {
                    Some(key) => key,
                    None => self.connection_key_of(name)?,
                };
                Ok(Reply::Output(self.exec(&key, &params.command).await?))
            }
        }
    }

    #[cfg(feature = "tunnel")]
    async fn dispatch_route(
        &self,
        request: &Request,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<Reply> {
        let params: RouteParams = request.params()?;
        self.route(&request.session_name, &params, endpoint).await?;
        Ok(Reply::Attached)
    }

    #[cfg(not(feature = "tunnel"))]
    async fn dispatch_route(
        &self,
        _request: &Request,
        _endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<Reply> {
        Err(GatewayError::InvalidRequest(
            "Tunnel support is not enabled".to_string(),
        ))
    }

    /// Connect to the requested target and open terminal `session_name`,
    /// attaching `endpoint` as its creator.
    pub async fn init(
        &self,
        session_name: &str,
        params: &ConnectParams,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<()> {
        if self.terminals.contains(session_name) {
            return Err(GatewayError::TerminalExists(session_name.to_string()));
        }

        let otp_code = self.otp_code(params).await?;
        let auth = params.auth_spec(&self.config.credentials, otp_code, None)?;
        let connection = self
            .registry
            .resolve(&params.target(), &auth, params.policy())
            .await?;

        self.open_terminal(session_name, connection, params.dimensions(), endpoint)
            .await
    }

    /// Open terminal `session_name` on a host reached through `params.parent`.
    ///
    /// The parent is connected first when no live connection exists at its
    /// key. Returns the inner connection key.
    #[cfg(feature = "tunnel")]
    pub async fn route(
        &self,
        session_name: &str,
        params: &RouteParams,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<String> {
        if self.terminals.contains(session_name) {
            return Err(GatewayError::TerminalExists(session_name.to_string()));
        }

        let parent_key = params.parent.key();
        let parent_lease = if self.registry.has_active(&parent_key) {
            None
        } else {
            let otp_code = self.otp_code(&params.parent).await?;
            let auth = params
                .parent
                .auth_spec(&self.config.credentials, otp_code, None)?;
            Some(
                self.registry
                    .resolve(&params.parent.target(), &auth, params.parent.policy())
                    .await?,
            )
        };

        let result = self
            .route_terminal(session_name, &parent_key, params, endpoint)
            .await;

        // The route holds its own lease on the parent
        if let Some(parent) = parent_lease {
            self.registry.release(&parent).await;
        }

        result
    }

    #[cfg(feature = "tunnel")]
    async fn route_terminal(
        &self,
        session_name: &str,
        parent_key: &str,
        params: &RouteParams,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<String> {
        let otp_code = self.otp_code(&params.target).await?;
        let routed = self
            .router
            .route(session_name, &params.target, otp_code, parent_key)
            .await?;

        if let Err(e) = self
            .router
            .update_route_key(&routed.inner_key, &params.target.key())
        {
            self.registry.release(&routed.connection).await;
            return Err(e);
        }

        self.open_terminal(
            session_name,
            routed.connection,
            params.target.dimensions(),
            endpoint,
        )
        .await?;

        Ok(routed.inner_key)
    }

    pub async fn resize(&self, session_name: &str, rows: u32, cols: u32) -> GatewayResult<()> {
        let terminal = self.terminal(session_name)?;
        terminal.resize(Dimensions::new(rows, cols)).await
    }

    /// Let `peer_id` attach to terminal `session_name`, writing if `can_write`.
    pub fn allow_share(
        &self,
        session_name: &str,
        peer_id: &str,
        can_write: bool,
    ) -> GatewayResult<()> {
        let terminal = self.terminal(session_name)?;
        terminal.allow(peer_id, can_write);
        info!(
            "Terminal {} shared with {} (write: {})",
            session_name, peer_id, can_write
        );
        Ok(())
    }

    /// Attach `endpoint` to terminal `session_id` as consumer `peer_id`.
    pub fn share_session(
        &self,
        session_id: &str,
        peer_id: &str,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<()> {
        let terminal = self.terminal(session_id)?;
        terminal.attach(peer_id, endpoint)
    }

    /// Run `command` on the connection at `key` and return its stdout.
    pub async fn exec(&self, key: &str, command: &str) -> GatewayResult<Bytes> {
        let connection = self.registry.acquire(key)?;
        let result = connection.execute(command).await;
        self.registry.release(&connection).await;

        let output = result?;
        debug!(
            "Command on {} exited with {:?} ({} bytes)",
            key,
            output.exit_code,
            output.stdout.len()
        );
        Ok(Bytes::from(output.stdout))
    }

    pub async fn close_terminal(&self, session_name: &str) -> GatewayResult<()> {
        let terminal = self.terminal(session_name)?;
        self.terminals.unregister_if_current(&terminal);
        terminal.close().await;
        Ok(())
    }

    /// Connection key of terminal `session_name`.
    pub fn connection_key_of(&self, session_name: &str) -> GatewayResult<String> {
        Ok(self.terminal(session_name)?.connection().key().to_string())
    }

    pub fn terminals(&self) -> Vec<TerminalInfo> {
        self.terminals.list_all()
    }

    #[cfg(feature = "tunnel")]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections = self.registry.connections();
        for info in &mut connections {
            info.routed_via = self.router.parent_of(&info.key);
        }
        connections
    }

    #[cfg(not(feature = "tunnel"))]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.connections()
    }

    fn terminal(&self, session_name: &str) -> GatewayResult<Arc<Terminal>> {
        self.terminals
            .get(session_name)
            .filter(|t| !t.is_closed())
            .ok_or_else(|| GatewayError::UnknownKey(session_name.to_string()))
    }

    async fn otp_code(&self, params: &ConnectParams) -> GatewayResult<Option<String>> {
        match params.otp.as_deref().filter(|o| !o.is_empty()) {
            Some(identity) => Ok(Some(self.otp.generate_code_from_name(identity).await?)),
            None => Ok(None),
        }
    }

    /// Open a terminal on a leased connection. The lease passes to the
    /// terminal and is returned when it closes.
    async fn open_terminal(
        &self,
        session_name: &str,
        connection: Arc<ServerConnection>,
        dims: Dimensions,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> GatewayResult<()> {
        let terminal = match Terminal::open(
            session_name,
            Arc::clone(&connection),
            dims,
            self.config.queue_capacity,
        )
        .await
        {
            Ok(terminal) => terminal,
            Err(e) => {
                self.registry.release(&connection).await;
                return Err(e);
            }
        };

        if let Err(e) = self.terminals.register(Arc::clone(&terminal)) {
            terminal.close().await;
            self.registry.release(&connection).await;
            return Err(e);
        }

        self.watch_terminal(Arc::clone(&terminal));
        terminal.attach(session_name, endpoint)
    }

    fn watch_terminal(&self, terminal: Arc<Terminal>) {
        let terminals = Arc::clone(&self.terminals);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            terminal.closed().cancelled().await;
            terminals.unregister_if_current(&terminal);
            registry.release(terminal.connection()).await;
        });
    }
}
