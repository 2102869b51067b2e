//! russh-backed SSH connections.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: keepalive and compression settings; no
//!    inactivity timeout since terminals are long-lived.
//! 2. **Connection Establishment**: TCP dial and SSH handshake bounded by the
//!    configured connect timeout.
//! 3. **Authentication**: the request's auth methods, tried in order through
//!    an [`AuthChain`].
//! 4. **Sub-sessions**: PTY shells, one-shot commands and `direct-tcpip`
//!    channels opened on the shared handle.
//!
//! ## PTY channel ownership
//!
//! A russh channel is driven by a single owner task that multiplexes three
//! things with `tokio::select!`: control commands (stdin bytes, window
//! changes, close), stdout data and stderr data. Output is written into two
//! in-memory pipes so the terminal can read stdout and stderr as independent
//! byte streams. When the remote side closes, the pipes are dropped and the
//! terminal's readers observe end-of-stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, Pty, client};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::GatewayConfig;
use super::error::{GatewayError, GatewayResult};
use super::session::GatewayClientHandler;
use super::transport::{
    BoxedStream, CommandOutput, Connector, PtyControl, PtyStreams, SshTransport, TERM,
    TERMINAL_SPEED,
};
use super::types::{AuthSpec, ConnectTarget, Dimensions};

/// Capacity of each stdout/stderr pipe between the channel owner and the terminal.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Pending control commands per PTY channel.
const CONTROL_QUEUE: usize = 256;

/// Build russh client configuration.
///
/// - No inactivity timeout
/// - Keepalive at `keepalive` interval with max 3 unanswered keepalives
/// - ZLIB offered first when `compress` is set
pub(crate) fn build_client_config(compress: bool, keepalive: Duration) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(keepalive),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Dials real SSH servers.
pub struct RusshConnector {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            config: build_client_config(config.compression, config.keepalive_interval),
            connect_timeout: config.connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        auth: &AuthSpec,
    ) -> GatewayResult<Arc<dyn SshTransport>> {
        let key = target.key();
        let handler = GatewayClientHandler::new(key.clone());

        let connect_future = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            handler,
        );

        let mut handle = tokio::time::timeout(self.connect_timeout, connect_future)
            .await
            .map_err(|_| {
                GatewayError::connect(
                    &key,
                    format!("Connection timed out after {:?}", self.connect_timeout),
                )
            })?
            .map_err(|e| GatewayError::connect(&key, format!("Failed to connect: {}", e)))?;

        let chain = AuthChain::from_spec(auth);
        let success = chain
            .authenticate(&mut handle, &target.username)
            .await
            .map_err(|e| GatewayError::connect(&key, e))?;

        if !success {
            return Err(GatewayError::connect(
                &key,
                "Authentication failed: no authentication methods succeeded",
            ));
        }

        info!("SSH connection established: {}", key);

        Ok(Arc::new(RusshTransport { handle, key }))
    }
}

/// One authenticated russh client handle.
pub struct RusshTransport {
    handle: client::Handle<GatewayClientHandler>,
    key: String,
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn open_pty(&self, dims: Dimensions) -> GatewayResult<PtyStreams> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::Session(format!("Failed to open channel: {}", e)))?;

        let modes = [
            (Pty::ECHO, 1),
            (Pty::TTY_OP_ISPEED, TERMINAL_SPEED),
            (Pty::TTY_OP_OSPEED, TERMINAL_SPEED),
        ];

        channel
            .request_pty(false, TERM, dims.cols, dims.rows, 0, 0, &modes)
            .await
            .map_err(|e| GatewayError::Session(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| GatewayError::Session(format!("Shell request failed: {}", e)))?;

        let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(CONTROL_QUEUE);

        tokio::spawn(drive_pty_channel(
            channel,
            commands_rx,
            stdout_tx,
            stderr_tx,
            self.key.clone(),
        ));

        debug!("PTY {}x{} opened on {}", dims.cols, dims.rows, self.key);

        Ok(PtyStreams {
            stdout: Box::new(stdout_rx),
            stderr: Box::new(stderr_rx),
            control: Arc::new(RusshPtyControl {
                commands: commands_tx,
            }),
        })
    }

    async fn exec(&self, command: &str) -> GatewayResult<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::Session(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| GatewayError::Session(format!("Failed to execute command: {}", e)))?;

        let mut output = CommandOutput {
            stdout: Vec::with_capacity(4096),
            stderr: Vec::with_capacity(1024),
            exit_code: None,
        };

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 is stderr in SSH protocol
                    if ext == 1 {
                        output.stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    output.exit_code = Some(exit_status);
                }
                Some(ChannelMsg::Eof) => {
                    if output.exit_code.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        let _ = channel.close().await;

        Ok(output)
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> GatewayResult<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                GatewayError::Forward(format!(
                    "Failed to open direct-tcpip channel to {}:{}: {}",
                    host, port, e
                ))
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} reported: {}", self.key, e);
        }
    }
}

enum PtyCommand {
    Data(Vec<u8>),
    Resize(Dimensions, oneshot::Sender<Result<(), russh::Error>>),
    Close,
}

struct RusshPtyControl {
    commands: mpsc::Sender<PtyCommand>,
}

#[async_trait]
impl PtyControl for RusshPtyControl {
    async fn write(&self, data: &[u8]) -> GatewayResult<()> {
        self.commands
            .send(PtyCommand::Data(data.to_vec()))
            .await
            .map_err(|_| GatewayError::Session("PTY channel is closed".to_string()))
    }

    async fn window_change(&self, dims: Dimensions) -> GatewayResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PtyCommand::Resize(dims, reply_tx))
            .await
            .map_err(|_| GatewayError::Session("PTY channel is closed".to_string()))?;

        reply_rx
            .await
            .map_err(|_| GatewayError::Session("PTY channel is closed".to_string()))?
            .map_err(|e| GatewayError::Session(format!("Window change failed: {}", e)))
    }

    async fn close(&self) {
        let _ = self.commands.send(PtyCommand::Close).await;
    }
}

/// Owner task of one PTY channel.
async fn drive_pty_channel(
    mut channel: russh::Channel<client::Msg>,
    mut commands: mpsc::Receiver<PtyCommand>,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    key: String,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PtyCommand::Data(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        warn!("Failed to write to PTY on {}: {}", key, e);
                        break;
                    }
                }
                Some(PtyCommand::Resize(dims, reply)) => {
                    let result = channel.window_change(dims.cols, dims.rows, 0, 0).await;
                    let _ = reply.send(result);
                }
                Some(PtyCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    if stdout.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 && stderr.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Shell on {} exited with status {}", key, exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    debug!("PTY channel owner for {} finished", key);
}
