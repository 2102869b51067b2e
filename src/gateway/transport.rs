//! Transport seams between the gateway core and SSH.
//!
//! The core (registry, terminals, tunnels) only talks to these traits. The
//! russh-backed implementations live in `client`; tests substitute in-memory
//! doubles so every concurrency property can be exercised without a server.
//!
//! # Architecture
//!
//! - [`Connector`]: dials and authenticates one target, yielding an
//!   [`SshTransport`].
//! - [`SshTransport`]: one live SSH connection. Opens PTY sub-sessions,
//!   one-shot command sub-sessions and `direct-tcpip` channels.
//! - [`PtyStreams`]: the remote shell's stdout/stderr as independent byte
//!   readers plus a [`PtyControl`] for stdin, window changes and close.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::GatewayResult;
use super::types::{AuthSpec, ConnectTarget, Dimensions};

/// Terminal type requested for every PTY.
pub const TERM: &str = "xterm-256color";

/// Input and output baud rate requested for every PTY.
pub const TERMINAL_SPEED: u32 = 14400;

/// Bidirectional byte stream (forwarded channel, loopback socket).
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Captured output of a one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<u32>,
}

/// Write side of a live PTY sub-session.
#[async_trait]
pub trait PtyControl: Send + Sync {
    /// Send bytes to the remote process's stdin.
    async fn write(&self, data: &[u8]) -> GatewayResult<()>;

    /// Issue a window-change request.
    async fn window_change(&self, dims: Dimensions) -> GatewayResult<()>;

    /// Close the sub-session. Safe to call more than once.
    async fn close(&self);
}

/// A PTY sub-session with a running shell.
pub struct PtyStreams {
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub control: Arc<dyn PtyControl>,
}

/// One live SSH connection.
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Allocate a PTY with the gateway's terminal modes and start a shell.
    async fn open_pty(&self, dims: Dimensions) -> GatewayResult<PtyStreams>;

    /// Run a command on a fresh sub-session to completion.
    async fn exec(&self, command: &str) -> GatewayResult<CommandOutput>;

    /// Open a `direct-tcpip` channel to `host:port` as seen from the remote side.
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> GatewayResult<BoxedStream>;

    /// Whether the underlying transport has gone away.
    fn is_closed(&self) -> bool;

    /// Close the transport.
    async fn disconnect(&self);
}

/// Dials and authenticates SSH targets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectTarget,
        auth: &AuthSpec,
    ) -> GatewayResult<Arc<dyn SshTransport>>;
}
