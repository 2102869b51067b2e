//! In-memory doubles for the transport and endpoint seams.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::adapter::{EndpointError, MessageEndpoint};
use super::error::{GatewayError, GatewayResult};
use super::transport::{
    BoxedStream, CommandOutput, Connector, PtyControl, PtyStreams, SshTransport,
};
use super::types::{AuthSpec, ConnectTarget, Dimensions};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Remote half of a mock PTY, held by the test.
pub(crate) struct MockPty {
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    pub input: mpsc::UnboundedReceiver<Vec<u8>>,
    pub control: Arc<MockPtyControl>,
}

impl MockPty {
    pub async fn emit(&mut self, data: &[u8]) {
        self.stdout.write_all(data).await.unwrap();
    }

    pub async fn emit_stderr(&mut self, data: &[u8]) {
        self.stderr.write_all(data).await.unwrap();
    }

    pub async fn next_input(&mut self, wait: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(wait, self.input.recv()).await.ok().flatten()
    }
}

pub(crate) struct MockPtyControl {
    input: mpsc::UnboundedSender<Vec<u8>>,
    resizes: Mutex<Vec<Dimensions>>,
    closes: AtomicUsize,
}

impl MockPtyControl {
    pub fn resizes(&self) -> Vec<Dimensions> {
        self.resizes.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PtyControl for MockPtyControl {
    async fn write(&self, data: &[u8]) -> GatewayResult<()> {
        self.input
            .send(data.to_vec())
            .map_err(|_| GatewayError::Session("PTY channel is closed".to_string()))
    }

    async fn window_change(&self, dims: Dimensions) -> GatewayResult<()> {
        self.resizes.lock().push(dims);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    ptys: Mutex<Vec<MockPty>>,
    dimensions: Mutex<Vec<Dimensions>>,
    commands: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    forwards: Mutex<Vec<(String, u16)>>,
    fail_pty: AtomicBool,
    fail_forward: AtomicBool,
    dropped: AtomicBool,
    disconnects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Oldest PTY not yet claimed by the test.
    pub fn take_pty(&self) -> Option<MockPty> {
        let mut ptys = self.ptys.lock();
        if ptys.is_empty() {
            None
        } else {
            Some(ptys.remove(0))
        }
    }

    pub fn pty_dimensions(&self) -> Vec<Dimensions> {
        self.dimensions.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn forwards(&self) -> Vec<(String, u16)> {
        self.forwards.lock().clone()
    }

    /// Content served to `cat -- '<path>'`.
    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.files.lock().insert(path.to_string(), content.to_vec());
    }

    pub fn fail_pty(&self) {
        self.fail_pty.store(true, Ordering::SeqCst);
    }

    pub fn fail_forward(&self) {
        self.fail_forward.store(true, Ordering::SeqCst);
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        self.dropped.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect_count() > 0
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn run(&self, command: &str) -> CommandOutput {
        if let Some(text) = command.strip_prefix("echo ") {
            return CommandOutput {
                stdout: format!("{}\n", text).into_bytes(),
                stderr: Vec::new(),
                exit_code: Some(0),
            };
        }

        if let Some(quoted) = command.strip_prefix("cat -- ") {
            let path = quoted.trim_matches('\'');
            return match self.files.lock().get(path) {
                Some(content) => CommandOutput {
                    stdout: content.clone(),
                    stderr: Vec::new(),
                    exit_code: Some(0),
                },
                None => CommandOutput {
                    stdout: Vec::new(),
                    stderr: format!("cat: {}: No such file or directory\n", path).into_bytes(),
                    exit_code: Some(1),
                },
            };
        }

        CommandOutput {
            stdout: Vec::new(),
            stderr: format!("sh: {}: command not found\n", command).into_bytes(),
            exit_code: Some(127),
        }
    }
}

#[async_trait]
impl SshTransport for MockTransport {
    async fn open_pty(&self, dims: Dimensions) -> GatewayResult<PtyStreams> {
        if self.fail_pty.load(Ordering::SeqCst) {
            return Err(GatewayError::Session("PTY request failed".to_string()));
        }

        let (stdout_remote, stdout_local) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_remote, stderr_local) = tokio::io::duplex(PIPE_CAPACITY);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let control = Arc::new(MockPtyControl {
            input: input_tx,
            resizes: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });

        self.dimensions.lock().push(dims);
        self.ptys.lock().push(MockPty {
            stdout: stdout_remote,
            stderr: stderr_remote,
            input: input_rx,
            control: Arc::clone(&control),
        });

        Ok(PtyStreams {
            stdout: Box::new(stdout_local),
            stderr: Box::new(stderr_local),
            control,
        })
    }

    async fn exec(&self, command: &str) -> GatewayResult<CommandOutput> {
        self.commands.lock().push(command.to_string());
        Ok(self.run(command))
    }

    /// Each forwarded channel is served by an echo task.
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> GatewayResult<BoxedStream> {
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(GatewayError::Forward(format!(
                "Failed to open direct-tcpip channel to {}:{}: refused",
                host, port
            )));
        }
        self.forwards.lock().push((host.to_string(), port));

        let (local, mut remote) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if remote.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Box::new(local))
    }

    fn is_closed(&self) -> bool {
        self.dropped.load(Ordering::SeqCst) || self.is_disconnected()
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out a fresh [`MockTransport`] per dial and records every dial.
#[derive(Default)]
pub(crate) struct MockConnector {
    dials: Mutex<Vec<String>>,
    transports: Mutex<Vec<(String, Arc<MockTransport>)>>,
    refused_hosts: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Dials to `host` fail with a network error.
    pub fn refuse(&self, host: &str) {
        self.refused_hosts.lock().push(host.to_string());
    }

    /// Hold each dial open for `delay` before completing.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn dial_count(&self, host: &str) -> usize {
        self.dials.lock().iter().filter(|h| h.as_str() == host).count()
    }

    pub fn total_dials(&self) -> usize {
        self.dials.lock().len()
    }

    /// Most recent transport dialed for `key`.
    pub fn transport(&self, key: &str) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, t)| Arc::clone(t))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        auth: &AuthSpec,
    ) -> GatewayResult<Arc<dyn SshTransport>> {
        self.dials.lock().push(target.host.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.refused_hosts.lock().contains(&target.host) {
            return Err(GatewayError::connect(
                target.key(),
                "Failed to connect: Connection refused",
            ));
        }
        if auth.is_empty() {
            return Err(GatewayError::connect(
                target.key(),
                "Authentication failed: no authentication methods succeeded",
            ));
        }

        let transport = MockTransport::new();
        self.transports
            .lock()
            .push((target.key(), Arc::clone(&transport)));
        Ok(transport)
    }
}

enum Inbound {
    Message(Bytes),
    Close,
    Fail(String),
}

/// Endpoint double; the paired [`MockClient`] plays the remote client.
pub(crate) struct MockEndpoint {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    frames: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
    closes: AtomicUsize,
}

impl MockEndpoint {
    pub fn pair() -> (Arc<MockEndpoint>, MockClient) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(MockEndpoint {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            frames: frames_tx,
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        });
        (
            endpoint,
            MockClient {
                inbound: inbound_tx,
                frames: frames_rx,
            },
        )
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageEndpoint for MockEndpoint {
    async fn read_message(&self) -> Result<Option<Bytes>, EndpointError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Inbound::Message(data)) => Ok(Some(data)),
            Some(Inbound::Close) | None => Ok(None),
            Some(Inbound::Fail(reason)) => Err(EndpointError::Io(reason)),
        }
    }

    async fn write_frame(&self, data: &[u8]) -> Result<(), EndpointError> {
        if self.is_closed() {
            return Err(EndpointError::Closed);
        }
        self.frames
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| EndpointError::Closed)
    }

    async fn close(&self) -> Result<(), EndpointError> {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockClient {
    inbound: mpsc::UnboundedSender<Inbound>,
    frames: mpsc::UnboundedReceiver<Bytes>,
}

impl MockClient {
    pub fn send(&self, data: &[u8]) {
        let _ = self
            .inbound
            .send(Inbound::Message(Bytes::copy_from_slice(data)));
    }

    pub fn close(&self) {
        let _ = self.inbound.send(Inbound::Close);
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.inbound.send(Inbound::Fail(reason.to_string()));
    }

    pub async fn next_frame(&mut self, wait: Duration) -> Option<Bytes> {
        tokio::time::timeout(wait, self.frames.recv())
            .await
            .ok()
            .flatten()
    }

    /// Collect frames until `expected` bytes have arrived or `wait` passes.
    pub async fn read_until(&mut self, expected: &[u8], wait: Duration) -> Vec<u8> {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        while !collected.windows(expected.len().max(1)).any(|w| w == expected) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_frame(remaining).await {
                Some(frame) => collected.extend_from_slice(&frame),
                None => break,
            }
        }
        collected
    }
}
