//! poem WebSocket front end.
//!
//! Each client opens `/ws/:name/:command/:action/:params`. Streaming actions
//! (`init`, `route`, `share-session`) hand the socket to a terminal; the
//! others answer and close. A failed request gets one text frame carrying
//! the error message before the socket closes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::http::StatusCode;
use poem::web::{Data, Json, Path};
use poem::{
    Endpoint, EndpointExt, IntoResponse, Route, delete, get, handler, middleware::Tracing,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::gateway::protocol::Request;
use crate::gateway::types::{ConnectionInfo, TerminalInfo};
use crate::gateway::{EndpointError, Gateway, GatewayError, MessageEndpoint, Reply};

/// [`MessageEndpoint`] over one upgraded WebSocket.
pub struct WebSocketEndpoint {
    sink: Mutex<SplitSink<WebSocketStream, Message>>,
    stream: Mutex<SplitStream<WebSocketStream>>,
}

impl WebSocketEndpoint {
    pub fn new(socket: WebSocketStream) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    async fn send(&self, message: Message) -> Result<(), EndpointError> {
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| EndpointError::Io(e.to_string()))
    }
}

/// Command output goes out as text when it is valid UTF-8, binary otherwise.
fn output_message(output: &[u8]) -> Message {
    match std::str::from_utf8(output) {
        Ok(text) => Message::Text(text.to_string()),
        Err(_) => Message::Binary(output.to_vec()),
    }
}

#[async_trait]
impl MessageEndpoint for WebSocketEndpoint {
    async fn read_message(&self) -> Result<Option<Bytes>, EndpointError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(EndpointError::Io(e.to_string())),
            }
        }
    }

    async fn write_frame(&self, data: &[u8]) -> Result<(), EndpointError> {
        self.send(Message::Binary(data.to_vec())).await
    }

    async fn close(&self) -> Result<(), EndpointError> {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("Close frame not sent: {}", e);
        }
        sink.close()
            .await
            .map_err(|e| EndpointError::Io(e.to_string()))
    }
}

async fn reject(endpoint: &WebSocketEndpoint, err: &GatewayError) {
    if let Err(e) = endpoint.send(Message::Text(err.to_string())).await {
        debug!("Error frame not sent: {}", e);
    }
    let _ = endpoint.close().await;
}

async fn serve_socket(gateway: Arc<Gateway>, endpoint: Arc<WebSocketEndpoint>, request: Request) {
    let reply = gateway
        .dispatch(&request, Arc::clone(&endpoint) as Arc<dyn MessageEndpoint>)
        .await;

    match reply {
        Ok(Reply::Attached) => {}
        Ok(Reply::Output(output)) => {
            if let Err(e) = endpoint.send(output_message(&output)).await {
                debug!("Command output not delivered to {}: {}", request.session_name, e);
            }
            let _ = endpoint.close().await;
        }
        Ok(Reply::Done) => {
            let _ = endpoint.close().await;
        }
        Err(e) => {
            warn!(
                "{} for {} failed ({}): {}",
                request.action,
                request.session_name,
                e.code(),
                e
            );
            reject(&endpoint, &e).await;
        }
    }
}

#[handler]
fn terminal_socket(
    Path((name, command, action, params)): Path<(String, String, String, String)>,
    ws: WebSocket,
    Data(gateway): Data<&Arc<Gateway>>,
) -> impl IntoResponse {
    let gateway = Arc::clone(gateway);
    ws.on_upgrade(move |socket| async move {
        let endpoint = Arc::new(WebSocketEndpoint::new(socket));
        match Request::parse(&name, &command, &action, &params) {
            Ok(request) => serve_socket(gateway, endpoint, request).await,
            Err(e) => {
                warn!("Rejected request for {}: {}", name, e);
                reject(&endpoint, &e).await;
            }
        }
    })
}

#[handler]
fn list_terminals(Data(gateway): Data<&Arc<Gateway>>) -> Json<Vec<TerminalInfo>> {
    Json(gateway.terminals())
}

#[handler]
fn list_connections(Data(gateway): Data<&Arc<Gateway>>) -> Json<Vec<ConnectionInfo>> {
    Json(gateway.connections())
}

#[handler]
async fn close_terminal(
    Path(name): Path<String>,
    Data(gateway): Data<&Arc<Gateway>>,
) -> poem::Result<StatusCode> {
    gateway
        .close_terminal(&name)
        .await
        .map_err(|e| poem::Error::from_string(e.to_string(), StatusCode::NOT_FOUND))?;
    Ok(StatusCode::NO_CONTENT)
}

/// HTTP routes for a gateway.
pub fn app(gateway: Arc<Gateway>) -> impl Endpoint {
    Route::new()
        .at("/ws/:name/:command/:action/:params", get(terminal_socket))
        .at("/api/terminals", get(list_terminals))
        .at("/api/terminals/:name", delete(close_terminal))
        .at("/api/connections", get(list_connections))
        .data(gateway)
        .with(Tracing)
}
