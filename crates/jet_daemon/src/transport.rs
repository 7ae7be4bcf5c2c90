//! Listeners and per-connection tasks for the TCP and WebSocket transports.
//!
//! Each accepted connection registers with the broker, forwards every
//! decoded frame as [`Command::Inbound`](jet_core::Command::Inbound), and
//! runs a writer task that drains the peer's outbound channel into the
//! socket. When the socket closes the peer is disconnected; when the broker
//! drops the peer the writer ends and the socket is closed.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use jet_core::{BrokerHandle, Outbound, PEER_QUEUE_LEN, PeerId};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, warn};

use crate::error::DaemonError;
use crate::frame::{read_frame, write_frame};

/// WebSocket subprotocol spoken by jet peers.
pub const SUBPROTOCOL: &str = "jet";

/// Wire format of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Raw TCP with 4-byte length-prefixed JSON frames.
    Tcp,
    /// WebSocket text frames.
    WebSocket,
}

impl Protocol {
    fn name(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::WebSocket => "WebSocket",
        }
    }
}

/// Bind `addr` and serve connections until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    protocol: Protocol,
    broker: BrokerHandle,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, protocol, broker, shutdown).await
}

/// Serve connections from an already bound listener until `shutdown` fires.
pub async fn serve_listener(
    listener: TcpListener,
    protocol: Protocol,
    broker: BrokerHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    info!("{} listener on {}", protocol.name(), listener.local_addr()?);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let broker = broker.clone();
                        tokio::spawn(async move {
                            let result = match protocol {
                                Protocol::Tcp => handle_tcp(stream, peer_addr, broker).await,
                                Protocol::WebSocket => handle_ws(stream, peer_addr, broker).await,
                            };
                            if let Err(e) = result {
                                debug!("Connection {peer_addr} ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("{} listener shutting down", protocol.name());
                break;
            }
        }
    }

    Ok(())
}

/// Parse an inbound frame. Malformed JSON is logged and skipped.
fn decode(peer_addr: SocketAddr, bytes: &[u8]) -> Option<Value> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Bad JSON from {peer_addr}: {e}");
            None
        }
    }
}

async fn handle_tcp(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: BrokerHandle,
) -> Result<(), DaemonError> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(PEER_QUEUE_LEN);
    let peer = broker.connect(tx).await?;
    debug!("TCP connection {peer_addr} is peer {peer}");

    let mut write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, outbound.to_json().as_bytes()).await {
                debug!("Write to {peer_addr} failed: {e}");
                break;
            }
        }
    });

    let read_loop = async {
        while let Some(frame) = read_frame(&mut reader).await? {
            if let Some(message) = decode(peer_addr, &frame) {
                broker.inbound(&peer, message).await?;
            }
        }
        Ok::<(), DaemonError>(())
    };
    let result = tokio::select! {
        result = read_loop => result,
        _ = &mut write_task => {
            debug!("Outbound side of peer {peer} closed, closing {peer_addr}");
            Ok(())
        }
    };

    close(&broker, &peer, write_task).await;
    result
}

async fn handle_ws(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: BrokerHandle,
) -> Result<(), DaemonError> {
    let ws_stream = accept_hdr_async(stream, negotiate_subprotocol).await?;
    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(PEER_QUEUE_LEN);
    let peer = broker.connect(tx).await?;
    debug!("WebSocket connection {peer_addr} is peer {peer}");

    let mut write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(outbound.to_json().into())).await {
                debug!("Write to {peer_addr} failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let read_loop = async {
        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Text(text) => {
                    if let Some(message) = decode(peer_addr, text.as_bytes()) {
                        broker.inbound(&peer, message).await?;
                    }
                }
                Message::Binary(bytes) => {
                    if let Some(message) = decode(peer_addr, &bytes) {
                        broker.inbound(&peer, message).await?;
                    }
                }
                Message::Close(_) => {
                    debug!("Peer {peer_addr} sent close");
                    break;
                }
                _ => {} // Ping/pong are answered by tungstenite.
            }
        }
        Ok::<(), DaemonError>(())
    };
    let result = tokio::select! {
        result = read_loop => result,
        _ = &mut write_task => {
            debug!("Outbound side of peer {peer} closed, closing {peer_addr}");
            Ok(())
        }
    };

    close(&broker, &peer, write_task).await;
    result
}

/// Unregister the peer. The writer ends once the broker drops the peer's
/// sender; it is aborted so a dead socket cannot hold it open.
async fn close(broker: &BrokerHandle, peer: &PeerId, write_task: JoinHandle<()>) {
    if broker.disconnect(peer).await.is_err() {
        debug!("Broker already stopped while closing {peer}");
    }
    write_task.abort();
}

/// Handshake callback: echo the `jet` subprotocol back when the client
/// offers it.
fn negotiate_subprotocol(
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get_all("Sec-WebSocket-Protocol")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == SUBPROTOCOL);
    if offered {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jet_core::BrokerConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    async fn start(protocol: Protocol) -> (SocketAddr, broadcast::Sender<()>) {
        let (broker, _task) = jet_core::service::spawn(BrokerConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(serve_listener(listener, protocol, broker, shutdown_rx));
        (addr, shutdown_tx)
    }

    async fn tcp_request(stream: &mut TcpStream, message: Value) -> Value {
        write_frame(stream, message.to_string().as_bytes()).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_round_trip_and_fetch() {
        let (addr, shutdown) = start(Protocol::Tcp).await;
        let mut owner = TcpStream::connect(addr).await.unwrap();
        let mut watcher = TcpStream::connect(addr).await.unwrap();

        let reply = tcp_request(
            &mut owner,
            json!({"id": 1, "method": "add", "params": {"path": "light1", "value": false}}),
        )
        .await;
        assert_eq!(reply, json!({"id": 1, "result": true}));

        let reply = tcp_request(
            &mut watcher,
            json!({"id": 1, "method": "fetch", "params": {"id": "lights", "path": {"startsWith": "light"}}}),
        )
        .await;
        assert_eq!(reply, json!({"id": 1, "result": true}));
        let frame = read_frame(&mut watcher).await.unwrap().unwrap();
        let notification: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(
            notification,
            json!({"method": "lights", "params": {"path": "light1", "value": false, "event": "add"}})
        );

        // Closing the owner removes its element for everyone.
        drop(owner);
        let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut watcher))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let notification: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(notification["params"]["event"], "remove");

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_tcp_batch_request() {
        let (addr, shutdown) = start(Protocol::Tcp).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let batch = json!([
            {"id": 1, "method": "echo", "params": "a"},
            {"id": 2, "method": "echo", "params": "b"}
        ]);
        assert_eq!(tcp_request(&mut client, batch).await, json!({"id": 1, "result": "a"}));
        let frame = read_frame(&mut client).await.unwrap().unwrap();
        let second: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(second, json!({"id": 2, "result": "b"}));
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_websocket_subprotocol_and_info() {
        let (addr, shutdown) = start(Protocol::WebSocket).await;

        let mut request = format!("ws://{addr}").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        let (mut ws, response) = connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get("Sec-WebSocket-Protocol").unwrap(),
            SUBPROTOCOL
        );

        let info = json!({"id": "i", "method": "info"}).to_string();
        ws.send(Message::Text(info.into())).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(text) = reply else {
            panic!("expected a text frame, got {reply:?}");
        };
        let reply: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(reply["id"], "i");
        assert_eq!(reply["result"]["protocolVersion"], 2);
        assert_eq!(reply["result"]["features"]["batches"], true);

        ws.close(None).await.unwrap();
        let _ = shutdown.send(());
    }

    #[test]
    fn test_subprotocol_only_echoed_when_offered() {
        let request = Request::builder()
            .uri("/")
            .header("Sec-WebSocket-Protocol", "foo, jet")
            .body(())
            .unwrap();
        let response = negotiate_subprotocol(&request, Response::new(())).unwrap();
        assert_eq!(response.headers().get("Sec-WebSocket-Protocol").unwrap(), "jet");

        let request = Request::builder().uri("/").body(()).unwrap();
        let response = negotiate_subprotocol(&request, Response::new(())).unwrap();
        assert!(response.headers().get("Sec-WebSocket-Protocol").is_none());
    }
}
