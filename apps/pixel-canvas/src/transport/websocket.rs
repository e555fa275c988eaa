use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use super::{ConnectRequest, Connector, Handshake, Link, Outbound, TransportError};
use crate::protocol::{self, ClientMessage, ServerMessage};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to the authoritative store over a JSON-framed WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    handshake_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

pub fn subscribe_url(request: &ConnectRequest) -> Result<Url, TransportError> {
    let base = request.endpoint.as_str().trim_end_matches('/');
    let mut url = Url::parse(&format!(
        "{base}/v1/database/{}/subscribe",
        request.module
    ))
    .map_err(|err| TransportError::Connect(format!("invalid endpoint: {err}")))?;
    if let Some(token) = &request.token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Link, TransportError> {
        let url = subscribe_url(request)?;
        debug!(target = "pixel_canvas::transport", endpoint = %request.endpoint, module = %request.module, resume = request.token.is_some(), "opening websocket");
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|err| {
            let text = err.to_string();
            if text.contains("401") || text.contains("403") {
                TransportError::Auth(text)
            } else {
                TransportError::Connect(text)
            }
        })?;

        let (tx_out, rx_out) = mpsc::unbounded_channel::<ClientMessage>();
        let (tx_in, mut rx_in) = mpsc::unbounded_channel::<ServerMessage>();
        let open = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(handle_websocket(ws_stream, rx_out, tx_in, open.clone()));

        let handshake = match tokio::time::timeout(self.handshake_timeout, rx_in.recv()).await {
            Ok(Some(ServerMessage::IdentityToken { identity, token })) => {
                Handshake { identity, token }
            }
            Ok(Some(other)) => {
                task.abort();
                return Err(TransportError::Connect(format!(
                    "expected identity token, got {other:?}"
                )));
            }
            Ok(None) => {
                task.abort();
                return Err(TransportError::ChannelClosed);
            }
            Err(_) => {
                task.abort();
                return Err(TransportError::Timeout);
            }
        };

        let outbound = Arc::new(WebSocketOutbound {
            tx: tx_out,
            open,
            task: parking_lot::Mutex::new(Some(task)),
        });
        Ok(Link {
            handshake,
            outbound,
            inbound: rx_in,
        })
    }
}

struct WebSocketOutbound {
    tx: mpsc::UnboundedSender<ClientMessage>,
    open: Arc<AtomicBool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Outbound for WebSocketOutbound {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(message)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketOutbound {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<ClientMessage>,
    tx_in: mpsc::UnboundedSender<ServerMessage>,
    open: Arc<AtomicBool>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx_out.recv().await {
            let text = match protocol::encode_client_message(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target = "pixel_canvas::transport", error = %err, "dropping unencodable frame");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client closed".into(),
            })))
            .await;
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match protocol::decode_server_message(&text) {
                Ok(frame) => {
                    if tx_in.send(frame).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(target = "pixel_canvas::transport", error = %err, "ignoring undecodable frame");
                }
            },
            Ok(Message::Binary(bytes)) => {
                trace!(target = "pixel_canvas::transport", len = bytes.len(), "ignoring binary frame");
            }
            Ok(Message::Close(frame)) => {
                debug!(target = "pixel_canvas::transport", ?frame, "websocket closed by peer");
                break;
            }
            Err(err) => {
                warn!(target = "pixel_canvas::transport", error = %err, "websocket read failed");
                break;
            }
            _ => {}
        }
    }

    open.store(false, Ordering::SeqCst);
    send_task.abort();
    let _ = send_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_url_embeds_module_and_token() {
        let request = ConnectRequest::new(
            Url::parse("ws://127.0.0.1:3000/").unwrap(),
            "local-pixel-canvas",
            Some("abc def".into()),
        );
        let url = subscribe_url(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:3000/v1/database/local-pixel-canvas/subscribe?token=abc+def"
        );
    }

    #[test]
    fn blank_token_connects_anonymously() {
        let request = ConnectRequest::new(
            Url::parse("ws://127.0.0.1:3000").unwrap(),
            "canvas",
            Some("   ".into()),
        );
        assert!(request.token.is_none());
        let url = subscribe_url(&request).unwrap();
        assert_eq!(url.query(), None);
    }
}
