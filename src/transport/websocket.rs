//! WebSocket transport
//!
//! Client side of the popsub protocol. Responsibilities:
//! - Dial the configured servers in order and keep the first that answers
//! - Run the login -> auth handshake for `userpass`, or send the credential
//!   blob as a pre-issued token for `creds`
//! - Multiplex many local subscriptions onto one broker-level subscription
//!   per topic; the broker only learns about a topic once
//! - Acknowledge QoS 1 deliveries
//! - Publish a `CloseReason` when the socket ends

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use super::message::{ClientMessage, ServerMessage};
use super::{BrokerTransport, CloseReason, Frame, FrameSubscription, TransportHandle, TransportSid};
use crate::config::{AuthType, ConnectionConfig, SessionSettings};
use crate::utils::{TransportError, lock};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self::new(Duration::from_millis(settings.connect_timeout_ms))
    }

    /// Applies to reaching each server and, separately, to its handshake.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl BrokerTransport for WebSocketTransport {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportHandle>, TransportError> {
        let mut last_error = None;

        for server in &config.servers {
            match tokio::time::timeout(self.connect_timeout, connect_async(server.as_str())).await {
                Ok(Ok((mut ws, _response))) => {
                    tokio::time::timeout(self.connect_timeout, authenticate(&mut ws, config))
                        .await
                        .map_err(|_| TransportError::Timeout("authentication".into()))??;
                    info!("Connected to broker at {server}");
                    return Ok(WebSocketHandle::spawn(ws));
                }
                Ok(Err(e)) => {
                    warn!("Unable to reach {server}: {e}");
                    last_error = Some(TransportError::Connect {
                        server: server.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!("Timed out connecting to {server}");
                    last_error = Some(TransportError::Timeout(server.clone()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Connect {
            server: String::new(),
            reason: "no servers configured".into(),
        }))
    }
}

async fn authenticate(ws: &mut WsStream, config: &ConnectionConfig) -> Result<(), TransportError> {
    let token = match config.auth_type {
        AuthType::None => return Ok(()),
        AuthType::Creds => config.creds_content.trim().to_string(),
        AuthType::Userpass => {
            let login = ClientMessage::Login {
                username: config.username.clone(),
                password: config.password.clone(),
            };
            send(ws, login.to_ws()?).await?;
            match next_control(ws).await? {
                ServerMessage::LoginResponse { token } => token,
                ServerMessage::Error { message } => return Err(TransportError::Rejected(message)),
                other => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected reply to login: {other:?}"
                    )));
                }
            }
        }
    };

    send(ws, ClientMessage::Auth { token }.to_ws()?).await?;
    match next_control(ws).await? {
        ServerMessage::Authenticated {} => Ok(()),
        ServerMessage::Error { message } => Err(TransportError::Rejected(message)),
        other => Err(TransportError::Protocol(format!(
            "unexpected reply to auth: {other:?}"
        ))),
    }
}

async fn send(ws: &mut WsStream, msg: WsMessage) -> Result<(), TransportError> {
    ws.send(msg)
        .await
        .map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Reads until the next text frame during the handshake.
async fn next_control(ws: &mut WsStream) -> Result<ServerMessage, TransportError> {
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| TransportError::Protocol(e.to_string()))?;
        if msg.is_close() {
            return Err(TransportError::Closed);
        }
        if let Ok(text) = msg.to_text() {
            if !text.is_empty() {
                return ServerMessage::parse(text);
            }
        }
    }
    Err(TransportError::Closed)
}

#[derive(Debug, Default)]
struct Routes {
    next_sid: TransportSid,
    by_sid: HashMap<TransportSid, (String, mpsc::UnboundedSender<Frame>)>,
}

impl Routes {
    fn has_topic(&self, topic: &str) -> bool {
        self.by_sid.values().any(|(t, _)| t == topic)
    }
}

struct WebSocketHandle {
    outbound: mpsc::UnboundedSender<WsMessage>,
    routes: Arc<std::sync::Mutex<Routes>>,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
    closing: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl WebSocketHandle {
    fn spawn(ws: WsStream) -> Arc<dyn TransportHandle> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let (closed_tx, _) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        let routes = Arc::new(std::sync::Mutex::new(Routes::default()));
        let closing = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("Failed to send frame to broker: {e}");
                    break;
                }
                if is_close {
                    break;
                }
            }
            debug!("Send loop closed");
        });

        let reader = {
            let routes = routes.clone();
            let outbound = tx.clone();
            let closed_tx = closed_tx.clone();
            let closing = closing.clone();

            tokio::spawn(async move {
                let mut error = None;

                while let Some(msg) = ws_receiver.next().await {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            error = Some(e.to_string());
                            break;
                        }
                    };
                    if msg.is_close() {
                        break;
                    }
                    if !msg.is_text() {
                        continue;
                    }
                    let Ok(text) = msg.to_text() else { continue };

                    match ServerMessage::parse(text) {
                        Ok(ServerMessage::Message {
                            topic,
                            payload,
                            message_id,
                            qos,
                            ..
                        }) => {
                            if qos == 1 && !message_id.is_empty() {
                                if let Ok(ack) = (ClientMessage::Ack { message_id }).to_ws() {
                                    let _ = outbound.send(ack);
                                }
                            }
                            let routes = lock(&routes);
                            for (subject, sender) in routes.by_sid.values() {
                                if *subject == topic {
                                    let _ = sender.send(Frame::new(topic.clone(), payload.clone()));
                                }
                            }
                        }
                        Ok(ServerMessage::Error { message }) => {
                            warn!("Broker reported an error: {message}");
                        }
                        Ok(other) => debug!("Ignoring broker frame {other:?}"),
                        Err(e) => warn!("Invalid broker frame: {e}"),
                    }
                }

                lock(&routes).by_sid.clear();
                if !closing.load(Ordering::SeqCst) {
                    info!("Broker closed the connection");
                }
                closed_tx.send_replace(Some(CloseReason { error }));
            })
        };

        Arc::new(WebSocketHandle {
            outbound: tx,
            routes,
            closed_tx,
            closing,
            tasks: std::sync::Mutex::new(Some((writer, reader))),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(msg.to_ws()?)
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl TransportHandle for WebSocketHandle {
    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let payload =
            String::from_utf8(data).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.send(ClientMessage::Publish {
            topic: subject.to_string(),
            payload,
            message_id: None,
            qos: Some(0),
        })
    }

    async fn subscribe(&self, subject: &str) -> Result<FrameSubscription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let (tx, frames) = mpsc::unbounded_channel();
        let (sid, first) = {
            let mut routes = lock(&self.routes);
            let first = !routes.has_topic(subject);
            routes.next_sid += 1;
            let sid = routes.next_sid;
            routes.by_sid.insert(sid, (subject.to_string(), tx));
            (sid, first)
        };

        if first {
            if let Err(e) = self.send(ClientMessage::Subscribe {
                topic: subject.to_string(),
            }) {
                lock(&self.routes).by_sid.remove(&sid);
                return Err(e);
            }
        }
        Ok(FrameSubscription { sid, frames })
    }

    async fn unsubscribe(&self, sid: TransportSid) -> Result<(), TransportError> {
        let last_for_topic = {
            let mut routes = lock(&self.routes);
            match routes.by_sid.remove(&sid) {
                Some((topic, _)) if !routes.has_topic(&topic) => Some(topic),
                _ => None,
            }
        };

        match last_for_topic {
            Some(topic) if !self.is_closed() => self.send(ClientMessage::Unsubscribe { topic }),
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(WsMessage::Close(None));

        let tasks = lock(&self.tasks).take();
        if let Some((writer, reader)) = tasks {
            if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                debug!("Writer did not flush the close frame in time");
            }
            reader.abort();
        }

        lock(&self.routes).by_sid.clear();
        self.closed_tx.send_if_modified(|reason| {
            if reason.is_none() {
                *reason = Some(CloseReason::default());
                true
            } else {
                false
            }
        });
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_tx.subscribe()
    }
}
