//! WebSocket connection handling: accept, read/dispatch loop, outbound
//! signal draining. Mirrors the teacher's `Socket`/`Connection` split in
//! `bin/signaling/src/socket.rs`, generalized from its NATS-backed router
//! hand-off to this crate's in-process `Hub::dispatch`.

use anyhow::Result;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::{net::TcpStream, sync::mpsc::unbounded_channel};
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tungstenite::protocol::{Message, WebSocketConfig};

use super::{channel::Tx, ChannelSignal, Rx, SessionHandle};
use crate::hub::Hub;

/// Thin wrapper over the tungstenite stream. Kept separate from
/// `Connection` so the read/write halves stay easy to reason about on
/// their own, the way the teacher's `Socket` does.
struct Socket {
    inner: WebSocketStream<TcpStream>,
}

impl Socket {
    async fn send(&mut self, message: Message) -> Result<()> {
        self.inner.send(message).await?;
        Ok(())
    }

    async fn read(&mut self) -> Option<Message> {
        match self.inner.next().await {
            Some(Ok(message)) => Some(message),
            _ => None,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close(None).await?;
        Ok(())
    }
}

pub struct Connection {
    hub: Arc<Hub>,
    socket: Socket,
    id: String,
    rx: Rx,
}

impl Connection {
    pub async fn new(stream: TcpStream, hub: Arc<Hub>, config: WebSocketConfig) -> Result<Self> {
        let websocket = accept_async_with_config(stream, Some(config)).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = unbounded_channel();

        let handle = Arc::new(SessionHandle::new(
            id.clone(),
            Tx(tx),
            hub.config.session.frame_rate_per_min,
            hub.config.channels.upstream_rate_per_min,
        ));
        hub.sessions.insert(handle.clone());

        handle.tx.send(
            json!({
                "type": "server_info",
                "serverId": hub.config.federation.server_id,
                "endpoint": hub.config.federation.endpoint,
            })
            .to_string(),
        );

        if hub.attestation.is_enabled() {
            handle.tx.send(hub.attestation.server_identity_frame());
        }

        Ok(Self { hub, socket: Socket { inner: websocket }, id, rx })
    }

    async fn handle_signal(&mut self, signal: ChannelSignal) -> Result<bool> {
        match signal {
            ChannelSignal::Body(body) => {
                self.socket.send(Message::Text(body)).await?;
                Ok(true)
            }
            ChannelSignal::Close => {
                self.socket.close().await?;
                Ok(false)
            }
        }
    }

    async fn poll(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                signal = self.rx.recv() => {
                    match signal {
                        Some(signal) => if !self.handle_signal(signal).await? { break; },
                        None => break,
                    }
                }
                message = self.socket.read() => {
                    match message {
                        Some(Message::Text(text)) => self.hub.dispatch(&self.id, &text).await,
                        Some(Message::Close(_)) | None => break,
                        Some(_) => {}
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn launch(stream: TcpStream, hub: Arc<Hub>, config: WebSocketConfig) {
        let id = match Connection::new(stream, hub.clone(), config).await {
            Ok(mut connection) => {
                let id = connection.id.clone();
                if let Err(err) = connection.poll().await {
                    log::warn!("connection {id} ended with error: {err}");
                }
                id
            }
            Err(err) => {
                log::warn!("failed to establish websocket connection: {err}");
                return;
            }
        };

        hub.remove_session(&id).await;
    }
}
