//! WebSocket transport for EC manager connections.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use super::Registry;
use super::entry::{AgentSink, InboundFrame};

/// Write half of an upgraded WebSocket.
pub struct WsSink {
    inner: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

#[async_trait]
impl AgentSink for WsSink {
    async fn send_text(&self, text: String) -> Result<()> {
        self.inner.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn send_ping(&self, payload: Vec<u8>) -> Result<()> {
        self.inner.lock().await.send(Message::Ping(payload.into())).await?;
        Ok(())
    }

    async fn send_pong(&self, payload: Vec<u8>) -> Result<()> {
        self.inner.lock().await.send(Message::Pong(payload.into())).await?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.inner.lock().await.close().await;
    }
}

fn to_frame(message: Result<Message, axum::Error>) -> Result<InboundFrame> {
    Ok(match message? {
        Message::Text(text) => InboundFrame::Text(text.to_string()),
        Message::Binary(bytes) => InboundFrame::Binary(bytes.to_vec()),
        Message::Ping(payload) => InboundFrame::Ping(payload.to_vec()),
        Message::Pong(payload) => InboundFrame::Pong(payload.to_vec()),
        Message::Close(_) => InboundFrame::Close,
    })
}

/// Serve an upgraded socket for `node_name` until the link closes.
pub async fn serve(registry: Arc<Registry>, socket: WebSocket, node_name: String, version: String) {
    let (write, read) = socket.split();
    let sink: Arc<dyn AgentSink> = Arc::new(WsSink::new(write));
    registry
        .connect(node_name, version, sink, read.map(to_frame))
        .await;
}
