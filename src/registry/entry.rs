//! Connection entries and the transport seam used to write to agents.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Write half of an agent connection.
#[async_trait]
pub trait AgentSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
    async fn send_ping(&self, payload: Vec<u8>) -> Result<()>;
    async fn send_pong(&self, payload: Vec<u8>) -> Result<()>;
    /// Close the connection. Errors are ignored: the link may already be gone.
    async fn close(&self);
}

/// Frames read from an agent connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Timestamp and payload of a liveness frame.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LivenessFrame {
    pub at: DateTime<Utc>,
    pub payload: String,
}

impl LivenessFrame {
    pub fn now(payload: &[u8]) -> Self {
        Self {
            at: Utc::now(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

/// One live link to a node's EC manager.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub sink: Arc<dyn AgentSink>,
    pub connected_at: DateTime<Utc>,
    pub version: String,
    pub last_ping_sent: Option<LivenessFrame>,
    pub last_pong_received: Option<LivenessFrame>,
    pub last_ping_received: Option<LivenessFrame>,
    pub last_pong_sent: Option<LivenessFrame>,
}

impl ConnectionEntry {
    pub fn new(version: impl Into<String>, sink: Arc<dyn AgentSink>) -> Self {
        Self {
            sink,
            connected_at: Utc::now(),
            version: version.into(),
            last_ping_sent: None,
            last_pong_received: None,
            last_ping_received: None,
            last_pong_sent: None,
        }
    }

    /// True if this entry wraps the given sink.
    pub fn owns(&self, sink: &Arc<dyn AgentSink>) -> bool {
        Arc::ptr_eq(&self.sink, sink)
    }

    pub fn info(&self, node_name: &str) -> ClientInfo {
        ClientInfo {
            node_name: node_name.to_string(),
            version: self.version.clone(),
            connected_at: self.connected_at,
            last_ping_sent: self.last_ping_sent.clone(),
            last_pong_received: self.last_pong_received.clone(),
            last_ping_received: self.last_ping_received.clone(),
            last_pong_sent: self.last_pong_sent.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("connected_at", &self.connected_at)
            .field("version", &self.version)
            .field("last_ping_sent", &self.last_ping_sent)
            .field("last_pong_received", &self.last_pong_received)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a connection for diagnostics.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub node_name: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping_sent: Option<LivenessFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pong_received: Option<LivenessFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping_received: Option<LivenessFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pong_sent: Option<LivenessFrame>,
}
