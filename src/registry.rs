//! Registry of live EC manager connections, one per node.
//!
//! Each connection gets a liveness prober task and an inbound read loop. The
//! node map is guarded by a single mutex that is never held across an await.

pub mod entry;
pub mod socket;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{Stream, StreamExt};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UpgradeError;
use crate::metrics::Metrics;

pub use entry::{AgentSink, ClientInfo, ConnectionEntry, InboundFrame, LivenessFrame};

/// Liveness probe interval bounds. Each probe waits a random delay in `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(20),
        }
    }
}

const PING_TOKEN_LEN: usize = 16;

pub struct Registry {
    clients: Mutex<BTreeMap<String, ConnectionEntry>>,
    probe: ProbeConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Registry {
    pub fn new(probe: ProbeConfig) -> Self {
        Self {
            clients: Mutex::new(BTreeMap::new()),
            probe,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ConnectionEntry>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn update_gauge(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_connected_agents(count);
        }
    }

    /// Register a connection for a node, closing any connection it replaces.
    pub async fn register(&self, node_name: &str, version: &str, sink: Arc<dyn AgentSink>) {
        let (previous, count) = {
            let mut clients = self.lock();
            let previous = clients.insert(
                node_name.to_string(),
                ConnectionEntry::new(version, sink),
            );
            (previous, clients.len())
        };
        self.update_gauge(count);

        info!(node = node_name, version = version, "EC manager connected");

        if let Some(old) = previous {
            info!(
                node = node_name,
                old_version = %old.version,
                "Closing replaced EC manager connection"
            );
            old.sink.close().await;
        }
    }

    /// Remove the node's entry if it still holds the version recorded at registration.
    ///
    /// Returns false when a newer registration already replaced it. A reconnect
    /// at the same version is indistinguishable here; connection teardown uses
    /// [`Registry::remove_connection`] instead.
    pub fn remove(&self, node_name: &str, version: &str) -> bool {
        self.remove_if(node_name, version, |entry| entry.version == version)
    }

    /// Remove the node's entry only if it still wraps `sink`.
    fn remove_connection(
        &self,
        node_name: &str,
        version: &str,
        sink: &Arc<dyn AgentSink>,
    ) -> bool {
        self.remove_if(node_name, version, |entry| entry.owns(sink))
    }

    fn remove_if(
        &self,
        node_name: &str,
        version: &str,
        predicate: impl FnOnce(&ConnectionEntry) -> bool,
    ) -> bool {
        let (removed, count) = {
            let mut clients = self.lock();
            let matches = clients.get(node_name).is_some_and(predicate);
            if matches {
                clients.remove(node_name);
            }
            (matches, clients.len())
        };
        if removed {
            self.update_gauge(count);
            info!(node = node_name, version = version, "EC manager disconnected");
        } else {
            debug!(
                node = node_name,
                version = version,
                "Stale close ignored, node holds a newer connection"
            );
        }
        removed
    }

    /// Snapshot of all registered connections.
    pub fn clients(&self) -> BTreeMap<String, ConnectionEntry> {
        self.lock().clone()
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.lock()
            .iter()
            .map(|(name, entry)| entry.info(name))
            .collect()
    }

    /// Connection for a specific node.
    pub fn client_for_node(&self, node_name: &str) -> Result<ConnectionEntry, UpgradeError> {
        self.lock()
            .get(node_name)
            .cloned()
            .ok_or_else(|| UpgradeError::NodeNotConnected(node_name.to_string()))
    }

    /// Any connected agent. Cluster-level commands do not care which node runs them.
    pub fn first_active_client(&self) -> Result<(String, ConnectionEntry), UpgradeError> {
        self.lock()
            .iter()
            .next()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .ok_or(UpgradeError::NoConnectedAgent)
    }

    /// Version the node's manager currently reports, if connected.
    pub fn node_version(&self, node_name: &str) -> Option<String> {
        self.lock().get(node_name).map(|e| e.version.clone())
    }

    /// Apply a liveness update to the entry owned by `sink`.
    fn record(&self, node_name: &str, sink: &Arc<dyn AgentSink>, f: impl FnOnce(&mut ConnectionEntry)) {
        let mut clients = self.lock();
        if let Some(entry) = clients.get_mut(node_name).filter(|e| e.owns(sink)) {
            f(entry);
        }
    }

    fn next_probe_delay(&self) -> Duration {
        let ProbeConfig {
            min_interval,
            max_interval,
        } = self.probe;
        if max_interval <= min_interval {
            return min_interval;
        }
        rand::thread_rng().gen_range(min_interval..=max_interval)
    }

    /// Serve one agent connection until it closes.
    ///
    /// Registers the connection, runs the liveness prober alongside the read
    /// loop, and on exit removes the entry if this connection still owns it.
    pub async fn connect<S>(
        self: Arc<Self>,
        node_name: String,
        version: String,
        sink: Arc<dyn AgentSink>,
        mut frames: S,
    ) where
        S: Stream<Item = anyhow::Result<InboundFrame>> + Send + Unpin,
    {
        self.register(&node_name, &version, sink.clone()).await;

        let cancel = CancellationToken::new();
        let prober = tokio::spawn(probe_loop(
            self.clone(),
            node_name.clone(),
            version.clone(),
            sink.clone(),
            cancel.clone(),
        ));

        self.read_loop(&node_name, &sink, &mut frames, &cancel).await;

        cancel.cancel();
        if let Err(e) = prober.await {
            warn!(node = %node_name, error = %e, "Liveness prober task failed");
        }
        sink.close().await;
        self.remove_connection(&node_name, &version, &sink);
    }

    async fn read_loop<S>(
        &self,
        node_name: &str,
        sink: &Arc<dyn AgentSink>,
        frames: &mut S,
        cancel: &CancellationToken,
    ) where
        S: Stream<Item = anyhow::Result<InboundFrame>> + Send + Unpin,
    {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = frames.next() => frame,
            };

            match frame {
                None | Some(Ok(InboundFrame::Close)) => {
                    debug!(node = node_name, "Connection closed by agent");
                    return;
                }
                Some(Err(e)) => {
                    warn!(node = node_name, error = %e, "Failed to read from EC manager");
                    return;
                }
                Some(Ok(InboundFrame::Pong(payload))) => {
                    self.record(node_name, sink, |e| {
                        e.last_pong_received = Some(LivenessFrame::now(&payload));
                    });
                }
                Some(Ok(InboundFrame::Ping(payload))) => {
                    self.record(node_name, sink, |e| {
                        e.last_ping_received = Some(LivenessFrame::now(&payload));
                    });
                    if let Err(e) = sink.send_pong(payload.clone()).await {
                        warn!(node = node_name, error = %e, "Failed to send pong");
                        return;
                    }
                    self.record(node_name, sink, |e| {
                        e.last_pong_sent = Some(LivenessFrame::now(&payload));
                    });
                }
                Some(Ok(InboundFrame::Text(text))) => {
                    debug!(node = node_name, message = %text, "Ignoring message from EC manager");
                }
                Some(Ok(InboundFrame::Binary(bytes))) => {
                    debug!(node = node_name, len = bytes.len(), "Ignoring binary frame");
                }
            }
        }
    }
}

fn random_token() -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PING_TOKEN_LEN)
        .collect()
}

/// Send pings on a randomized interval. A failed write counts as connection loss.
async fn probe_loop(
    registry: Arc<Registry>,
    node_name: String,
    version: String,
    sink: Arc<dyn AgentSink>,
    cancel: CancellationToken,
) {
    loop {
        let delay = registry.next_probe_delay();
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        let payload = random_token();
        if let Err(e) = sink.send_ping(payload.clone()).await {
            warn!(node = %node_name, error = %e, "Ping failed, dropping EC manager connection");
            registry.remove_connection(&node_name, &version, &sink);
            cancel.cancel();
            return;
        }
        registry.record(&node_name, &sink, |e| {
            e.last_ping_sent = Some(LivenessFrame::now(&payload));
        });
    }
}
