//! Gateway (Connection Manager)
//!
//! Host-side component accepting worker connections, proxying RPCs between
//! them, and broadcasting published events. Each connection first registers
//! the agent types it can host; placement of an agent id onto a connection
//! is sticky until that connection drops.
//!
//! Correlation rule: every proxied request is forwarded under a freshly
//! minted request id, never the caller's original, so multiple callers
//! sharing one connection can never cross-talk. The original id is restored
//! when the response is routed back.

use crate::config::GatewayConfig;
use crate::connect::MeshStream;
use crate::protocol::{read_frame, write_frame, Envelope, WireError};
use dashmap::DashMap;
use mesh_runtime::{AgentId, AgentType, RuntimeError, Subscription, SubscriptionRegistry};
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier for one attached worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Outbound side of one attached connection. The token scopes both of the
/// connection's loops; teardown cancels it.
struct ConnectionHandle {
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

/// An in-flight proxied RPC, keyed by (target connection, fresh id).
struct PendingCall {
    origin: ConnectionId,
    caller_request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    connection: ConnectionId,
    request_id: String,
}

/// Gateway counters (atomic, snapshot via [`Gateway::stats`]).
#[derive(Debug, Default)]
struct GatewayMetrics {
    requests_routed: AtomicU64,
    responses_matched: AtomicU64,
    correlation_mismatches: AtomicU64,
    timeouts: AtomicU64,
    events_broadcast: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    subscription_conflicts: AtomicU64,
}

/// Snapshot of gateway counters.
#[derive(Debug, Clone)]
pub struct GatewayStats {
    pub requests_routed: u64,
    pub responses_matched: u64,
    pub correlation_mismatches: u64,
    pub timeouts: u64,
    pub events_broadcast: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub subscription_conflicts: u64,
}

struct GatewayInner {
    config: GatewayConfig,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Which connections advertise each agent type.
    supported_types: DashMap<AgentType, Vec<ConnectionId>>,
    /// Sticky agent placement, memoized until the owning connection drops.
    placement: DashMap<AgentId, ConnectionId>,
    pending: DashMap<PendingKey, PendingCall>,
    /// Worker-installed subscriptions, held only so conflicting ids surface
    /// in the acknowledgement. Broadcast routing never matches against it:
    /// events fan out to one representative connection per supported type,
    /// and the hosting workers match their own local registries.
    subscriptions: SubscriptionRegistry,
    metrics: GatewayMetrics,
    shutdown: CancellationToken,
}

/// Connection manager for a mesh of worker processes.
///
/// Cheap to clone; clones share one routing state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                config,
                connections: DashMap::new(),
                supported_types: DashMap::new(),
                placement: DashMap::new(),
                pending: DashMap::new(),
                subscriptions: SubscriptionRegistry::new(),
                metrics: GatewayMetrics::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Accept worker connections from a TCP listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) {
        info!("Gateway accepting worker connections");
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, error = %e, "set_nodelay failed");
                        }
                        let id = self.attach(stream);
                        info!(connection = %id, peer = %peer, "Worker connected");
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                },
            }
        }
        info!("Gateway stopped accepting connections");
    }

    /// Attach one duplex stream as a worker connection, spawning its read
    /// and write loops. Used directly by in-memory tests.
    pub fn attach<S: MeshStream + 'static>(&self, stream: S) -> ConnectionId {
        let id = ConnectionId::new();
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(self.inner.config.outbound_queue_capacity);
        let cancel = self.inner.shutdown.child_token();

        self.inner.connections.insert(
            id,
            ConnectionHandle {
                outbound,
                cancel: cancel.clone(),
            },
        );
        self.inner
            .metrics
            .connections_opened
            .fetch_add(1, Ordering::Relaxed);
        debug!(connection = %id, "Attached worker connection");

        tokio::spawn(GatewayInner::write_loop(
            self.inner.clone(),
            id,
            write_half,
            outbound_rx,
            cancel.clone(),
        ));
        tokio::spawn(GatewayInner::read_loop(
            self.inner.clone(),
            id,
            read_half,
            cancel,
        ));
        id
    }

    /// Forcibly remove one connection, closing its stream. The worker side
    /// observes an ordinary connection loss and reconnects.
    pub fn detach(&self, id: ConnectionId) -> bool {
        let existed = self.inner.connections.contains_key(&id);
        self.inner.teardown(id);
        existed
    }

    /// Ids of the currently attached connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.connections.iter().map(|e| *e.key()).collect()
    }

    /// Stop the gateway: connections wind down and serve() returns.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn stats(&self) -> GatewayStats {
        let m = &self.inner.metrics;
        GatewayStats {
            requests_routed: m.requests_routed.load(Ordering::Relaxed),
            responses_matched: m.responses_matched.load(Ordering::Relaxed),
            correlation_mismatches: m.correlation_mismatches.load(Ordering::Relaxed),
            timeouts: m.timeouts.load(Ordering::Relaxed),
            events_broadcast: m.events_broadcast.load(Ordering::Relaxed),
            connections_opened: m.connections_opened.load(Ordering::Relaxed),
            connections_closed: m.connections_closed.load(Ordering::Relaxed),
            subscription_conflicts: m.subscription_conflicts.load(Ordering::Relaxed),
        }
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// How many connections advertise the given agent type.
    pub fn connections_for_type(&self, agent_type: &AgentType) -> usize {
        self.inner
            .supported_types
            .get(agent_type)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Number of in-flight proxied RPCs.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

impl GatewayInner {
    async fn write_loop<S: MeshStream>(
        inner: Arc<Self>,
        id: ConnectionId,
        mut writer: WriteHalf<S>,
        mut outbound_rx: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_envelope = outbound_rx.recv() => {
                    let Some(envelope) = maybe_envelope else { break };
                    if let Err(e) = write_frame(&mut writer, &envelope).await {
                        warn!(connection = %id, error = %e, "Write failed; tearing down connection");
                        inner.teardown(id);
                        break;
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn read_loop<S: MeshStream>(
        inner: Arc<Self>,
        id: ConnectionId,
        mut reader: ReadHalf<S>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(envelope)) => inner.handle_envelope(id, envelope).await,
                    Ok(None) => {
                        debug!(connection = %id, "Connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(connection = %id, error = %e, "Read failed");
                        break;
                    }
                },
            }
        }
        inner.teardown(id);
    }

    /// Remove a dropped connection from the routing state. Pending calls
    /// tied to it are left to resolve via the normal timeout.
    fn teardown(&self, id: ConnectionId) {
        let Some((_, handle)) = self.connections.remove(&id) else {
            return; // already torn down by the other loop
        };
        handle.cancel.cancel();
        self.supported_types.retain(|_, conns| {
            conns.retain(|c| *c != id);
            !conns.is_empty()
        });
        self.placement.retain(|_, conn| *conn != id);
        self.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
        info!(connection = %id, "Worker connection removed; placements purged");
    }

    async fn handle_envelope(self: &Arc<Self>, conn: ConnectionId, envelope: Envelope) {
        match envelope {
            Envelope::Request {
                request_id,
                target,
                sender,
                payload,
            } => {
                self.handle_request(conn, request_id, target, sender, payload)
                    .await
            }
            Envelope::Response {
                request_id,
                payload,
                error,
            } => self.handle_response(conn, request_id, payload, error).await,
            Envelope::Publish {
                message_id,
                topic,
                sender,
                payload,
            } => self.handle_publish(conn, message_id, topic, sender, payload).await,
            Envelope::RegisterAgentType {
                request_id,
                agent_type,
            } => self.handle_register_type(conn, request_id, agent_type).await,
            Envelope::AddSubscription {
                request_id,
                subscription,
            } => self.handle_add_subscription(conn, request_id, subscription).await,
            other => {
                warn!(
                    connection = %conn,
                    kind = other.kind(),
                    "Unexpected envelope at gateway; discarding"
                );
            }
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        origin: ConnectionId,
        caller_request_id: String,
        target: String,
        sender: Option<String>,
        payload: mesh_runtime::Payload,
    ) {
        let target_id: AgentId = match target.parse() {
            Ok(id) => id,
            Err(e) => {
                self.respond_error(origin, caller_request_id, WireError::from(&e))
                    .await;
                return;
            }
        };

        let Some((chosen, newly_placed)) = self.resolve_placement(&target_id) else {
            self.respond_error(
                origin,
                caller_request_id,
                WireError::Addressing {
                    message: format!(
                        "agent not found: no connection advertises type {}",
                        target_id.agent_type()
                    ),
                },
            )
            .await;
            return;
        };

        let fresh_id = Uuid::new_v4().to_string();
        debug!(
            connection = %origin,
            target = %target_id,
            placed_on = %chosen,
            newly_placed,
            caller_request_id = %caller_request_id,
            forwarded_request_id = %fresh_id,
            "Proxying request"
        );

        let key = PendingKey {
            connection: chosen,
            request_id: fresh_id.clone(),
        };
        self.pending.insert(
            key.clone(),
            PendingCall {
                origin,
                caller_request_id: caller_request_id.clone(),
            },
        );
        self.metrics.requests_routed.fetch_add(1, Ordering::Relaxed);

        let forwarded = Envelope::Request {
            request_id: fresh_id,
            target,
            sender,
            payload,
        };
        if !self.send_to(chosen, forwarded).await {
            self.pending.remove(&key);
            self.respond_error(
                origin,
                caller_request_id,
                WireError::Transport {
                    message: format!("placement connection {chosen} is gone"),
                },
            )
            .await;
            return;
        }

        // Watchdog: an unanswered call faults with a timeout and is removed.
        let inner = self.clone();
        let timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, call)) = inner.pending.remove(&key) {
                inner.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target_connection = %key.connection,
                    request_id = %key.request_id,
                    "Proxied RPC timed out"
                );
                inner
                    .respond_error(
                        call.origin,
                        call.caller_request_id,
                        WireError::Timeout {
                            operation: "proxied rpc".into(),
                            timeout_ms: timeout.as_millis() as u64,
                        },
                    )
                    .await;
            }
        });
    }

    /// Resolve the sticky placement for an agent id, choosing a random
    /// eligible connection on first use. Returns the connection and whether
    /// this is a new placement (the downstream hydration signal).
    fn resolve_placement(&self, target: &AgentId) -> Option<(ConnectionId, bool)> {
        if let Some(existing) = self.placement.get(target) {
            let conn = *existing.value();
            drop(existing);
            if self.connections.contains_key(&conn) {
                return Some((conn, false));
            }
            // Stale entry from a connection that dropped between purge and now.
            self.placement.remove(target);
        }

        let eligible: Vec<ConnectionId> = self
            .supported_types
            .get(target.agent_type())?
            .iter()
            .filter(|c| self.connections.contains_key(*c))
            .copied()
            .collect();
        let chosen = *eligible.choose(&mut rand::thread_rng())?;
        self.placement.insert(target.clone(), chosen);
        Some((chosen, true))
    }

    async fn handle_response(
        &self,
        conn: ConnectionId,
        request_id: String,
        payload: Option<mesh_runtime::Payload>,
        error: Option<WireError>,
    ) {
        let key = PendingKey {
            connection: conn,
            request_id,
        };
        let Some((_, call)) = self.pending.remove(&key) else {
            // Correlation mismatch: late or spurious response. Not fatal.
            self.metrics
                .correlation_mismatches
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                connection = %conn,
                request_id = %key.request_id,
                "Response with no matching pending call; discarding"
            );
            return;
        };

        self.metrics.responses_matched.fetch_add(1, Ordering::Relaxed);
        self.send_to(
            call.origin,
            Envelope::Response {
                request_id: call.caller_request_id,
                payload,
                error,
            },
        )
        .await;
    }

    /// Broadcast to one representative connection per supported agent type,
    /// concurrently; individual send failures are logged, not propagated.
    async fn handle_publish(
        &self,
        origin: ConnectionId,
        message_id: String,
        topic: String,
        sender: Option<String>,
        payload: mesh_runtime::Payload,
    ) {
        let mut representatives = Vec::new();
        for entry in self.supported_types.iter() {
            let alive: Vec<ConnectionId> = entry
                .value()
                .iter()
                .filter(|c| self.connections.contains_key(*c))
                .copied()
                .collect();
            if let Some(conn) = alive.choose(&mut rand::thread_rng()) {
                representatives.push((entry.key().clone(), *conn));
            }
        }

        debug!(
            connection = %origin,
            topic = %topic,
            message_id = %message_id,
            representatives = representatives.len(),
            "Broadcasting event"
        );
        self.metrics.events_broadcast.fetch_add(1, Ordering::Relaxed);

        let sends = representatives.into_iter().map(|(agent_type, conn)| {
            let envelope = Envelope::Publish {
                message_id: message_id.clone(),
                topic: topic.clone(),
                sender: sender.clone(),
                payload: payload.clone(),
            };
            async move {
                if !self.send_to(conn, envelope).await {
                    warn!(
                        connection = %conn,
                        agent_type = %agent_type,
                        "Broadcast send failed; other representatives unaffected"
                    );
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    async fn handle_register_type(
        &self,
        conn: ConnectionId,
        request_id: String,
        agent_type: String,
    ) {
        let error = match agent_type.parse::<AgentType>() {
            Ok(ty) => {
                let mut conns = self.supported_types.entry(ty.clone()).or_default();
                if conns.contains(&conn) {
                    Some(
                        RuntimeError::duplicate_registration(format!(
                            "connection {conn} already registered type {ty}"
                        ))
                        .to_string(),
                    )
                } else {
                    conns.push(conn);
                    info!(connection = %conn, agent_type = %ty, "Connection registered agent type");
                    None
                }
            }
            Err(e) => Some(e.to_string()),
        };
        self.send_to(
            conn,
            Envelope::RegisterAgentTypeResponse { request_id, error },
        )
        .await;
    }

    async fn handle_add_subscription(
        &self,
        conn: ConnectionId,
        request_id: String,
        subscription: Subscription,
    ) {
        let error = match self.subscriptions.add(subscription.clone()) {
            Ok(()) => None,
            // Workers re-announce their subscriptions after every reconnect;
            // replaying an id with the identical rule is idempotent. Only a
            // conflicting rule under the same id is an actual error.
            Err(RuntimeError::DuplicateRegistration { .. })
                if self.subscriptions.get(subscription.id()).as_ref() == Some(&subscription) =>
            {
                debug!(connection = %conn, subscription_id = %subscription.id(), "Subscription re-announced");
                None
            }
            Err(e) => Some(e.to_string()),
        };
        if let Some(error) = &error {
            self.metrics
                .subscription_conflicts
                .fetch_add(1, Ordering::Relaxed);
            warn!(connection = %conn, error = %error, "Subscription rejected");
        }
        self.send_to(conn, Envelope::AddSubscriptionResponse { request_id, error })
            .await;
    }

    async fn respond_error(&self, conn: ConnectionId, request_id: String, error: WireError) {
        self.send_to(
            conn,
            Envelope::Response {
                request_id,
                payload: None,
                error: Some(error),
            },
        )
        .await;
    }

    /// Queue an envelope on a connection's outbound queue, waiting when the
    /// queue is full. Returns false if the connection is gone.
    async fn send_to(&self, conn: ConnectionId, envelope: Envelope) -> bool {
        let Some(handle) = self.connections.get(&conn) else {
            debug!(connection = %conn, kind = envelope.kind(), "Dropping envelope for missing connection");
            return false;
        };
        let outbound = handle.outbound.clone();
        drop(handle);
        outbound.send(envelope).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_runtime::Payload;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn test_gateway(timeout_ms: u64) -> Gateway {
        Gateway::new(GatewayConfig {
            rpc_timeout: Duration::from_millis(timeout_ms),
            ..GatewayConfig::default()
        })
    }

    fn attach_pair(gateway: &Gateway) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        gateway.attach(server);
        client
    }

    async fn register_type(stream: &mut DuplexStream, agent_type: &str) {
        write_frame(
            stream,
            &Envelope::RegisterAgentType {
                request_id: Uuid::new_v4().to_string(),
                agent_type: agent_type.into(),
            },
        )
        .await
        .unwrap();
        match read_frame(stream).await.unwrap().unwrap() {
            Envelope::RegisterAgentTypeResponse { error: None, .. } => {}
            other => panic!("unexpected ack: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_proxy_substitutes_and_restores_request_ids() {
        let gateway = test_gateway(5_000);
        let mut worker = attach_pair(&gateway);
        let mut caller = attach_pair(&gateway);

        register_type(&mut worker, "echo").await;

        write_frame(
            &mut caller,
            &Envelope::Request {
                request_id: "caller-1".into(),
                target: "echo/default".into(),
                sender: None,
                payload: Payload::new("task", json!({ "id": "t1" })),
            },
        )
        .await
        .unwrap();

        // The worker sees a freshly minted id, never the caller's.
        let forwarded_id = match read_frame(&mut worker).await.unwrap().unwrap() {
            Envelope::Request {
                request_id, target, ..
            } => {
                assert_eq!(target, "echo/default");
                assert_ne!(request_id, "caller-1");
                request_id
            }
            other => panic!("unexpected envelope: {other:?}"),
        };

        write_frame(
            &mut worker,
            &Envelope::Response {
                request_id: forwarded_id,
                payload: Some(Payload::new("done", json!({ "id": "t1" }))),
                error: None,
            },
        )
        .await
        .unwrap();

        // The caller gets its own id back; the internal id never leaks.
        match read_frame(&mut caller).await.unwrap().unwrap() {
            Envelope::Response {
                request_id,
                payload,
                error,
            } => {
                assert_eq!(request_id, "caller-1");
                assert!(error.is_none());
                assert_eq!(payload.unwrap().tag, "done");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }

        assert_eq!(gateway.pending_calls(), 0);
        assert_eq!(gateway.stats().responses_matched, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_immediately() {
        let gateway = test_gateway(5_000);
        let mut caller = attach_pair(&gateway);

        write_frame(
            &mut caller,
            &Envelope::Request {
                request_id: "caller-1".into(),
                target: "ghost/default".into(),
                sender: None,
                payload: Payload::new("task", json!(null)),
            },
        )
        .await
        .unwrap();

        match read_frame(&mut caller).await.unwrap().unwrap() {
            Envelope::Response { request_id, error, .. } => {
                assert_eq!(request_id, "caller-1");
                match error.unwrap() {
                    WireError::Addressing { message } => {
                        assert!(message.contains("agent not found"));
                    }
                    other => panic!("unexpected error: {other:?}"),
                }
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_faults_and_cleans_pending() {
        let gateway = test_gateway(100);
        let mut worker = attach_pair(&gateway);
        let mut caller = attach_pair(&gateway);

        register_type(&mut worker, "slow").await;

        write_frame(
            &mut caller,
            &Envelope::Request {
                request_id: "caller-1".into(),
                target: "slow/default".into(),
                sender: None,
                payload: Payload::new("task", json!(null)),
            },
        )
        .await
        .unwrap();

        // The worker receives the request, then its connection drops mid-RPC.
        let _ = read_frame(&mut worker).await.unwrap().unwrap();
        assert_eq!(gateway.pending_calls(), 1);
        drop(worker);

        // The pending call resolves via the timeout, not by hanging, and
        // carries its category on the wire.
        match read_frame(&mut caller).await.unwrap().unwrap() {
            Envelope::Response { request_id, error, .. } => {
                assert_eq!(request_id, "caller-1");
                assert!(matches!(error, Some(WireError::Timeout { .. })));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
        assert_eq!(gateway.pending_calls(), 0);
        assert_eq!(gateway.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_correlation_mismatch_is_non_fatal() {
        let gateway = test_gateway(5_000);
        let mut worker = attach_pair(&gateway);

        write_frame(
            &mut worker,
            &Envelope::Response {
                request_id: "never-issued".into(),
                payload: None,
                error: None,
            },
        )
        .await
        .unwrap();

        // The connection survives and still registers types afterwards.
        register_type(&mut worker, "echo").await;
        assert_eq!(gateway.stats().correlation_mismatches, 1);
        assert_eq!(
            gateway.connections_for_type(&AgentType::new("echo").unwrap()),
            1
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_one_representative_per_type() {
        let gateway = test_gateway(5_000);
        let mut host_a = attach_pair(&gateway);
        let mut host_b = attach_pair(&gateway);
        let mut publisher = attach_pair(&gateway);

        register_type(&mut host_a, "worker").await;
        register_type(&mut host_b, "worker").await;

        write_frame(
            &mut publisher,
            &Envelope::Publish {
                message_id: "m1".into(),
                topic: "tasks/default".into(),
                sender: None,
                payload: Payload::new("task", json!({ "id": "t1" })),
            },
        )
        .await
        .unwrap();

        // Exactly one of the two hosting connections receives the event.
        let race = async {
            tokio::select! {
                frame = read_frame(&mut host_a) => ("a", frame),
                frame = read_frame(&mut host_b) => ("b", frame),
            }
        };
        let (which, frame) = tokio::time::timeout(Duration::from_secs(1), race)
            .await
            .unwrap();
        match frame.unwrap().unwrap() {
            Envelope::Publish { message_id, .. } => assert_eq!(message_id, "m1"),
            other => panic!("unexpected envelope: {other:?}"),
        }

        // The other host stays quiet.
        let (mut quiet, _) = if which == "a" {
            (host_b, host_a)
        } else {
            (host_a, host_b)
        };
        let silent = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut quiet)).await;
        assert!(silent.is_err(), "second host unexpectedly received the event");
    }

    #[tokio::test]
    async fn test_teardown_purges_types_and_placement() {
        let gateway = test_gateway(5_000);
        let mut worker = attach_pair(&gateway);
        register_type(&mut worker, "echo").await;
        assert_eq!(
            gateway.connections_for_type(&AgentType::new("echo").unwrap()),
            1
        );

        drop(worker);
        // Teardown runs on the connection's read loop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            gateway.connections_for_type(&AgentType::new("echo").unwrap()),
            0
        );
        assert_eq!(gateway.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribing_identical_rule_is_idempotent() {
        use mesh_runtime::Subscription;

        let gateway = test_gateway(5_000);
        let mut worker = attach_pair(&gateway);
        let collector = AgentType::new("collector").unwrap();
        let rule = Subscription::exact_with_id("s1", "tasks", collector.clone());

        for request_id in ["r1", "r2"] {
            write_frame(
                &mut worker,
                &Envelope::AddSubscription {
                    request_id: request_id.into(),
                    subscription: rule.clone(),
                },
            )
            .await
            .unwrap();
            // A replayed identical rule acks cleanly, same as the first add.
            match read_frame(&mut worker).await.unwrap().unwrap() {
                Envelope::AddSubscriptionResponse { error: None, .. } => {}
                other => panic!("unexpected ack: {other:?}"),
            }
        }
        assert_eq!(gateway.stats().subscription_conflicts, 0);

        // Same id bound to a different rule is a genuine conflict.
        write_frame(
            &mut worker,
            &Envelope::AddSubscription {
                request_id: "r3".into(),
                subscription: Subscription::exact_with_id("s1", "events", collector),
            },
        )
        .await
        .unwrap();
        match read_frame(&mut worker).await.unwrap().unwrap() {
            Envelope::AddSubscriptionResponse { error: Some(e), .. } => {
                assert!(e.contains("Duplicate registration"));
            }
            other => panic!("unexpected ack: {other:?}"),
        }
        assert_eq!(gateway.stats().subscription_conflicts, 1);
    }

    #[tokio::test]
    async fn test_detach_closes_the_connection() {
        let gateway = test_gateway(5_000);
        let mut worker = attach_pair(&gateway);
        register_type(&mut worker, "echo").await;

        let ids = gateway.connection_ids();
        assert_eq!(ids.len(), 1);
        assert!(gateway.detach(ids[0]));
        assert!(!gateway.detach(ids[0]));

        // The worker side observes end-of-stream, and routing state is gone.
        let eof = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut worker))
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());
        assert_eq!(gateway.connection_count(), 0);
        assert_eq!(
            gateway.connections_for_type(&AgentType::new("echo").unwrap()),
            0
        );
    }

    #[tokio::test]
    async fn test_duplicate_type_registration_rejected_per_connection() {
        let gateway = test_gateway(5_000);
        let mut worker = attach_pair(&gateway);
        register_type(&mut worker, "echo").await;

        write_frame(
            &mut worker,
            &Envelope::RegisterAgentType {
                request_id: "r2".into(),
                agent_type: "echo".into(),
            },
        )
        .await
        .unwrap();
        match read_frame(&mut worker).await.unwrap().unwrap() {
            Envelope::RegisterAgentTypeResponse { error: Some(e), .. } => {
                assert!(e.contains("Duplicate registration"));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }
}
