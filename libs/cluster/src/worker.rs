//! Worker Client
//!
//! Hosts agent instances in this process and keeps exactly one logical
//! outbound connection to a gateway, recreated transparently on fault. Two
//! loops share the connection: a write loop draining the single bounded
//! outbound queue in enqueue order, and a read loop dispatching inbound
//! envelopes. All unicast and broadcast traffic flows through the gateway,
//! so send/publish semantics match the in-process runtime exactly.

use crate::config::WorkerConfig;
use crate::connect::{BoxedStream, Connector};
use crate::protocol::{read_frame, write_frame, Envelope, WireError};
use dashmap::DashMap;
use mesh_runtime::{
    AgentCourier, AgentFactory, AgentId, AgentRegistry, AgentType, MessageContext, MessageOptions,
    Payload, Result, RuntimeError, Subscription, SubscriptionRegistry, TopicId,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connection lifecycle, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// An RPC awaiting its response from the gateway, keyed by the worker-local
/// request id. The caller's own correlation id is kept so completion logs
/// line up with what the caller observed.
struct PendingRpc {
    caller_message_id: String,
    recipient: String,
    reply: oneshot::Sender<Result<Payload>>,
}

/// Registration replayed after every (re)connect.
struct Registration {
    agent_type: AgentType,
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, Default)]
struct WorkerMetrics {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    correlation_mismatches: AtomicU64,
    publishes_sent: AtomicU64,
    inbound_requests: AtomicU64,
    inbound_publishes: AtomicU64,
    reconnects: AtomicU64,
}

/// Snapshot of worker counters.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub correlation_mismatches: u64,
    pub publishes_sent: u64,
    pub inbound_requests: u64,
    pub inbound_publishes: u64,
    pub reconnects: u64,
}

struct WorkerInner {
    config: WorkerConfig,
    connector: Arc<dyn Connector>,
    registry: AgentRegistry,
    subscriptions: SubscriptionRegistry,
    outbound: mpsc::Sender<Envelope>,
    pending: DashMap<String, PendingRpc>,
    /// Registration/subscription acks awaited by request id.
    control: DashMap<String, oneshot::Sender<Option<String>>>,
    /// Guarded together with state transitions so a registration is either
    /// in the replay snapshot or announced by its own caller, never neither.
    registrations: parking_lot::Mutex<Vec<Registration>>,
    state_tx: watch::Sender<ConnectionState>,
    metrics: WorkerMetrics,
    shutdown: CancellationToken,
}

/// Client side of a worker process.
///
/// Cheap to clone; clones share one connection and agent registry.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<WorkerInner>,
    supervisor: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
}

impl WorkerClient {
    pub fn new(connector: Arc<dyn Connector>, config: WorkerConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(WorkerInner {
            config,
            connector,
            registry: AgentRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            outbound,
            pending: DashMap::new(),
            control: DashMap::new(),
            registrations: parking_lot::Mutex::new(Vec::new()),
            state_tx,
            metrics: WorkerMetrics::default(),
            shutdown: CancellationToken::new(),
        });
        let supervisor = tokio::spawn(WorkerInner::supervise(inner.clone(), outbound_rx));
        Self {
            inner,
            supervisor: Arc::new(AsyncMutex::new(Some(supervisor))),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the connection is established.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Connected {
                return Ok(());
            }
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    return Err(RuntimeError::cancelled("wait for connection"));
                }
                changed = rx.changed() => {
                    changed.map_err(|_| RuntimeError::transport("worker client shut down"))?;
                }
            }
        }
    }

    /// Register a factory for an agent type hosted by this worker, together
    /// with its declared topic subscriptions.
    ///
    /// Installs the implicit `"<agentType>:"` prefix subscription alongside
    /// the declared ones, announces the type to the gateway when connected,
    /// and re-announces automatically after every reconnect.
    pub async fn register_agent_factory(
        &self,
        agent_type: AgentType,
        factory: AgentFactory,
        subscriptions: Vec<Subscription>,
    ) -> Result<()> {
        self.inner
            .registry
            .register_factory(agent_type.clone(), factory)?;

        let mut all_subscriptions = subscriptions;
        all_subscriptions.push(Subscription::prefix_with_id(
            format!("direct:{agent_type}"),
            format!("{agent_type}:"),
            agent_type.clone(),
        ));
        for subscription in &all_subscriptions {
            self.inner.subscriptions.add(subscription.clone())?;
        }

        // Record for replay; announce immediately only if connected now,
        // otherwise the replay at connect time covers it.
        let announce_now = {
            let mut registrations = self.inner.registrations.lock();
            registrations.push(Registration {
                agent_type: agent_type.clone(),
                subscriptions: all_subscriptions.clone(),
            });
            *self.inner.state_tx.borrow() == ConnectionState::Connected
        };
        if announce_now {
            self.inner
                .announce(&agent_type, &all_subscriptions)
                .await?;
        }
        Ok(())
    }

    /// Add a standalone subscription, forwarding it to the gateway when
    /// connected.
    pub async fn add_subscription(&self, subscription: Subscription) -> Result<()> {
        self.inner.subscriptions.add(subscription.clone())?;
        if *self.inner.state_tx.borrow() == ConnectionState::Connected {
            self.inner.announce_subscription(&subscription).await?;
        }
        Ok(())
    }

    pub fn remove_subscription(&self, id: &str) -> Result<()> {
        self.inner.subscriptions.remove(id).map(|_| ())
    }

    /// Unicast RPC through the gateway.
    ///
    /// The envelope carries a worker-local request id, never the caller's
    /// correlation id; the pending table restores the association when the
    /// response arrives. Resolves with the remote handler's result, the
    /// safety timeout, or cancellation, whichever comes first.
    pub async fn send(
        &self,
        payload: Payload,
        recipient: AgentId,
        options: MessageOptions,
    ) -> Result<Payload> {
        self.inner.send_inner(payload, recipient, options).await
    }

    /// Broadcast publish through the gateway. Returns once the envelope is
    /// queued; delivery outcomes are per-recipient and never propagate back.
    pub async fn publish(
        &self,
        payload: Payload,
        topic: TopicId,
        options: MessageOptions,
    ) -> Result<()> {
        self.inner.publish_inner(payload, topic, options).await
    }

    /// Snapshot every locally hosted agent's state.
    pub async fn save_state(&self) -> Result<HashMap<String, Value>> {
        self.inner.registry.save_state().await
    }

    /// Restore locally hosted agents from a prior snapshot. Entries for
    /// types this worker does not host are skipped.
    pub async fn load_state(&self, snapshot: &HashMap<String, Value>) -> Result<()> {
        let courier = self.inner.courier();
        self.inner.registry.load_state(snapshot, courier).await
    }

    pub fn live_instances(&self) -> usize {
        self.inner.registry.live_instances()
    }

    pub fn stats(&self) -> WorkerStats {
        let m = &self.inner.metrics;
        WorkerStats {
            requests_sent: m.requests_sent.load(Ordering::Relaxed),
            responses_received: m.responses_received.load(Ordering::Relaxed),
            correlation_mismatches: m.correlation_mismatches.load(Ordering::Relaxed),
            publishes_sent: m.publishes_sent.load(Ordering::Relaxed),
            inbound_requests: m.inbound_requests.load(Ordering::Relaxed),
            inbound_publishes: m.inbound_publishes.load(Ordering::Relaxed),
            reconnects: m.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop the client: refuse new writes, fail pending RPCs, await the
    /// supervisor, release the connection.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.fail_pending("worker client stopped");
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Supervisor task panicked during shutdown");
            }
        }
        self.inner
            .state_tx
            .send_replace(ConnectionState::Disconnected);
        info!("Worker client stopped");
    }
}

impl WorkerInner {
    fn courier(self: &Arc<Self>) -> Arc<dyn AgentCourier> {
        Arc::new(WorkerCourier {
            inner: Arc::downgrade(self),
        })
    }

    /// Queue one envelope on the single outbound queue, waiting when full.
    async fn enqueue(&self, envelope: Envelope) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::transport("worker client is shut down"));
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| RuntimeError::transport("outbound queue closed"))
    }

    async fn send_inner(
        self: &Arc<Self>,
        payload: Payload,
        recipient: AgentId,
        options: MessageOptions,
    ) -> Result<Payload> {
        let caller_message_id = options.message_id_or_fresh();
        let local_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            local_id.clone(),
            PendingRpc {
                caller_message_id: caller_message_id.clone(),
                recipient: recipient.to_string(),
                reply: reply_tx,
            },
        );
        debug!(
            recipient = %recipient,
            caller_message_id = %caller_message_id,
            local_request_id = %local_id,
            "Queueing outbound RPC"
        );

        let envelope = Envelope::Request {
            request_id: local_id.clone(),
            target: recipient.to_string(),
            sender: options.sender.as_ref().map(|s| s.to_string()),
            payload,
        };
        if let Err(e) = self.enqueue(envelope).await {
            self.pending.remove(&local_id);
            return Err(e);
        }
        self.metrics.requests_sent.fetch_add(1, Ordering::Relaxed);

        // Safety timeout worker-side, independent of the gateway's. The
        // gateway timeout normally fires first and arrives as an error
        // Response through the ordinary correlation path.
        tokio::select! {
            reply = reply_rx => match reply {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::transport("worker client shut down")),
            },
            _ = options.cancellation.cancelled() => {
                self.pending.remove(&local_id);
                Err(RuntimeError::cancelled(format!("rpc to {recipient}")))
            }
            _ = tokio::time::sleep(self.config.rpc_timeout + Duration::from_secs(5)) => {
                self.pending.remove(&local_id);
                Err(RuntimeError::timeout(
                    format!("rpc to {recipient}"),
                    self.config.rpc_timeout.as_millis() as u64 + 5_000,
                ))
            }
        }
    }

    async fn publish_inner(
        &self,
        payload: Payload,
        topic: TopicId,
        options: MessageOptions,
    ) -> Result<()> {
        let envelope = Envelope::Publish {
            message_id: options.message_id_or_fresh(),
            topic: topic.to_string(),
            sender: options.sender.as_ref().map(|s| s.to_string()),
            payload,
        };
        self.enqueue(envelope).await?;
        self.metrics.publishes_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Announce one agent type and its subscriptions, awaiting each ack.
    async fn announce(&self, agent_type: &AgentType, subscriptions: &[Subscription]) -> Result<()> {
        let ack = self.control_slot();
        self.enqueue(Envelope::RegisterAgentType {
            request_id: ack.0,
            agent_type: agent_type.to_string(),
        })
        .await?;
        self.await_ack(ack.1, "agent type registration").await?;

        for subscription in subscriptions {
            self.announce_subscription(subscription).await?;
        }
        Ok(())
    }

    async fn announce_subscription(&self, subscription: &Subscription) -> Result<()> {
        let ack = self.control_slot();
        self.enqueue(Envelope::AddSubscription {
            request_id: ack.0,
            subscription: subscription.clone(),
        })
        .await?;
        self.await_ack(ack.1, "subscription registration").await
    }

    fn control_slot(&self) -> (String, oneshot::Receiver<Option<String>>) {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.control.insert(request_id.clone(), tx);
        (request_id, rx)
    }

    async fn await_ack(
        &self,
        rx: oneshot::Receiver<Option<String>>,
        what: &str,
    ) -> Result<()> {
        let ack = tokio::time::timeout(self.config.registration_timeout, rx)
            .await
            .map_err(|_| {
                RuntimeError::timeout(what, self.config.registration_timeout.as_millis() as u64)
            })?
            .map_err(|_| RuntimeError::transport("worker client shut down"))?;
        match ack {
            None => Ok(()),
            Some(rejection) => {
                error!(what, error = %rejection, "Gateway rejected registration");
                Err(RuntimeError::transport(format!(
                    "gateway rejected {what}: {rejection}"
                )))
            }
        }
    }

    fn fail_pending(&self, reason: &str) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, call)) = self.pending.remove(&key) {
                debug!(
                    caller_message_id = %call.caller_message_id,
                    reason,
                    "Failing pending RPC"
                );
                let _ = call.reply.send(Err(RuntimeError::transport(reason)));
            }
        }
        self.control.clear();
    }

    /// Supervisor: owns the outbound queue receiver and the reconnect loop.
    /// One connection attempt is in flight at any time; backoff doubles up
    /// to the configured ceiling and resets after a successful connect.
    async fn supervise(inner: Arc<Self>, mut outbound_rx: mpsc::Receiver<Envelope>) {
        let mut backoff = inner.config.reconnect_backoff;
        // Frame taken off the queue but not yet on the wire; survives
        // reconnects so nothing is silently dropped.
        let mut carry: Option<Envelope> = None;
        let mut first_attempt = true;

        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }
            if !first_attempt {
                inner.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(inner.config.reconnect_max_backoff);
            }
            first_attempt = false;

            inner.state_tx.send_replace(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                attempt = inner.connector.connect() => attempt,
            };
            let stream = match attempt {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Connect failed");
                    inner.state_tx.send_replace(ConnectionState::Disconnected);
                    continue;
                }
            };
            backoff = inner.config.reconnect_backoff;
            info!("Connected to gateway");

            let (read_half, write_half) = tokio::io::split(stream);
            let conn_token = inner.shutdown.child_token();
            let read_task = tokio::spawn(Self::read_loop(
                inner.clone(),
                read_half,
                conn_token.clone(),
            ));

            // Publish Connected under the registrations lock so a factory
            // registered concurrently is either in this snapshot or sees
            // Connected and announces itself.
            let replay: Vec<(AgentType, Vec<Subscription>)> = {
                let registrations = inner.registrations.lock();
                inner.state_tx.send_replace(ConnectionState::Connected);
                registrations
                    .iter()
                    .map(|r| (r.agent_type.clone(), r.subscriptions.clone()))
                    .collect()
            };
            if !replay.is_empty() {
                let inner_replay = inner.clone();
                tokio::spawn(async move {
                    for (agent_type, subscriptions) in replay {
                        if let Err(e) = inner_replay.announce(&agent_type, &subscriptions).await {
                            error!(agent_type = %agent_type, error = %e, "Registration replay failed");
                        }
                    }
                });
            }

            carry = Self::write_loop(write_half, &mut outbound_rx, &conn_token, carry).await;
            conn_token.cancel();
            if let Err(e) = read_task.await {
                warn!(error = %e, "Read task panicked");
            }
            inner.state_tx.send_replace(ConnectionState::Disconnected);
            warn!("Gateway connection lost");
        }

        // Shutdown: anything still queued is failed, not silently dropped.
        outbound_rx.close();
        let mut dropped = usize::from(carry.is_some());
        while outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "Discarding queued writes at shutdown");
        }
        inner.fail_pending("worker client stopped");
    }

    /// Drain the outbound queue onto one connection. Returns the frame that
    /// failed to transmit, if any, so the next connection retries it first.
    async fn write_loop(
        mut writer: WriteHalf<BoxedStream>,
        outbound_rx: &mut mpsc::Receiver<Envelope>,
        conn_token: &CancellationToken,
        mut carry: Option<Envelope>,
    ) -> Option<Envelope> {
        loop {
            let envelope = match carry.take() {
                Some(envelope) => envelope,
                None => {
                    tokio::select! {
                        _ = conn_token.cancelled() => break,
                        maybe = outbound_rx.recv() => match maybe {
                            Some(envelope) => envelope,
                            None => break,
                        },
                    }
                }
            };
            if let Err(e) = write_frame(&mut writer, &envelope).await {
                warn!(error = %e, kind = envelope.kind(), "Write failed; frame retried after reconnect");
                let _ = writer.shutdown().await;
                return Some(envelope);
            }
        }
        let _ = writer.shutdown().await;
        None
    }

    async fn read_loop(
        inner: Arc<Self>,
        mut reader: ReadHalf<BoxedStream>,
        conn_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = conn_token.cancelled() => break,
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(envelope)) => inner.handle_envelope(envelope),
                    Ok(None) => {
                        debug!("Gateway closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read failed");
                        break;
                    }
                },
            }
        }
        // Wake the write loop so the supervisor reconnects.
        conn_token.cancel();
    }

    fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Request {
                request_id,
                target,
                sender,
                payload,
            } => {
                self.metrics.inbound_requests.fetch_add(1, Ordering::Relaxed);
                let inner = self.clone();
                // Handlers run off the read loop so a slow agent cannot
                // stall inbound traffic.
                tokio::spawn(async move {
                    inner
                        .handle_inbound_request(request_id, target, sender, payload)
                        .await;
                });
            }
            Envelope::Response {
                request_id,
                payload,
                error,
            } => self.handle_inbound_response(request_id, payload, error),
            Envelope::Publish {
                message_id,
                topic,
                sender,
                payload,
            } => {
                self.metrics.inbound_publishes.fetch_add(1, Ordering::Relaxed);
                let inner = self.clone();
                tokio::spawn(async move {
                    inner
                        .handle_inbound_publish(message_id, topic, sender, payload)
                        .await;
                });
            }
            Envelope::RegisterAgentTypeResponse { request_id, error }
            | Envelope::AddSubscriptionResponse { request_id, error } => {
                match self.control.remove(&request_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(error);
                    }
                    None => {
                        // No waiter left (e.g. it timed out); a failure here
                        // must still be visible.
                        if let Some(error) = error {
                            error!(request_id = %request_id, error = %error, "Unacknowledged registration failure");
                        }
                    }
                }
            }
            other => {
                warn!(kind = other.kind(), "Unexpected envelope at worker; discarding");
            }
        }
    }

    async fn handle_inbound_request(
        self: &Arc<Self>,
        request_id: String,
        target: String,
        sender: Option<String>,
        payload: Payload,
    ) {
        let result = self
            .deliver_local_rpc(&request_id, &target, sender, payload)
            .await;
        let response = match result {
            Ok(payload) => Envelope::Response {
                request_id,
                payload: Some(payload),
                error: None,
            },
            Err(e) => Envelope::Response {
                request_id,
                payload: None,
                error: Some(WireError::from(&e)),
            },
        };
        if let Err(e) = self.enqueue(response).await {
            warn!(error = %e, "Dropping response for a dead connection");
        }
    }

    async fn deliver_local_rpc(
        self: &Arc<Self>,
        request_id: &str,
        target: &str,
        sender: Option<String>,
        payload: Payload,
    ) -> Result<Payload> {
        let target: AgentId = target.parse()?;
        let sender = parse_sender(sender);
        let ctx = MessageContext::rpc(request_id.to_string(), sender, self.shutdown.child_token());
        self.registry
            .deliver(&target, payload, &ctx, self.courier())
            .await
    }

    fn handle_inbound_response(
        &self,
        request_id: String,
        payload: Option<Payload>,
        error: Option<WireError>,
    ) {
        let Some((_, call)) = self.pending.remove(&request_id) else {
            self.metrics
                .correlation_mismatches
                .fetch_add(1, Ordering::Relaxed);
            debug!(request_id = %request_id, "Response with no pending RPC; discarding");
            return;
        };
        self.metrics
            .responses_received
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            local_request_id = %request_id,
            caller_message_id = %call.caller_message_id,
            "RPC completed"
        );
        // The wire error carries its category, so a remote timeout or
        // addressing failure surfaces to the caller as that same variant.
        let result = match error {
            Some(wire) => Err(wire.into_runtime_error(&call.recipient)),
            None => match payload {
                Some(payload) => Ok(payload),
                None => Err(RuntimeError::delivery(
                    call.recipient,
                    "response carried neither payload nor error",
                )),
            },
        };
        let _ = call.reply.send(result);
    }

    /// Deliver a broadcast to every locally hosted, subscription-matched
    /// recipient other than the sender. Faults are logged per recipient.
    async fn handle_inbound_publish(
        self: &Arc<Self>,
        message_id: String,
        topic: String,
        sender: Option<String>,
        payload: Payload,
    ) {
        let topic: TopicId = match topic.parse() {
            Ok(topic) => topic,
            Err(e) => {
                warn!(error = %e, "Discarding event with malformed topic");
                return;
            }
        };
        let sender = parse_sender(sender);
        let recipients: Vec<AgentId> = self
            .subscriptions
            .match_topic(&topic)
            .into_iter()
            .filter(|id| Some(id) != sender.as_ref())
            .filter(|id| self.registry.has_factory(id.agent_type()))
            .collect();

        debug!(
            topic = %topic,
            message_id = %message_id,
            recipients = recipients.len(),
            "Delivering inbound event"
        );

        let topic_label = topic.to_string();
        let deliveries = recipients.into_iter().map(|recipient| {
            let ctx = MessageContext::broadcast(
                message_id.clone(),
                topic.clone(),
                sender.clone(),
                self.shutdown.child_token(),
            );
            let payload = payload.clone();
            let courier = self.courier();
            let topic_label = topic_label.clone();
            async move {
                if let Err(e) = self.registry.deliver(&recipient, payload, &ctx, courier).await {
                    warn!(
                        recipient = %recipient,
                        topic = %topic_label,
                        error = %e,
                        "Broadcast recipient faulted; other deliveries unaffected"
                    );
                }
            }
        });
        futures::future::join_all(deliveries).await;
    }
}

fn parse_sender(sender: Option<String>) -> Option<AgentId> {
    sender.and_then(|raw| match raw.parse() {
        Ok(id) => Some(id),
        Err(e) => {
            debug!(sender = %raw, error = %e, "Ignoring malformed sender address");
            None
        }
    })
}

/// Capability handle for agents hosted by this worker; sends and publishes
/// issued inside handlers go through the gateway like any other traffic.
struct WorkerCourier {
    inner: Weak<WorkerInner>,
}

impl WorkerCourier {
    fn inner(&self) -> Result<Arc<WorkerInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| RuntimeError::transport("worker client has shut down"))
    }
}

#[async_trait::async_trait]
impl AgentCourier for WorkerCourier {
    async fn send(
        &self,
        payload: Payload,
        recipient: AgentId,
        options: MessageOptions,
    ) -> Result<Payload> {
        self.inner()?.send_inner(payload, recipient, options).await
    }

    async fn publish(&self, payload: Payload, topic: TopicId, options: MessageOptions) -> Result<()> {
        self.inner()?.publish_inner(payload, topic, options).await
    }
}
