//! In-Process Runtime
//!
//! Single-process implementation of the send/publish/register contract.
//! Agents, subscriptions, and factories live in local maps; there is no
//! connection, placement, or correlation-id translation, so application
//! code is portable between this runtime and the distributed deployment.

use crate::identity::{AgentId, AgentType, TopicId};
use crate::message::{AgentCourier, AgentFactory, MessageContext, MessageOptions, Payload};
use crate::registry::AgentRegistry;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Runtime state shared between the public handle and agent couriers.
struct RuntimeCore {
    registry: AgentRegistry,
    subscriptions: SubscriptionRegistry,
    inflight: AtomicUsize,
    idle: Notify,
}

/// Single-process agent runtime.
///
/// Cheap to clone; clones share the same agent and subscription maps.
#[derive(Clone)]
pub struct InProcessRuntime {
    core: Arc<RuntimeCore>,
}

impl Default for InProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessRuntime {
    pub fn new() -> Self {
        Self {
            core: Arc::new(RuntimeCore {
                registry: AgentRegistry::new(),
                subscriptions: SubscriptionRegistry::new(),
                inflight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Register an agent-type factory.
    ///
    /// Also installs the implicit `"<agentType>:"` prefix subscription so
    /// point-to-point topic addressing works without extra configuration.
    pub fn register_agent_factory(&self, agent_type: AgentType, factory: AgentFactory) -> Result<()> {
        self.core.registry.register_factory(agent_type.clone(), factory)?;
        self.core.subscriptions.add(Subscription::prefix_with_id(
            format!("direct:{agent_type}"),
            format!("{agent_type}:"),
            agent_type,
        ))
    }

    pub fn add_subscription(&self, subscription: Subscription) -> Result<()> {
        self.core.subscriptions.add(subscription)
    }

    pub fn remove_subscription(&self, id: &str) -> Result<()> {
        self.core.subscriptions.remove(id).map(|_| ())
    }

    /// Unicast send: resolve/activate the recipient, invoke its handler,
    /// and return its result or propagate its fault to the caller.
    pub async fn send(
        &self,
        payload: Payload,
        recipient: AgentId,
        options: MessageOptions,
    ) -> Result<Payload> {
        self.core.send_inner(payload, recipient, options).await
    }

    /// Broadcast publish: deliver to every subscription-matched recipient
    /// except the sender itself. Recipient faults are logged, never
    /// propagated, and never block other recipients.
    pub async fn publish(
        &self,
        payload: Payload,
        topic: TopicId,
        options: MessageOptions,
    ) -> Result<()> {
        self.core.publish_inner(payload, topic, options).await
    }

    /// Snapshot every live agent's state, keyed by agent id string form.
    pub async fn save_state(&self) -> Result<HashMap<String, Value>> {
        self.core.registry.save_state().await
    }

    /// Restore agent state from a prior snapshot.
    pub async fn load_state(&self, snapshot: &HashMap<String, Value>) -> Result<()> {
        let courier = self.core.courier();
        self.core.registry.load_state(snapshot, courier).await
    }

    /// Wait until no send or publish is being dispatched.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.core.idle.notified();
            if self.core.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of constructed agent instances (observability aid).
    pub fn live_instances(&self) -> usize {
        self.core.registry.live_instances()
    }
}

impl RuntimeCore {
    fn courier(self: &Arc<Self>) -> Arc<dyn AgentCourier> {
        Arc::new(Courier {
            core: Arc::downgrade(self),
        })
    }

    fn dispatch_guard(self: &Arc<Self>) -> DispatchGuard {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        DispatchGuard { core: self.clone() }
    }

    async fn send_inner(
        self: &Arc<Self>,
        payload: Payload,
        recipient: AgentId,
        options: MessageOptions,
    ) -> Result<Payload> {
        let _guard = self.dispatch_guard();
        let ctx = MessageContext::rpc(
            options.message_id_or_fresh(),
            options.sender.clone(),
            options.cancellation.clone(),
        );
        debug!(recipient = %recipient, message_id = %ctx.message_id, "Dispatching unicast send");

        self.registry
            .deliver(&recipient, payload, &ctx, self.courier())
            .await
            .map_err(|e| match e {
                // Addressing/cancellation surface as-is; handler faults are
                // wrapped so the caller sees which recipient failed.
                RuntimeError::Addressing { .. }
                | RuntimeError::Cancelled { .. }
                | RuntimeError::Delivery { .. } => e,
                other => RuntimeError::delivery(recipient.to_string(), other.to_string()),
            })
    }

    async fn publish_inner(
        self: &Arc<Self>,
        payload: Payload,
        topic: TopicId,
        options: MessageOptions,
    ) -> Result<()> {
        let _guard = self.dispatch_guard();
        let message_id = options.message_id_or_fresh();
        let recipients: Vec<AgentId> = self
            .subscriptions
            .match_topic(&topic)
            .into_iter()
            .filter(|id| Some(id) != options.sender.as_ref())
            .collect();

        debug!(
            topic = %topic,
            message_id = %message_id,
            recipients = recipients.len(),
            "Dispatching publish"
        );

        let topic_label = topic.to_string();
        let deliveries = recipients.into_iter().map(|recipient| {
            let ctx = MessageContext::broadcast(
                message_id.clone(),
                topic.clone(),
                options.sender.clone(),
                options.cancellation.clone(),
            );
            let payload = payload.clone();
            let courier = self.courier();
            let topic_label = topic_label.clone();
            async move {
                if let Err(e) = self
                    .registry
                    .deliver(&recipient, payload, &ctx, courier)
                    .await
                {
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
        Ok(())
    }
}

/// Decrements the in-flight dispatch count and wakes idle waiters.
struct DispatchGuard {
    core: Arc<RuntimeCore>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if self.core.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.core.idle.notify_waiters();
        }
    }
}

/// Non-owning capability handle given to agents at construction.
struct Courier {
    core: Weak<RuntimeCore>,
}

impl Courier {
    fn core(&self) -> Result<Arc<RuntimeCore>> {
        self.core
            .upgrade()
            .ok_or_else(|| RuntimeError::transport("runtime has shut down"))
    }
}

#[async_trait]
impl AgentCourier for Courier {
    async fn send(
        &self,
        payload: Payload,
        recipient: AgentId,
        options: MessageOptions,
    ) -> Result<Payload> {
        self.core()?.send_inner(payload, recipient, options).await
    }

    async fn publish(&self, payload: Payload, topic: TopicId, options: MessageOptions) -> Result<()> {
        self.core()?.publish_inner(payload, topic, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ActivationContext, Agent};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Task {
        id: String,
    }

    #[derive(Serialize, Deserialize, Debug)]
    struct TaskResponse {
        task_id: String,
        handled_by: String,
    }

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn handle(&mut self, payload: Payload, ctx: &MessageContext) -> Result<Payload> {
            let task: Task = payload.decode()?;
            assert!(ctx.is_rpc);
            Payload::encode(
                "task_response",
                &TaskResponse {
                    task_id: task.id,
                    handled_by: "echo".into(),
                },
            )
        }
    }

    fn echo_factory() -> AgentFactory {
        Arc::new(|_ctx| Box::pin(async { Ok(Box::new(EchoAgent) as Box<dyn Agent>) }))
    }

    #[tokio::test]
    async fn test_send_returns_handler_response() {
        // Scenario: register "echo", send a task, response references its id.
        let runtime = InProcessRuntime::new();
        runtime
            .register_agent_factory(AgentType::new("echo").unwrap(), echo_factory())
            .unwrap();

        let response = runtime
            .send(
                Payload::encode("task", &Task { id: "t1".into() }).unwrap(),
                "echo/default".parse().unwrap(),
                MessageOptions::default(),
            )
            .await
            .unwrap();

        let decoded: TaskResponse = response.decode().unwrap();
        assert_eq!(decoded.task_id, "t1");
        runtime.wait_until_idle().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_type_fails_immediately() {
        let runtime = InProcessRuntime::new();
        let err = runtime
            .send(
                Payload::new("task", json!(null)),
                "missing/default".parse().unwrap(),
                MessageOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Addressing { .. }));
    }

    #[tokio::test]
    async fn test_unicast_fault_propagates_to_caller() {
        struct Faulty;

        #[async_trait]
        impl Agent for Faulty {
            async fn handle(&mut self, _p: Payload, _c: &MessageContext) -> Result<Payload> {
                Err(RuntimeError::delivery("faulty/default", "boom"))
            }
        }

        let runtime = InProcessRuntime::new();
        runtime
            .register_agent_factory(
                AgentType::new("faulty").unwrap(),
                Arc::new(|_ctx| Box::pin(async { Ok(Box::new(Faulty) as Box<dyn Agent>) })),
            )
            .unwrap();

        let err = runtime
            .send(
                Payload::new("task", json!(null)),
                "faulty/default".parse().unwrap(),
                MessageOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    /// Worker that records what it saw and republishes a response payload.
    struct TaskWorker {
        name: &'static str,
        id: AgentId,
        runtime: Arc<dyn AgentCourier>,
    }

    #[async_trait]
    impl Agent for TaskWorker {
        async fn handle(&mut self, payload: Payload, _ctx: &MessageContext) -> Result<Payload> {
            let task: Task = payload.decode()?;
            let response = Payload::encode(
                "task_response",
                &TaskResponse {
                    task_id: task.id,
                    handled_by: self.name.into(),
                },
            )?;
            self.runtime
                .publish(
                    response,
                    TopicId::new("task_results", "default").unwrap(),
                    MessageOptions::from_sender(self.id.clone()),
                )
                .await?;
            Ok(Payload::new("ack", json!(null)))
        }
    }

    /// Results subscriber collecting every task response it receives.
    struct Collector {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Agent for Collector {
        async fn handle(&mut self, payload: Payload, ctx: &MessageContext) -> Result<Payload> {
            assert!(!ctx.is_rpc);
            let response: TaskResponse = payload.decode()?;
            self.seen.lock().push(response.task_id);
            Ok(Payload::new("ack", json!(null)))
        }
    }

    fn worker_factory(name: &'static str) -> AgentFactory {
        Arc::new(move |ctx: ActivationContext| {
            Box::pin(async move {
                Ok(Box::new(TaskWorker {
                    name,
                    id: ctx.id,
                    runtime: ctx.runtime,
                }) as Box<dyn Agent>)
            })
        })
    }

    #[tokio::test]
    async fn test_two_topic_pipeline_collects_both_results() {
        // Scenario: "normal" and "urgent" workers each subscribed to their
        // own topic type, both publishing responses to "task_results"; a
        // collector subscribed to results sees exactly two task ids.
        let runtime = InProcessRuntime::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        runtime
            .register_agent_factory(AgentType::new("normal").unwrap(), worker_factory("normal"))
            .unwrap();
        runtime
            .register_agent_factory(AgentType::new("urgent").unwrap(), worker_factory("urgent"))
            .unwrap();
        let seen_clone = seen.clone();
        runtime
            .register_agent_factory(
                AgentType::new("collector").unwrap(),
                Arc::new(move |_ctx| {
                    let seen = seen_clone.clone();
                    Box::pin(async move { Ok(Box::new(Collector { seen }) as Box<dyn Agent>) })
                }),
            )
            .unwrap();

        runtime
            .add_subscription(Subscription::exact("normal", AgentType::new("normal").unwrap()))
            .unwrap();
        runtime
            .add_subscription(Subscription::exact("urgent", AgentType::new("urgent").unwrap()))
            .unwrap();
        runtime
            .add_subscription(Subscription::exact(
                "task_results",
                AgentType::new("collector").unwrap(),
            ))
            .unwrap();

        runtime
            .publish(
                Payload::encode("task", &Task { id: "urgent-1".into() }).unwrap(),
                TopicId::new("urgent", "default").unwrap(),
                MessageOptions::default(),
            )
            .await
            .unwrap();
        runtime
            .publish(
                Payload::encode("task", &Task { id: "normal-1".into() }).unwrap(),
                TopicId::new("normal", "default").unwrap(),
                MessageOptions::default(),
            )
            .await
            .unwrap();

        runtime.wait_until_idle().await;

        let mut results = seen.lock().clone();
        results.sort();
        assert_eq!(results, vec!["normal-1".to_string(), "urgent-1".to_string()]);
    }

    #[tokio::test]
    async fn test_no_self_delivery() {
        // A publish whose only matching subscription resolves to the
        // sender's own id must not invoke the sender's handler.
        let runtime = InProcessRuntime::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        runtime
            .register_agent_factory(
                AgentType::new("looper").unwrap(),
                Arc::new(move |_ctx| {
                    let seen = seen_clone.clone();
                    Box::pin(async move { Ok(Box::new(Collector { seen }) as Box<dyn Agent>) })
                }),
            )
            .unwrap();
        runtime
            .add_subscription(Subscription::exact("loop", AgentType::new("looper").unwrap()))
            .unwrap();

        let self_id: AgentId = "looper/default".parse().unwrap();
        runtime
            .publish(
                Payload::encode("task_response", &TaskResponse {
                    task_id: "self".into(),
                    handled_by: "looper".into(),
                })
                .unwrap(),
                TopicId::new("loop", "default").unwrap(),
                MessageOptions::from_sender(self_id),
            )
            .await
            .unwrap();
        runtime.wait_until_idle().await;

        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_isolation() {
        // One faulting recipient neither blocks the other nor faults the
        // publish call itself.
        struct Faulty;

        #[async_trait]
        impl Agent for Faulty {
            async fn handle(&mut self, _p: Payload, _c: &MessageContext) -> Result<Payload> {
                Err(RuntimeError::delivery("faulty", "handler exploded"))
            }
        }

        let runtime = InProcessRuntime::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        runtime
            .register_agent_factory(
                AgentType::new("faulty").unwrap(),
                Arc::new(|_ctx| Box::pin(async { Ok(Box::new(Faulty) as Box<dyn Agent>) })),
            )
            .unwrap();
        runtime
            .register_agent_factory(
                AgentType::new("fine").unwrap(),
                Arc::new(move |_ctx| {
                    let seen = seen_clone.clone();
                    Box::pin(async move { Ok(Box::new(Collector { seen }) as Box<dyn Agent>) })
                }),
            )
            .unwrap();
        runtime
            .add_subscription(Subscription::exact("mixed", AgentType::new("faulty").unwrap()))
            .unwrap();
        runtime
            .add_subscription(Subscription::exact("mixed", AgentType::new("fine").unwrap()))
            .unwrap();

        runtime
            .publish(
                Payload::encode("task_response", &TaskResponse {
                    task_id: "t1".into(),
                    handled_by: "pub".into(),
                })
                .unwrap(),
                TopicId::new("mixed", "default").unwrap(),
                MessageOptions::default(),
            )
            .await
            .unwrap();
        runtime.wait_until_idle().await;

        assert_eq!(seen.lock().as_slice(), &["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_agent_courier_unicast() {
        // An agent can call send() on its runtime through the capability
        // handle it received at construction.
        struct Relay {
            runtime: Arc<dyn AgentCourier>,
        }

        #[async_trait]
        impl Agent for Relay {
            async fn handle(&mut self, payload: Payload, _ctx: &MessageContext) -> Result<Payload> {
                self.runtime
                    .send(payload, "echo/default".parse().unwrap(), MessageOptions::default())
                    .await
            }
        }

        let runtime = InProcessRuntime::new();
        runtime
            .register_agent_factory(AgentType::new("echo").unwrap(), echo_factory())
            .unwrap();
        runtime
            .register_agent_factory(
                AgentType::new("relay").unwrap(),
                Arc::new(|ctx: ActivationContext| {
                    Box::pin(async move {
                        Ok(Box::new(Relay { runtime: ctx.runtime }) as Box<dyn Agent>)
                    })
                }),
            )
            .unwrap();

        let response = runtime
            .send(
                Payload::encode("task", &Task { id: "t9".into() }).unwrap(),
                "relay/default".parse().unwrap(),
                MessageOptions::default(),
            )
            .await
            .unwrap();
        let decoded: TaskResponse = response.decode().unwrap();
        assert_eq!(decoded.task_id, "t9");
    }

    #[tokio::test]
    async fn test_implicit_direct_subscription_installed() {
        let runtime = InProcessRuntime::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        runtime
            .register_agent_factory(
                AgentType::new("echo").unwrap(),
                Arc::new(move |_ctx| {
                    let seen = seen_clone.clone();
                    Box::pin(async move { Ok(Box::new(Collector { seen }) as Box<dyn Agent>) })
                }),
            )
            .unwrap();

        // "echo:" prefix topics route to the echo type with no explicit
        // subscription configured.
        runtime
            .publish(
                Payload::encode("task_response", &TaskResponse {
                    task_id: "direct-1".into(),
                    handled_by: "test".into(),
                })
                .unwrap(),
                TopicId::new("echo:rpc", "default").unwrap(),
                MessageOptions::default(),
            )
            .await
            .unwrap();
        runtime.wait_until_idle().await;

        assert_eq!(seen.lock().as_slice(), &["direct-1".to_string()]);
    }
}
