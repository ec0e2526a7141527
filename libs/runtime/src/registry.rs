//! Agent Registry
//!
//! Factories and live instances for one owning process. Activation is
//! on-demand: the first delivery addressed to an unconstructed agent id
//! triggers exactly one factory invocation, with concurrent first
//! deliveries coalescing onto that single construction.

use crate::identity::{AgentId, AgentType};
use crate::message::{ActivationContext, Agent, AgentCourier, AgentFactory, MessageContext, Payload};
use crate::{Result, RuntimeError};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

type AgentSlot = Arc<Mutex<Box<dyn Agent>>>;

/// Per-process registry of agent factories and activated instances.
///
/// Per-key synchronization throughout: unrelated agents are never
/// serialized behind each other, while deliveries to one instance are.
#[derive(Default)]
pub struct AgentRegistry {
    factories: DashMap<AgentType, AgentFactory>,
    /// One cell per agent id; the cell is the in-flight marker that makes
    /// concurrent first activations coalesce.
    instances: DashMap<AgentId, Arc<OnceCell<AgentSlot>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for an agent type. Fails if already registered.
    pub fn register_factory(&self, agent_type: AgentType, factory: AgentFactory) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.factories.entry(agent_type.clone()) {
            Entry::Occupied(_) => Err(RuntimeError::duplicate_registration(format!(
                "agent type {agent_type} already has a factory"
            ))),
            Entry::Vacant(entry) => {
                debug!(agent_type = %agent_type, "Registered agent factory");
                entry.insert(factory);
                Ok(())
            }
        }
    }

    pub fn has_factory(&self, agent_type: &AgentType) -> bool {
        self.factories.contains_key(agent_type)
    }

    pub fn registered_types(&self) -> Vec<AgentType> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of constructed instances (test/observability aid).
    pub fn live_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|e| e.value().get().is_some())
            .count()
    }

    /// Resolve the instance for `id`, constructing it through the registered
    /// factory on first use.
    pub async fn get_or_activate(
        &self,
        id: &AgentId,
        courier: Arc<dyn AgentCourier>,
    ) -> Result<AgentSlot> {
        let factory = self
            .factories
            .get(id.agent_type())
            .map(|f| f.value().clone())
            .ok_or_else(|| {
                RuntimeError::addressing(format!("agent not found: no factory for {id}"))
            })?;

        let cell = self
            .instances
            .entry(id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let slot = cell
            .get_or_try_init(|| async {
                debug!(agent_id = %id, "Activating agent instance");
                let instance = factory(ActivationContext {
                    id: id.clone(),
                    runtime: courier,
                })
                .await?;
                Ok::<AgentSlot, RuntimeError>(Arc::new(Mutex::new(instance)))
            })
            .await?;

        Ok(slot.clone())
    }

    /// Deliver one message to `id`, activating if needed, and return the
    /// handler's response. Cancellation aborts waiting on the handler.
    pub async fn deliver(
        &self,
        id: &AgentId,
        payload: Payload,
        ctx: &MessageContext,
        courier: Arc<dyn AgentCourier>,
    ) -> Result<Payload> {
        let slot = self.get_or_activate(id, courier).await?;
        let cancellation = ctx.cancellation.clone();

        tokio::select! {
            result = async {
                let mut agent = slot.lock().await;
                agent.handle(payload, ctx).await
            } => result,
            _ = cancellation.cancelled() => {
                Err(RuntimeError::cancelled(format!("delivery to {id}")))
            }
        }
    }

    /// Snapshot every live instance's state via its save hook.
    pub async fn save_state(&self) -> Result<HashMap<String, Value>> {
        let mut snapshot = HashMap::new();
        for entry in self.instances.iter() {
            if let Some(slot) = entry.value().get() {
                let agent = slot.lock().await;
                let state = agent.save_state().await?;
                snapshot.insert(entry.key().to_string(), state);
            }
        }
        Ok(snapshot)
    }

    /// Restore state from a prior snapshot, activating instances as needed.
    ///
    /// Entries whose agent type has no local factory are skipped with a
    /// warning: in the distributed deployment a snapshot can contain agents
    /// hosted by other workers.
    pub async fn load_state(
        &self,
        snapshot: &HashMap<String, Value>,
        courier: Arc<dyn AgentCourier>,
    ) -> Result<()> {
        for (raw_id, state) in snapshot {
            let id: AgentId = raw_id.parse()?;
            if !self.has_factory(id.agent_type()) {
                warn!(agent_id = %id, "Skipping snapshot entry: no local factory for its type");
                continue;
            }
            let slot = self.get_or_activate(&id, courier.clone()).await?;
            let mut agent = slot.lock().await;
            agent.load_state(state.clone()).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("factories", &self.factories.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}
