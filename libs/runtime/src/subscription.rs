//! Subscription Model & Registry
//!
//! Subscriptions are rules mapping topics to agent ids, used for broadcast
//! routing. Two variants exist: exact topic-type match and topic-type prefix
//! match; both map the topic source onto the agent key.

use crate::identity::{AgentId, AgentType, TopicId};
use crate::{Result, RuntimeError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// A rule mapping topics to agent ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subscription {
    /// Matches when the topic type equals the bound type.
    ExactType {
        id: String,
        topic_type: String,
        agent_type: AgentType,
    },
    /// Matches when the topic type starts with the bound prefix.
    TypePrefix {
        id: String,
        topic_type_prefix: String,
        agent_type: AgentType,
    },
}

impl Subscription {
    /// Exact-type subscription with a fresh unique id.
    pub fn exact(topic_type: impl Into<String>, agent_type: AgentType) -> Self {
        Self::exact_with_id(Uuid::new_v4().to_string(), topic_type, agent_type)
    }

    pub fn exact_with_id(
        id: impl Into<String>,
        topic_type: impl Into<String>,
        agent_type: AgentType,
    ) -> Self {
        Self::ExactType {
            id: id.into(),
            topic_type: topic_type.into(),
            agent_type,
        }
    }

    /// Prefix subscription with a fresh unique id.
    pub fn prefix(topic_type_prefix: impl Into<String>, agent_type: AgentType) -> Self {
        Self::prefix_with_id(Uuid::new_v4().to_string(), topic_type_prefix, agent_type)
    }

    pub fn prefix_with_id(
        id: impl Into<String>,
        topic_type_prefix: impl Into<String>,
        agent_type: AgentType,
    ) -> Self {
        Self::TypePrefix {
            id: id.into(),
            topic_type_prefix: topic_type_prefix.into(),
            agent_type,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::ExactType { id, .. } | Self::TypePrefix { id, .. } => id,
        }
    }

    pub fn agent_type(&self) -> &AgentType {
        match self {
            Self::ExactType { agent_type, .. } | Self::TypePrefix { agent_type, .. } => agent_type,
        }
    }

    /// Whether this subscription matches the given topic.
    pub fn matches(&self, topic: &TopicId) -> bool {
        match self {
            Self::ExactType { topic_type, .. } => topic.topic_type() == topic_type,
            Self::TypePrefix {
                topic_type_prefix, ..
            } => topic.topic_type().starts_with(topic_type_prefix.as_str()),
        }
    }

    /// Map a matching topic to its recipient: the bound agent type keyed by
    /// the topic source. Callers must check [`Self::matches`] first.
    pub fn map(&self, topic: &TopicId) -> Result<AgentId> {
        AgentId::new(self.agent_type().clone(), topic.source())
    }
}

/// Concurrency-safe store of subscriptions, matched on every publish.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Fails if its id is already registered.
    pub fn add(&self, subscription: Subscription) -> Result<()> {
        let id = subscription.id().to_string();
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => Err(RuntimeError::duplicate_registration(format!(
                "subscription {id} already exists"
            ))),
            Entry::Vacant(entry) => {
                debug!(subscription_id = %id, "Added subscription");
                entry.insert(subscription);
                Ok(())
            }
        }
    }

    /// Look up a subscription by id.
    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a subscription by id. Fails if absent.
    pub fn remove(&self, id: &str) -> Result<Subscription> {
        self.entries
            .remove(id)
            .map(|(_, sub)| sub)
            .ok_or_else(|| RuntimeError::not_found(format!("subscription {id} does not exist")))
    }

    /// Evaluate every stored subscription against the topic. Each matching
    /// subscription contributes one recipient; results are NOT deduplicated
    /// by agent id, so overlapping subscriptions cause multiple deliveries.
    pub fn match_topic(&self, topic: &TopicId) -> Vec<AgentId> {
        let mut recipients = Vec::new();
        for entry in self.entries.iter() {
            if entry.value().matches(topic) {
                match entry.value().map(topic) {
                    Ok(id) => recipients.push(id),
                    Err(e) => debug!(
                        subscription_id = %entry.key(),
                        topic = %topic,
                        error = %e,
                        "Subscription maps topic to an invalid agent id; skipping"
                    ),
                }
            }
        }
        recipients
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
