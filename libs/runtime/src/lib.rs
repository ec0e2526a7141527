//! Mesh Runtime
//!
//! In-process core of the Mesh multi-agent runtime: agent and topic
//! identity, subscription matching, on-demand activation, and the
//! send/publish router contract. The distributed deployment in
//! `mesh-cluster` implements the same contract across worker processes.

pub mod error;
pub mod identity;
pub mod inprocess;
pub mod message;
pub mod registry;
pub mod subscription;

pub use error::{Result, RuntimeError};
pub use identity::{AgentId, AgentType, TopicId};
pub use inprocess::InProcessRuntime;
pub use message::{
    ActivationContext, Agent, AgentCourier, AgentFactory, DispatchTable, HandlerFuture,
    MessageContext, MessageOptions, Payload, RoutedAgent,
};
pub use registry::AgentRegistry;
pub use subscription::{Subscription, SubscriptionRegistry};
