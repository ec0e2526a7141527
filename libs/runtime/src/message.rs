//! Message Model & Agent Surface
//!
//! Payloads are opaque to the runtime: a type tag plus a JSON body. Dispatch
//! inside an agent is driven by an explicit tag -> handler table built at
//! registration time; no runtime type inspection is involved.

use crate::identity::{AgentId, TopicId};
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// An opaque message payload: a type tag and a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub tag: String,
    pub data: Value,
}

impl Payload {
    pub fn new(tag: impl Into<String>, data: Value) -> Self {
        Self {
            tag: tag.into(),
            data,
        }
    }

    /// Build a payload by serializing a typed body.
    pub fn encode<T: Serialize>(tag: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Self {
            tag: tag.into(),
            data: serde_json::to_value(body)?,
        })
    }

    /// Deserialize the body into a typed value.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Per-delivery context handed to an agent's handler.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Correlation id of this delivery (opaque string).
    pub message_id: String,
    /// Address of the sending agent, if any.
    pub sender: Option<AgentId>,
    /// Topic the message was published to; `None` for unicast sends.
    pub topic: Option<TopicId>,
    /// True for request/response deliveries, false for broadcast.
    pub is_rpc: bool,
    /// Cancellation signal for the delivery.
    pub cancellation: CancellationToken,
}

impl MessageContext {
    pub fn rpc(message_id: String, sender: Option<AgentId>, cancellation: CancellationToken) -> Self {
        Self {
            message_id,
            sender,
            topic: None,
            is_rpc: true,
            cancellation,
        }
    }

    pub fn broadcast(
        message_id: String,
        topic: TopicId,
        sender: Option<AgentId>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            message_id,
            sender,
            topic: Some(topic),
            is_rpc: false,
            cancellation,
        }
    }
}

/// Caller-side options for `send`/`publish`.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Address of the sending agent; excluded from its own broadcasts.
    pub sender: Option<AgentId>,
    /// Correlation id; a fresh one is minted when absent.
    pub message_id: Option<String>,
    /// Cancellation signal; aborts waiting for a result, not bytes on the wire.
    pub cancellation: CancellationToken,
}

impl MessageOptions {
    pub fn from_sender(sender: AgentId) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    /// The caller-supplied correlation id, or a freshly minted one.
    pub fn message_id_or_fresh(&self) -> String {
        self.message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// A locally activated agent instance.
///
/// Handler logic is supplied by application code; the runtime only routes.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Handle one delivered message and produce a response payload.
    ///
    /// For broadcast deliveries the response is discarded.
    async fn handle(&mut self, payload: Payload, ctx: &MessageContext) -> Result<Payload>;

    /// Produce an opaque state blob for snapshots.
    async fn save_state(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    /// Restore state from a prior snapshot entry.
    async fn load_state(&mut self, _state: Value) -> Result<()> {
        Ok(())
    }
}

/// Capability handle letting an agent call back into its owning runtime.
///
/// Non-owning by construction: the runtime owns the instance, the instance
/// holds only this handle, so no ownership cycle forms.
#[async_trait]
pub trait AgentCourier: Send + Sync {
    async fn send(
        &self,
        payload: Payload,
        recipient: AgentId,
        options: MessageOptions,
    ) -> Result<Payload>;

    async fn publish(&self, payload: Payload, topic: TopicId, options: MessageOptions)
        -> Result<()>;
}

/// Everything a factory needs to construct one agent instance.
pub struct ActivationContext {
    /// Address the new instance will answer to.
    pub id: AgentId,
    /// Back-reference for issuing sends/publishes from inside handlers.
    pub runtime: Arc<dyn AgentCourier>,
}

/// Factory constructing agent instances on demand, registered per type.
pub type AgentFactory =
    Arc<dyn Fn(ActivationContext) -> BoxFuture<'static, Result<Box<dyn Agent>>> + Send + Sync>;

/// Future type produced by dispatch-table handlers.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Payload>> + Send + 'a>>;

type HandlerFn<S> =
    Box<dyn for<'a> Fn(&'a mut S, Payload, &'a MessageContext) -> HandlerFuture<'a> + Send + Sync>;

/// Explicit table mapping a message-type tag to a handler function.
///
/// Built once when an agent type is registered and looked up by tag at
/// dispatch time.
pub struct DispatchTable<S> {
    handlers: HashMap<String, HandlerFn<S>>,
}

impl<S: Send + Sync> DispatchTable<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Bind a handler to a tag. Re-binding a tag replaces the previous handler.
    pub fn on<F>(mut self, tag: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, Payload, &'a MessageContext) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(tag.into(), Box::new(handler));
        self
    }

    pub async fn dispatch(
        &self,
        state: &mut S,
        payload: Payload,
        ctx: &MessageContext,
    ) -> Result<Payload> {
        match self.handlers.get(&payload.tag) {
            Some(handler) => handler(state, payload, ctx).await,
            None => Err(RuntimeError::delivery(
                ctx.message_id.clone(),
                format!("no handler bound for tag {:?}", payload.tag),
            )),
        }
    }
}

impl<S: Send + Sync> Default for DispatchTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thin agent wrapper driving a [`DispatchTable`]; optional sugar over
/// implementing [`Agent`] directly.
pub struct RoutedAgent<S> {
    state: S,
    table: Arc<DispatchTable<S>>,
}

impl<S: Send + Sync> RoutedAgent<S> {
    pub fn new(state: S, table: Arc<DispatchTable<S>>) -> Self {
        Self { state, table }
    }

    pub fn state(&self) -> &S {
        &self.state
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> Agent for RoutedAgent<S> {
    async fn handle(&mut self, payload: Payload, ctx: &MessageContext) -> Result<Payload> {
        self.table.dispatch(&mut self.state, payload, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_encode_decode() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Task {
            id: String,
        }

        let payload = Payload::encode("task", &Task { id: "t1".into() }).unwrap();
        assert_eq!(payload.tag, "task");
        let decoded: Task = payload.decode().unwrap();
        assert_eq!(decoded.id, "t1");
    }

    #[tokio::test]
    async fn test_dispatch_table_routes_by_tag() {
        let table: DispatchTable<u32> = DispatchTable::new()
            .on("bump", |count, payload, _ctx| {
                Box::pin(async move {
                    *count += 1;
                    Ok(Payload::new("bumped", json!({ "count": *count, "echo": payload.data })))
                })
            })
            .on("read", |count, _payload, _ctx| {
                let snapshot = *count;
                Box::pin(async move { Ok(Payload::new("value", json!(snapshot))) })
            });

        let ctx = MessageContext::rpc("m1".into(), None, CancellationToken::new());
        let mut state = 0u32;

        table
            .dispatch(&mut state, Payload::new("bump", json!(null)), &ctx)
            .await
            .unwrap();
        let out = table
            .dispatch(&mut state, Payload::new("read", json!(null)), &ctx)
            .await
            .unwrap();
        assert_eq!(out.data, json!(1));
    }

    #[tokio::test]
    async fn test_dispatch_table_unknown_tag_faults() {
        let table: DispatchTable<()> = DispatchTable::new();
        let ctx = MessageContext::rpc("m1".into(), None, CancellationToken::new());
        let err = table
            .dispatch(&mut (), Payload::new("nope", json!(null)), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Delivery { .. }));
    }
}
