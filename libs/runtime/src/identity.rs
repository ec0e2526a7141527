//! Agent & Topic Identity
//!
//! Value types addressing agent instances and broadcast channels.
//! All types are immutable, value-equal, and round-trip losslessly through
//! their string forms: `"AgentType/Key"` and `"TopicType/TopicSource"`.

use crate::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of a registered agent-instance factory/category.
///
/// Restricted to `[A-Za-z_][A-Za-z0-9_]*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentType(String);

impl AgentType {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_valid_type_name(&name) {
            return Err(RuntimeError::addressing(format!(
                "invalid agent type {name:?}: expected [A-Za-z_][A-Za-z0-9_]*"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for AgentType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique address of an agent instance: (type, key).
///
/// Identifies at most one live instance per owning process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId {
    agent_type: AgentType,
    key: String,
}

impl AgentId {
    pub fn new(agent_type: AgentType, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if !is_printable_ascii(&key) {
            return Err(RuntimeError::addressing(format!(
                "invalid agent key {key:?}: expected non-empty printable ASCII"
            )));
        }
        Ok(Self { agent_type, key })
    }

    pub fn agent_type(&self) -> &AgentType {
        &self.agent_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_type, self.key)
    }
}

impl FromStr for AgentId {
    type Err = RuntimeError;

    /// Parse the `"Type/Key"` string form. The key may itself contain `/`;
    /// the split happens at the first separator only.
    fn from_str(s: &str) -> Result<Self> {
        let (ty, key) = s.split_once('/').ok_or_else(|| {
            RuntimeError::addressing(format!("invalid agent id {s:?}: expected \"Type/Key\""))
        })?;
        Self::new(AgentType::new(ty)?, key)
    }
}

/// Address of a broadcast channel: (topic type, topic source).
///
/// The topic type is restricted to `[A-Za-z_]` for its first character and
/// `[A-Za-z0-9_:]` afterwards; the `:` admits direct-delivery topics of the
/// form `"<agentType>:..."`. The source is printable ASCII (0x20-0x7E).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicId {
    topic_type: String,
    source: String,
}

impl TopicId {
    pub fn new(topic_type: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let topic_type = topic_type.into();
        let source = source.into();
        if !is_valid_topic_type(&topic_type) {
            return Err(RuntimeError::addressing(format!(
                "invalid topic type {topic_type:?}: expected [A-Za-z_][A-Za-z0-9_:]*"
            )));
        }
        if !is_printable_ascii(&source) {
            return Err(RuntimeError::addressing(format!(
                "invalid topic source {source:?}: expected non-empty printable ASCII"
            )));
        }
        Ok(Self { topic_type, source })
    }

    pub fn topic_type(&self) -> &str {
        &self.topic_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic_type, self.source)
    }
}

impl FromStr for TopicId {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        let (ty, source) = s.split_once('/').ok_or_else(|| {
            RuntimeError::addressing(format!(
                "invalid topic id {s:?}: expected \"Type/Source\""
            ))
        })?;
        Self::new(ty, source)
    }
}

fn is_valid_type_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_valid_topic_type(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_printable_ascii(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| ('\x20'..='\x7e').contains(&c))
}
