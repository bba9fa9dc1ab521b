// packages/engine/src/runtime/agent_host.rs
//! Agent host seam
//!
//! The engine never interprets agent state or message payloads; it
//! drives agents through these traits and moves opaque bytes. Errors
//! are plain strings because they travel to clients verbatim as the
//! `message` of a failed call. A host whose runtime is single-threaded
//! serializes internally; the engine already serializes calls on one
//! agent through the pool's per-agent lock.

use serde::Serialize;
use uuid::Uuid;

/// One stateful agent owned by a worker shard
pub trait Agent: Send {
    /// Stable identity of this agent
    fn agent_id(&self) -> &str;

    /// Drive the agent with one (possibly absent) serialized message
    /// and get its serialized reply
    fn reply(&mut self, message: Option<&[u8]>) -> Result<Vec<u8>, String>;

    /// Let the agent observe serialized messages without replying
    fn observe(&mut self, messages: &[u8]) -> Result<(), String>;

    /// Serialized memory contents, `None` when the agent keeps none
    fn memory(&self) -> Result<Option<Vec<u8>>, String>;

    /// Construct a fresh agent from this agent's init settings, with a
    /// new identity
    fn clone_agent(&self) -> Result<Box<dyn Agent>, String>;

    /// Human-readable one-line representation
    fn repr(&self) -> String;
}

/// Factory capability supplied by the embedder
pub trait AgentHost: Send + Sync + 'static {
    /// Instantiate an agent from opaque init settings and source payload
    fn create_agent(
        &self,
        agent_id: &str,
        init_args: &[u8],
        source_code: &[u8],
    ) -> Result<Box<dyn Agent>, String>;

    /// Forward a model-configuration document to the host runtime
    fn load_model_configs(&self, configs_json: &str) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Echo host
// ---------------------------------------------------------------------------

/// Built-in host used by the standalone binary and the test suite:
/// agents echo their input back and remember everything they saw.
#[derive(Debug, Default)]
pub struct EchoHost;

#[derive(Serialize)]
struct EchoReply<'a> {
    name: &'a str,
    content: String,
    seq: usize,
}

struct EchoAgent {
    agent_id: String,
    init_args: Vec<u8>,
    source_code: Vec<u8>,
    history: Vec<Vec<u8>>,
}

impl EchoAgent {
    fn new(agent_id: String, init_args: Vec<u8>, source_code: Vec<u8>) -> Self {
        Self {
            agent_id,
            init_args,
            source_code,
            history: Vec::new(),
        }
    }
}

impl Agent for EchoAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn reply(&mut self, message: Option<&[u8]>) -> Result<Vec<u8>, String> {
        let content = message
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        if let Some(m) = message {
            self.history.push(m.to_vec());
        }
        let reply = EchoReply {
            name: &self.agent_id,
            content,
            seq: self.history.len(),
        };
        serde_json::to_vec(&reply).map_err(|e| e.to_string())
    }

    fn observe(&mut self, messages: &[u8]) -> Result<(), String> {
        self.history.push(messages.to_vec());
        Ok(())
    }

    fn memory(&self) -> Result<Option<Vec<u8>>, String> {
        if self.history.is_empty() {
            return Ok(None);
        }
        let entries: Vec<String> = self
            .history
            .iter()
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .collect();
        serde_json::to_vec(&entries).map(Some).map_err(|e| e.to_string())
    }

    fn clone_agent(&self) -> Result<Box<dyn Agent>, String> {
        let clone_id = format!("{}-{}", self.agent_id, Uuid::new_v4().simple());
        Ok(Box::new(EchoAgent::new(
            clone_id,
            self.init_args.clone(),
            self.source_code.clone(),
        )))
    }

    fn repr(&self) -> String {
        format!("<EchoAgent {}>", self.agent_id)
    }
}

impl AgentHost for EchoHost {
    fn create_agent(
        &self,
        agent_id: &str,
        init_args: &[u8],
        source_code: &[u8],
    ) -> Result<Box<dyn Agent>, String> {
        if agent_id.is_empty() {
            return Err("agent_id must not be empty".to_string());
        }
        Ok(Box::new(EchoAgent::new(
            agent_id.to_string(),
            init_args.to_vec(),
            source_code.to_vec(),
        )))
    }

    fn load_model_configs(&self, configs_json: &str) -> Result<(), String> {
        serde_json::from_str::<serde_json::Value>(configs_json)
            .map(|_| ())
            .map_err(|e| format!("invalid model configs: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_echoes_content() {
        let host = EchoHost;
        let mut agent = host.create_agent("a", b"{}", b"").unwrap();
        let reply = agent.reply(Some(b"hello")).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(parsed["name"], "a");
        assert_eq!(parsed["content"], "hello");
    }

    #[test]
    fn test_memory_tracks_history() {
        let host = EchoHost;
        let mut agent = host.create_agent("a", b"", b"").unwrap();
        assert!(agent.memory().unwrap().is_none());

        agent.observe(b"seen").unwrap();
        agent.reply(Some(b"asked")).unwrap();
        let memory = agent.memory().unwrap().unwrap();
        let entries: Vec<String> = serde_json::from_slice(&memory).unwrap();
        assert_eq!(entries, vec!["seen".to_string(), "asked".to_string()]);
    }

    #[test]
    fn test_clone_gets_fresh_identity() {
        let host = EchoHost;
        let mut agent = host.create_agent("a", b"init", b"").unwrap();
        agent.observe(b"x").unwrap();

        let clone = agent.clone_agent().unwrap();
        assert_ne!(clone.agent_id(), agent.agent_id());
        assert!(clone.agent_id().starts_with("a-"));
        // Clones start from init settings, not from the sibling's history.
        assert!(clone.memory().unwrap().is_none());
    }

    #[test]
    fn test_create_rejects_empty_id() {
        let host = EchoHost;
        assert!(host.create_agent("", b"", b"").is_err());
    }

    #[test]
    fn test_model_configs_validation() {
        let host = EchoHost;
        assert!(host.load_model_configs("[{\"model\":\"m\"}]").is_ok());
        assert!(host.load_model_configs("not json").is_err());
    }
}
