// packages/engine/src/runtime/agent_pool.rs
//! Worker-resident agent pool
//!
//! Each worker shard owns a disjoint set of agents, keyed by agent id
//! and living only inside that child process. Lookups take the shared
//! lock so calls on distinct agents proceed in parallel; inserts and
//! removals take the exclusive lock. Calls on the *same* agent
//! serialize on the per-agent mutex, never on the pool lock.

use crate::runtime::agent_host::Agent;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// An agent shared between concurrent handler threads of one worker
pub type SharedAgent = Arc<Mutex<Box<dyn Agent>>>;

/// Map of agent id to agent handle, resident in one worker shard
#[derive(Default)]
pub struct AgentPool {
    agents: RwLock<HashMap<String, SharedAgent>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created agent; `false` if the id already exists
    pub fn insert(&self, agent: Box<dyn Agent>) -> bool {
        let agent_id = agent.agent_id().to_string();
        let mut agents = self.agents.write();
        if agents.contains_key(&agent_id) {
            return false;
        }
        agents.insert(agent_id, Arc::new(Mutex::new(agent)));
        true
    }

    /// Shared-lock lookup
    pub fn get(&self, agent_id: &str) -> Option<SharedAgent> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Remove one agent; its destructor runs when the last handle drops
    pub fn remove(&self, agent_id: &str) -> Option<SharedAgent> {
        self.agents.write().remove(agent_id)
    }

    /// Drop every agent in this shard
    pub fn clear(&self) {
        self.agents.write().clear();
    }

    /// One-line representations of every resident agent
    pub fn reprs(&self) -> Vec<String> {
        self.agents
            .read()
            .values()
            .map(|agent| agent.lock().repr())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}
