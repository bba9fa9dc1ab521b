// packages/engine/src/runtime/routing_table.rs
//! Agent routing table
//!
//! Front-end mapping of agent id to owning worker shard. Every id in
//! the table has a live agent in exactly that worker's pool, and ids
//! are unique across workers. Reads take the shared lock; inserts and
//! removals the exclusive lock. Broadcast operations can pin the table
//! across a multi-worker dispatch through the guard accessors.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;

/// agent id → worker id
#[derive(Default)]
pub struct RoutingTable {
    routes: RwLock<HashMap<String, usize>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record ownership of a committed agent
    pub fn assign(&self, agent_id: impl Into<String>, worker_id: usize) {
        self.routes.write().insert(agent_id.into(), worker_id);
    }

    /// Owning worker of an agent, if it exists
    pub fn lookup(&self, agent_id: &str) -> Option<usize> {
        self.routes.read().get(agent_id).copied()
    }

    /// Forget an agent on deletion
    pub fn remove(&self, agent_id: &str) -> Option<usize> {
        self.routes.write().remove(agent_id)
    }

    /// Pin the table shared while a broadcast reads every worker
    pub fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<String, usize>> {
        self.routes.read()
    }

    /// Pin the table exclusively while a broadcast mutates every worker
    pub fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<String, usize>> {
        self.routes.write()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_lookup_remove() {
        let table = RoutingTable::new();
        table.assign("a", 2);
        assert_eq!(table.lookup("a"), Some(2));
        assert_eq!(table.lookup("ghost"), None);
        assert_eq!(table.remove("a"), Some(2));
        assert_eq!(table.lookup("a"), None);
    }

    #[test]
    fn test_reassign_moves_route() {
        let table = RoutingTable::new();
        table.assign("a", 0);
        table.assign("a", 3);
        assert_eq!(table.lookup("a"), Some(3));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_write_guard_clears_atomically() {
        let table = RoutingTable::new();
        table.assign("a", 0);
        table.assign("b", 1);
        {
            let mut guard = table.write_guard();
            guard.clear();
        }
        assert!(table.is_empty());
    }
}
