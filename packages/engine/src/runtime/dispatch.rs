// packages/engine/src/runtime/dispatch.rs
//! Front-end dispatch
//!
//! The `Dispatcher` lives in the parent process and turns service
//! methods into worker commands: pick a worker (by routing table for
//! owned agents, by random probing for admissions), consume its
//! available token, allocate a call-id, write the command and argument
//! payload, post function-ready, and block on the completion semaphore
//! for the result.
//!
//! `reply` is the one asymmetric operation: it allocates a second
//! call-id (the callback-id), registers a task whose collector thread
//! blocks on that callback, and returns the worker's placeholder
//! without waiting for the reply itself.

use crate::ipc::IpcShared;
use crate::rpc::messages::{
    decode_frame, encode_frame, AgentArgs, AgentMemoryReturn, CreateAgentArgs, ModelConfigsArgs,
    ObserveArgs, ReplyArgs, ReplyReturn,
};
use crate::runtime::routing_table::RoutingTable;
use crate::runtime::task_registry::TaskRegistry;
use crate::runtime::worker::FunctionId;
use crate::utils::errors::{EngineError, Result};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

/// Domain-level result of one service call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub ok: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Front-end side of the worker pool
pub struct Dispatcher {
    shared: Arc<IpcShared>,
    routing: RoutingTable,
    tasks: TaskRegistry,
}

impl Dispatcher {
    pub fn new(shared: Arc<IpcShared>) -> Self {
        let tasks = TaskRegistry::new(
            shared.config.runtime.max_tasks,
            shared.config.runtime.max_task_timeout_secs,
        );
        Self {
            shared,
            routing: RoutingTable::new(),
            tasks,
        }
    }

    pub fn shared(&self) -> &Arc<IpcShared> {
        &self.shared
    }

    pub fn routed_agents(&self) -> usize {
        self.routing.len()
    }

    /// Probe up to `4 × num_workers` random workers without blocking,
    /// then fall back to a blocking wait on the last probed one. The
    /// returned worker's available token is consumed.
    fn find_avail_worker(&self) -> Result<usize> {
        let num_workers = self.shared.links.len();
        let mut rng = rand::thread_rng();
        let mut candidate = 0;
        for _ in 0..4 * num_workers {
            candidate = rng.gen_range(0..num_workers);
            if self.shared.links[candidate].available.try_wait()? {
                debug!(worker_id = candidate, "admission probe hit");
                return Ok(candidate);
            }
        }
        self.shared.links[candidate].available.wait()?;
        debug!(worker_id = candidate, "admission fell back to blocking wait");
        Ok(candidate)
    }

    /// Post one command to a worker. `slot_held` means the caller has
    /// already consumed the worker's available token (admission path);
    /// otherwise it is consumed here, guaranteeing exclusive use of the
    /// command slot until the worker reads it.
    fn call_worker(
        &self,
        worker_id: usize,
        function: FunctionId,
        args: Option<Vec<u8>>,
        slot_held: bool,
    ) -> Result<i32> {
        if !slot_held {
            self.shared.links[worker_id].available.wait()?;
        }
        let call_id = self.shared.channel.alloc_call_id();
        self.shared.board.post(worker_id, call_id, function.code());
        if let Some(args) = args {
            self.shared.channel.set_args(call_id, &args)?;
        }
        self.shared.links[worker_id].ready.post()?;
        debug!(worker_id, call_id, ?function, "command posted");
        Ok(call_id)
    }

    /// Admit a new agent on any available worker. Empty result = created.
    pub fn call_create_agent(
        &self,
        agent_id: &str,
        init_args: &[u8],
        source_code: &[u8],
    ) -> Result<String> {
        if self.routing.lookup(agent_id).is_some() {
            return Ok(format!(
                "Agent with agent_id [{}] already exists.",
                agent_id
            ));
        }
        let worker_id = self.find_avail_worker()?;
        let frame = encode_frame(&CreateAgentArgs {
            agent_id: agent_id.to_string(),
            agent_init_args: init_args.to_vec(),
            agent_source_code: source_code.to_vec(),
        });
        let call_id = self.call_worker(worker_id, FunctionId::CreateAgent, Some(frame), true)?;
        let result = lossy(self.shared.channel.get_result(call_id)?);
        if result.is_empty() {
            self.routing.assign(agent_id, worker_id);
        }
        Ok(result)
    }

    /// Delete one agent. Empty result = deleted.
    pub fn call_delete_agent(&self, agent_id: &str) -> Result<String> {
        let Some(worker_id) = self.routing.lookup(agent_id) else {
            return Ok(format!("Try to delete a non-existent agent [{}].", agent_id));
        };
        let frame = encode_frame(&AgentArgs {
            agent_id: agent_id.to_string(),
        });
        let call_id = self.call_worker(worker_id, FunctionId::DeleteAgent, Some(frame), false)?;
        self.routing.remove(agent_id);
        Ok(lossy(self.shared.channel.get_result(call_id)?))
    }

    /// Broadcast deletion to every worker and clear the routing table
    pub fn call_delete_all_agents(&self) -> Result<String> {
        let call_ids = {
            let mut routes = self.routing.write_guard();
            let call_ids: Result<Vec<i32>> = (0..self.shared.links.len())
                .map(|worker_id| {
                    self.call_worker(worker_id, FunctionId::DeleteAllAgents, None, false)
                })
                .collect();
            routes.clear();
            call_ids?
        };
        let mut combined = String::new();
        for call_id in call_ids {
            combined.push_str(&lossy(self.shared.channel.get_result(call_id)?));
        }
        Ok(combined)
    }

    /// Clone an agent onto the worker that owns the original
    pub fn call_clone_agent(&self, agent_id: &str) -> Result<Outcome> {
        let Some(worker_id) = self.routing.lookup(agent_id) else {
            return Ok(Outcome::fail(format!(
                "Try to clone a non-existent agent [{}].",
                agent_id
            )));
        };
        let frame = encode_frame(&AgentArgs {
            agent_id: agent_id.to_string(),
        });
        let call_id = self.call_worker(worker_id, FunctionId::CloneAgent, Some(frame), false)?;
        let clone_id = lossy(self.shared.channel.get_result(call_id)?);
        if clone_id.is_empty() {
            return Ok(Outcome::fail(format!(
                "Failed to clone agent [{}].",
                agent_id
            )));
        }
        self.routing.assign(clone_id.clone(), worker_id);
        Ok(Outcome::ok(clone_id))
    }

    /// Merge every worker's agent list into one JSON array
    pub fn call_get_agent_list(&self) -> Result<String> {
        let call_ids = {
            let _routes = self.routing.read_guard();
            (0..self.shared.links.len())
                .map(|worker_id| self.call_worker(worker_id, FunctionId::GetAgentList, None, false))
                .collect::<Result<Vec<i32>>>()?
        };
        let mut reprs: Vec<String> = Vec::new();
        for call_id in call_ids {
            let raw = self.shared.channel.get_result(call_id)?;
            match serde_json::from_slice::<Vec<String>>(&raw) {
                Ok(mut list) => reprs.append(&mut list),
                Err(err) => warn!("worker returned a malformed agent list: {}", err),
            }
        }
        serde_json::to_string(&reprs).map_err(|e| EngineError::Encoding(e.to_string()))
    }

    /// Broadcast a model-config document to every worker
    pub fn call_set_model_configs(&self, model_configs: &str) -> Result<String> {
        let frame = encode_frame(&ModelConfigsArgs {
            model_configs: model_configs.to_string(),
        });
        let call_ids = (0..self.shared.links.len())
            .map(|worker_id| {
                self.call_worker(
                    worker_id,
                    FunctionId::SetModelConfigs,
                    Some(frame.clone()),
                    false,
                )
            })
            .collect::<Result<Vec<i32>>>()?;
        let mut combined = String::new();
        for call_id in call_ids {
            combined.push_str(&lossy(self.shared.channel.get_result(call_id)?));
        }
        Ok(combined)
    }

    /// Fetch an agent's serialized memory
    pub fn call_get_agent_memory(&self, agent_id: &str) -> Result<Outcome> {
        let Some(worker_id) = self.routing.lookup(agent_id) else {
            return Ok(Outcome::fail(format!(
                "Try to get memory of a non-existent agent [{}].",
                agent_id
            )));
        };
        let frame = encode_frame(&AgentArgs {
            agent_id: agent_id.to_string(),
        });
        let call_id = self.call_worker(worker_id, FunctionId::GetAgentMemory, Some(frame), false)?;
        let raw = self.shared.channel.get_result(call_id)?;
        let ret: AgentMemoryReturn = decode_frame(&raw)?;
        Ok(Outcome {
            ok: ret.ok,
            message: lossy(ret.memory),
        })
    }

    /// Start a reply and return its placeholder without waiting for the
    /// agent. The task collector blocks on the callback-id until the
    /// worker posts the delayed result.
    pub fn call_reply(&self, agent_id: &str, message: Vec<u8>) -> Result<Outcome> {
        let Some(worker_id) = self.routing.lookup(agent_id) else {
            return Ok(Outcome::fail(format!(
                "Try to reply a non-existent agent [{}].",
                agent_id
            )));
        };

        let callback_id = self.shared.channel.alloc_call_id();
        let shared = Arc::clone(&self.shared);
        let task_id = self.tasks.enqueue(move || {
            match shared.channel.get_result(callback_id) {
                Ok(bytes) => bytes,
                Err(err) => {
                    // Complete the task with the failure so waiters are
                    // not stranded on a dead callback.
                    warn!(callback_id, "callback collection failed: {}", err);
                    encode_frame(&ReplyReturn {
                        ok: false,
                        message: err.to_string().into_bytes(),
                    })
                }
            }
        });

        let frame = encode_frame(&ReplyArgs {
            agent_id: agent_id.to_string(),
            message,
            task_id,
            callback_id,
        });
        let call_id = self.call_worker(worker_id, FunctionId::Reply, Some(frame), false)?;
        let placeholder = lossy(self.shared.channel.get_result(call_id)?);
        Ok(Outcome::ok(placeholder))
    }

    /// Deliver messages to an agent without soliciting a reply
    pub fn call_observe(&self, agent_id: &str, messages: Vec<u8>) -> Result<Outcome> {
        let Some(worker_id) = self.routing.lookup(agent_id) else {
            return Ok(Outcome::fail(format!(
                "Try to observe a non-existent agent [{}].",
                agent_id
            )));
        };
        let frame = encode_frame(&ObserveArgs {
            agent_id: agent_id.to_string(),
            message: messages,
        });
        let call_id = self.call_worker(worker_id, FunctionId::Observe, Some(frame), false)?;
        Ok(Outcome::ok(lossy(self.shared.channel.get_result(call_id)?)))
    }

    /// Block until a task finishes and relay its stored `{ok, message}`
    pub fn call_update_placeholder(&self, task_id: u64) -> Result<Outcome> {
        match self.tasks.wait_result(task_id) {
            None => Ok(Outcome::fail(format!("Task [{}] not exists.", task_id))),
            Some(bytes) => {
                let ret: ReplyReturn = decode_frame(&bytes)?;
                Ok(Outcome {
                    ok: ret.ok,
                    message: lossy(ret.message),
                })
            }
        }
    }

    /// Resource snapshot of one available worker
    pub fn call_server_info(&self) -> Result<String> {
        let worker_id = self.find_avail_worker()?;
        let call_id = self.call_worker(worker_id, FunctionId::ServerInfo, None, true)?;
        Ok(lossy(self.shared.channel.get_result(call_id)?))
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::tests::test_config;

    fn ghost_dispatcher() -> Dispatcher {
        // No worker loop is running: these paths must all return before
        // touching a worker.
        Dispatcher::new(Arc::new(IpcShared::create(test_config(1)).unwrap()))
    }

    #[test]
    fn test_unknown_agent_messages() {
        let dispatcher = ghost_dispatcher();

        assert_eq!(
            dispatcher.call_delete_agent("ghost").unwrap(),
            "Try to delete a non-existent agent [ghost]."
        );
        assert_eq!(
            dispatcher.call_reply("ghost", vec![]).unwrap(),
            Outcome::fail("Try to reply a non-existent agent [ghost].")
        );
        assert_eq!(
            dispatcher.call_observe("ghost", vec![]).unwrap(),
            Outcome::fail("Try to observe a non-existent agent [ghost].")
        );
        assert_eq!(
            dispatcher.call_clone_agent("ghost").unwrap(),
            Outcome::fail("Try to clone a non-existent agent [ghost].")
        );
        assert_eq!(
            dispatcher.call_get_agent_memory("ghost").unwrap(),
            Outcome::fail("Try to get memory of a non-existent agent [ghost].")
        );

        dispatcher.shared().teardown();
    }

    #[test]
    fn test_unknown_task_message() {
        let dispatcher = ghost_dispatcher();
        assert_eq!(
            dispatcher.call_update_placeholder(7).unwrap(),
            Outcome::fail("Task [7] not exists.")
        );
        dispatcher.shared().teardown();
    }
}
