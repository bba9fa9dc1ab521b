// packages/engine/src/runtime/worker.rs
//! Worker shard command loop
//!
//! One worker per shard, normally a forked child process. The loop
//! waits on the shard's function-ready semaphore, reads the pending
//! `(call_id, function_id)` command, hands the call to a detached
//! handler thread, and re-posts the worker-available token. Handlers
//! read their arguments from the payload channel, drive the agent host,
//! and finish with `set_result` on their call-id (`reply` additionally
//! posts the delayed result on its callback-id).
//!
//! Domain failures become result payloads. IPC failures are fatal: the
//! worker signals the parent (SIGINT) and exits, and the parent tears
//! the pool down.

use crate::ipc::{IpcChannel, IpcShared};
use crate::observability;
use crate::rpc::messages::{
    decode_frame, encode_frame, AgentArgs, AgentMemoryReturn, CreateAgentArgs, ModelConfigsArgs,
    ObserveArgs, ReplyArgs, ReplyReturn, TaskPlaceholder,
};
use crate::runtime::agent_host::AgentHost;
use crate::runtime::agent_pool::AgentPool;
use crate::utils::errors::{EngineError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Stable function codes of the command region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FunctionId {
    CreateAgent = 0,
    DeleteAgent = 1,
    DeleteAllAgents = 2,
    CloneAgent = 3,
    GetAgentList = 4,
    SetModelConfigs = 5,
    GetAgentMemory = 6,
    Reply = 7,
    Observe = 8,
    ServerInfo = 9,
}

impl FunctionId {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::CreateAgent),
            1 => Some(Self::DeleteAgent),
            2 => Some(Self::DeleteAllAgents),
            3 => Some(Self::CloneAgent),
            4 => Some(Self::GetAgentList),
            5 => Some(Self::SetModelConfigs),
            6 => Some(Self::GetAgentMemory),
            7 => Some(Self::Reply),
            8 => Some(Self::Observe),
            9 => Some(Self::ServerInfo),
            _ => None,
        }
    }
}

/// State of one running worker shard
pub struct WorkerContext {
    worker_id: usize,
    shared: Arc<IpcShared>,
    host: Arc<dyn AgentHost>,
    pool: AgentPool,
    /// Parent to signal on fatal IPC failure; `None` when the loop runs
    /// on an in-process thread (tests), where a fatal failure panics.
    parent_pid: Option<Pid>,
}

impl WorkerContext {
    /// Context for an in-process worker loop sharing the parent's memory
    pub fn new(worker_id: usize, shared: Arc<IpcShared>, host: Arc<dyn AgentHost>) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            shared,
            host,
            pool: AgentPool::new(),
            parent_pid: None,
        })
    }

    /// Context for a forked child that must signal `parent_pid` on
    /// fatal failure
    pub fn for_child(
        worker_id: usize,
        shared: Arc<IpcShared>,
        host: Arc<dyn AgentHost>,
        parent_pid: Pid,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            shared,
            host,
            pool: AgentPool::new(),
            parent_pid: Some(parent_pid),
        })
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    fn channel(&self) -> &IpcChannel {
        &self.shared.channel
    }

    /// Last resort for IPC failures: take the whole pool down with us.
    fn fatal(&self, err: EngineError) -> ! {
        error!(worker_id = self.worker_id, "fatal IPC failure: {}", err);
        match self.parent_pid {
            Some(parent) => {
                let _ = kill(parent, Signal::SIGINT);
                std::process::exit(1);
            }
            None => panic!("fatal IPC failure in worker {}: {}", self.worker_id, err),
        }
    }
}

/// Entry point of a forked worker child. Never returns.
pub fn child_main(
    worker_id: usize,
    shared: Arc<IpcShared>,
    host: Arc<dyn AgentHost>,
    parent_pid: Pid,
) -> ! {
    let log_path = shared.config.worker_log_path(worker_id);
    if let Err(err) = redirect_stdio(&log_path) {
        eprintln!("worker {}: cannot redirect stdio: {}", worker_id, err);
        let _ = kill(parent_pid, Signal::SIGINT);
        std::process::exit(1);
    }
    observability::init_worker_tracing(shared.config.verbose_ipc_log);

    let ctx = WorkerContext::for_child(worker_id, shared, host, parent_pid);
    match run_loop(&ctx) {
        Ok(never) => match never {},
        Err(err) => ctx.fatal(err),
    }
}

/// Redirect stdout and stderr into the worker's log file
fn redirect_stdio(log_path: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(log_path)?;
    let fd = file.as_raw_fd();
    for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(EngineError::Process(format!(
                "dup2 to fd {} failed: {}",
                target,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// The shard's command loop. Only returns on an IPC failure.
pub fn run_loop(ctx: &Arc<WorkerContext>) -> Result<std::convert::Infallible> {
    let link = &ctx.shared.links[ctx.worker_id];
    // Announce the initial free command slot exactly once.
    link.available.post()?;
    info!(worker_id = ctx.worker_id, "worker loop started");

    loop {
        link.ready.wait()?;
        let (call_id, code) = ctx.shared.board.fetch(ctx.worker_id);
        debug!(
            worker_id = ctx.worker_id,
            call_id, code, "command received"
        );

        let handler_ctx = Arc::clone(ctx);
        std::thread::spawn(move || handle_call(handler_ctx, call_id, code));
        link.available.post()?;
    }
}

fn handle_call(ctx: Arc<WorkerContext>, call_id: i32, code: i32) {
    let outcome = match FunctionId::from_code(code) {
        Some(FunctionId::CreateAgent) => create_agent_worker(&ctx, call_id),
        Some(FunctionId::DeleteAgent) => delete_agent_worker(&ctx, call_id),
        Some(FunctionId::DeleteAllAgents) => delete_all_agents_worker(&ctx, call_id),
        Some(FunctionId::CloneAgent) => clone_agent_worker(&ctx, call_id),
        Some(FunctionId::GetAgentList) => get_agent_list_worker(&ctx, call_id),
        Some(FunctionId::SetModelConfigs) => set_model_configs_worker(&ctx, call_id),
        Some(FunctionId::GetAgentMemory) => get_agent_memory_worker(&ctx, call_id),
        Some(FunctionId::Reply) => reply_worker(&ctx, call_id),
        Some(FunctionId::Observe) => observe_worker(&ctx, call_id),
        Some(FunctionId::ServerInfo) => server_info_worker(&ctx, call_id),
        None => {
            warn!(call_id, code, "unknown function code");
            // Unblock the caller rather than strand its call-id.
            ctx.channel().set_result(call_id, b"")
        }
    };
    if let Err(err) = outcome {
        ctx.fatal(err);
    }
}

fn create_agent_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let args: CreateAgentArgs = decode_frame(&ctx.channel().get_args(call_id)?)?;
    let result = match ctx.host.create_agent(
        &args.agent_id,
        &args.agent_init_args,
        &args.agent_source_code,
    ) {
        Ok(agent) => {
            if ctx.pool.insert(agent) {
                info!(
                    worker_id = ctx.worker_id,
                    agent_id = %args.agent_id,
                    "agent created"
                );
                String::new()
            } else {
                format!("Agent with agent_id [{}] already exists.", args.agent_id)
            }
        }
        Err(message) => message,
    };
    ctx.channel().set_result(call_id, result.as_bytes())
}

fn delete_agent_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let args: AgentArgs = decode_frame(&ctx.channel().get_args(call_id)?)?;
    if ctx.pool.remove(&args.agent_id).is_some() {
        info!(
            worker_id = ctx.worker_id,
            agent_id = %args.agent_id,
            "agent deleted"
        );
    }
    ctx.channel().set_result(call_id, b"")
}

fn delete_all_agents_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let count = ctx.pool.len();
    ctx.pool.clear();
    info!(worker_id = ctx.worker_id, count, "all agents deleted");
    ctx.channel().set_result(call_id, b"")
}

fn clone_agent_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let args: AgentArgs = decode_frame(&ctx.channel().get_args(call_id)?)?;
    // An empty id tells the front-end the clone failed; it reports the
    // failure without touching the routing table.
    let clone_id = match ctx.pool.get(&args.agent_id) {
        Some(agent) => match agent.lock().clone_agent() {
            Ok(clone) => {
                let clone_id = clone.agent_id().to_string();
                if ctx.pool.insert(clone) {
                    clone_id
                } else {
                    warn!(clone_id = %clone_id, "clone produced a duplicate id");
                    String::new()
                }
            }
            Err(message) => {
                warn!(agent_id = %args.agent_id, "clone failed: {}", message);
                String::new()
            }
        },
        None => String::new(),
    };
    ctx.channel().set_result(call_id, clone_id.as_bytes())
}

fn get_agent_list_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let reprs = ctx.pool.reprs();
    let result =
        serde_json::to_string(&reprs).map_err(|e| EngineError::Encoding(e.to_string()))?;
    ctx.channel().set_result(call_id, result.as_bytes())
}

fn set_model_configs_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let args: ModelConfigsArgs = decode_frame(&ctx.channel().get_args(call_id)?)?;
    let result = match ctx.host.load_model_configs(&args.model_configs) {
        Ok(()) => {
            info!(worker_id = ctx.worker_id, "model configs loaded");
            String::new()
        }
        Err(message) => message,
    };
    ctx.channel().set_result(call_id, result.as_bytes())
}

fn get_agent_memory_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let args: AgentArgs = decode_frame(&ctx.channel().get_args(call_id)?)?;
    let frame = match ctx.pool.get(&args.agent_id) {
        Some(agent) => match agent.lock().memory() {
            Ok(Some(memory)) => AgentMemoryReturn { ok: true, memory },
            Ok(None) => AgentMemoryReturn {
                ok: false,
                memory: format!("Agent [{}] has no memory.", args.agent_id).into_bytes(),
            },
            Err(message) => AgentMemoryReturn {
                ok: false,
                memory: message.into_bytes(),
            },
        },
        None => AgentMemoryReturn {
            ok: false,
            memory: format!("Agent [{}] not found.", args.agent_id).into_bytes(),
        },
    };
    ctx.channel().set_result(call_id, &encode_frame(&frame))
}

fn reply_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let args: ReplyArgs = decode_frame(&ctx.channel().get_args(call_id)?)?;
    debug!(
        worker_id = ctx.worker_id,
        agent_id = %args.agent_id,
        task_id = args.task_id,
        callback_id = args.callback_id,
        "reply dispatched"
    );

    // Unblock the caller with the placeholder before doing the work.
    let placeholder = TaskPlaceholder {
        task_id: args.task_id,
        agent_id: args.agent_id.clone(),
    };
    ctx.channel()
        .set_result(call_id, placeholder.to_json().as_bytes())?;

    let outcome = match ctx.pool.get(&args.agent_id) {
        Some(agent) => {
            let message = (!args.message.is_empty()).then_some(args.message.as_slice());
            match agent.lock().reply(message) {
                Ok(reply) => ReplyReturn {
                    ok: true,
                    message: reply,
                },
                Err(message) => ReplyReturn {
                    ok: false,
                    message: message.into_bytes(),
                },
            }
        }
        None => ReplyReturn {
            ok: false,
            message: format!("Agent [{}] not found.", args.agent_id).into_bytes(),
        },
    };
    debug!(
        worker_id = ctx.worker_id,
        task_id = args.task_id,
        ok = outcome.ok,
        "reply finished"
    );
    ctx.channel()
        .set_result(args.callback_id, &encode_frame(&outcome))
}

fn observe_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let args: ObserveArgs = decode_frame(&ctx.channel().get_args(call_id)?)?;
    if let Some(agent) = ctx.pool.get(&args.agent_id) {
        if let Err(message) = agent.lock().observe(&args.message) {
            warn!(agent_id = %args.agent_id, "observe failed: {}", message);
        }
    }
    ctx.channel().set_result(call_id, b"")
}

fn server_info_worker(ctx: &WorkerContext, call_id: i32) -> Result<()> {
    let pid = std::process::id();
    let sys_pid = sysinfo::Pid::from_u32(pid);
    let mut sys = sysinfo::System::new();
    sys.refresh_process(sys_pid);
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_process(sys_pid);

    let (cpu, mem_mb) = sys
        .process(sys_pid)
        .map(|p| (p.cpu_usage() as f64, p.memory() as f64 / (1 << 20) as f64))
        .unwrap_or((0.0, 0.0));
    let info = serde_json::json!({
        "pid": pid,
        "id": ctx.shared.config.server.server_id,
        "cpu": cpu,
        "mem": mem_mb,
    });
    ctx.channel().set_result(call_id, info.to_string().as_bytes())
}
