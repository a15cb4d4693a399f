// src/lib.rs

//! dagflow is a single-node workflow engine executing user-defined DAGs
//! of tasks.
//!
//! A [`Dag`] template describes tasks, their dependencies and conditional
//! pre-checks. Running a template produces a [`DagInstance`] whose task
//! instances flow through a bounded executor pool in dependency order,
//! driven by the parser and steerable at runtime through retry/cancel
//! commands issued via the [`Commander`].
//!
//! Everything hangs off an [`Engine`] value (store, action registry,
//! executor, parser, commander and lifecycle hooks), so tests and
//! embedders can run several engines side by side.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dagflow::{Engine, InitialOption, MemStore};
//!
//! #[tokio::main]
//! async fn main() -> dagflow::Result<()> {
//!     let opt = InitialOption::new(Arc::new(MemStore::new()));
//!     let engine = Engine::init(opt).await?;
//!     // engine.register_action(...) and commander().run_dag(...) here.
//!     engine.run_until_signal().await
//! }
//! ```

pub mod commander;
pub mod entity;
pub mod errors;
pub mod exec;
pub mod loader;
pub mod logging;
pub mod parser;
pub mod store;
pub mod tree;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use crate::commander::{CommandOption, Commander};
pub use crate::entity::{
    ActiveAction, Command, CommandName, ConditionOp, ConditionSource, Dag, DagInstance,
    DagInstanceStatus, DagInstanceVars, DagStatus, DagVar, LifecycleHooks, PreCheck, PreChecks,
    RetryPolicy, ShareData, Task, TaskCondition, TaskInstance, TaskInstanceStatus, TraceInfo,
    TraceMode, Trigger,
};
pub use crate::errors::{FlowError, Result};
pub use crate::exec::{Action, ActionRegistry, ExecuteContext, ExecutorHandle};
pub use crate::store::{
    DagInsPatch, ListDagInsInput, ListTaskInsInput, MemStore, Store, TaskInsPatch,
};
pub use crate::tree::{TaskTree, TreeStatus};

use crate::exec::spawn_executor;
use crate::parser::{spawn_parser, ParserMailbox};

/// How long [`Engine::close`] waits for workers to drain.
const CLOSE_GRACE: Duration = Duration::from_secs(15);

/// Initialization options for one engine.
pub struct InitialOption {
    pub store: Arc<dyn Store>,
    /// Parser shard workers. Default 100.
    pub parser_workers_cnt: usize,
    /// Executor worker slots. Default 1000.
    pub executor_worker_cnt: usize,
    /// Default per-task deadline. Default 30s.
    pub executor_timeout: Duration,
    /// Interval of the recovery scan for undispatched instances.
    /// Default 15s.
    pub dag_schedule_timeout: Duration,
    /// Interval of the pending-command poll. Defaults to
    /// `executor_timeout`; the in-process commander nudges the parser
    /// directly, so the poll only backstops external writers.
    pub parser_interval: Option<Duration>,
    /// Hooks fired before dag-instance transitions.
    pub lifecycle_hooks: LifecycleHooks,
    /// Directory of YAML dag definitions to load at init, one dag per
    /// file.
    pub read_dag_from_dir: Option<PathBuf>,
}

impl InitialOption {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            parser_workers_cnt: 100,
            executor_worker_cnt: 1000,
            executor_timeout: Duration::from_secs(30),
            dag_schedule_timeout: Duration::from_secs(15),
            parser_interval: None,
            lifecycle_hooks: LifecycleHooks::default(),
            read_dag_from_dir: None,
        }
    }
}

/// A running workflow engine owning all of its collaborators.
pub struct Engine {
    store: Arc<dyn Store>,
    actions: Arc<ActionRegistry>,
    commander: Commander,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Wire and start every component. Does not block; pair with
    /// [`Engine::run_until_signal`] or call [`Engine::close`] yourself.
    pub async fn init(opt: InitialOption) -> Result<Engine> {
        let store = opt.store;
        let hooks = Arc::new(opt.lifecycle_hooks);
        let actions = Arc::new(ActionRegistry::default());
        let shutdown = CancellationToken::new();

        if let Some(dir) = &opt.read_dag_from_dir {
            loader::read_dag_from_dir(&*store, dir)?;
        }

        let (mailbox, receivers) = ParserMailbox::channel(opt.parser_workers_cnt);

        let (executor, executor_handle) = spawn_executor(
            store.clone(),
            actions.clone(),
            mailbox.clone(),
            opt.executor_worker_cnt,
            opt.executor_timeout,
            shutdown.clone(),
        );

        let parser_interval = opt.parser_interval.unwrap_or(opt.executor_timeout);
        let mut handles = spawn_parser(
            store.clone(),
            executor,
            hooks.clone(),
            mailbox.clone(),
            receivers,
            parser_interval,
            opt.dag_schedule_timeout,
            shutdown.clone(),
        );
        handles.push(executor_handle);

        let commander = Commander::new(store.clone(), mailbox, hooks);

        info!("dagflow engine initialized");
        Ok(Engine {
            store,
            actions,
            commander,
            shutdown,
            handles,
        })
    }

    /// Register one action. Intended for initialization; the registry is
    /// read concurrently once tasks run.
    pub fn register_action(&self, action: Arc<dyn Action>) {
        self.actions.register(action);
    }

    pub fn register_actions(&self, actions: Vec<Arc<dyn Action>>) {
        for action in actions {
            self.actions.register(action);
        }
    }

    /// Client-facing command surface of this engine.
    pub fn commander(&self) -> Commander {
        self.commander.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Block until SIGHUP/SIGINT/SIGTERM/SIGQUIT, then close cleanly.
    pub async fn run_until_signal(self) -> Result<()> {
        wait_for_signal().await?;
        info!("exit signal received; closing engine");
        self.close().await;
        Ok(())
    }

    /// Broadcast shutdown: stop accepting work, cancel in-flight workers
    /// and drain with a bounded grace period; the store closes last.
    pub async fn close(self) {
        self.shutdown.cancel();
        let drain = futures::future::join_all(self.handles);
        if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
            warn!("engine close grace elapsed with workers still running");
        }
        self.store.close();
        info!("engine closed");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = hangup.recv() => {}
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
