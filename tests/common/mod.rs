// tests/common/mod.rs

//! Shared helpers for the engine integration tests: a small engine
//! configuration, controllable actions and polling wait helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use dagflow::{
    Action, Dag, DagInstance, DagInstanceStatus, DagStatus, Engine, ExecuteContext, FlowError,
    InitialOption, ListTaskInsInput, MemStore, Store, Task, TaskInstance, TaskInstanceStatus,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Engine sized for tests: few workers, fast pollers.
pub async fn test_engine(store: Arc<MemStore>) -> Engine {
    let mut opt = InitialOption::new(store);
    opt.parser_workers_cnt = 4;
    opt.executor_worker_cnt = 8;
    opt.executor_timeout = Duration::from_secs(5);
    opt.dag_schedule_timeout = Duration::from_secs(1);
    opt.parser_interval = Some(Duration::from_millis(100));
    Engine::init(opt).await.expect("init engine")
}

pub fn dag(id: &str, tasks: Vec<Task>) -> Dag {
    Dag {
        id: id.to_string(),
        name: id.to_string(),
        status: DagStatus::Normal,
        tasks,
        ..Dag::default()
    }
}

pub fn task(id: &str, action: &str, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        action_name: action.to_string(),
        depend_on: deps.iter().map(|d| d.to_string()).collect(),
        ..Task::default()
    }
}

/// Records the template task ids it ran, in order.
pub struct RecordAction {
    name: String,
    pub order: Arc<Mutex<Vec<String>>>,
}

impl RecordAction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            order: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl Action for RecordAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ExecuteContext, _params: &Value) -> dagflow::Result<()> {
        self.order.lock().unwrap().push(ctx.task_ins().task_id);
        Ok(())
    }
}

/// Blocks until the test opens the gate for the task; lets tests hold a
/// task "mid-flight" deterministically.
pub struct GateAction {
    name: String,
    gates: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl GateAction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn gate(&self, task_id: &str) -> Arc<Notify> {
        self.gates
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Allow the given task to complete. Safe to call before the task
    /// starts; the permit is stored.
    pub fn open(&self, task_id: &str) {
        self.gate(task_id).notify_one();
    }
}

#[async_trait]
impl Action for GateAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ExecuteContext, _params: &Value) -> dagflow::Result<()> {
        let gate = self.gate(&ctx.task_ins().task_id);
        gate.notified().await;
        Ok(())
    }
}

/// Fails the first `failures` runs, then succeeds. Counts attempts.
pub struct FlakyAction {
    name: String,
    failures: AtomicU32,
    pub attempts: AtomicU32,
}

impl FlakyAction {
    pub fn new(name: &str, failures: u32) -> Self {
        Self {
            name: name.to_string(),
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Action for FlakyAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &ExecuteContext, _params: &Value) -> dagflow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FlowError::ActionError(format!(
                "flaky failure, {remaining} remaining"
            )));
        }
        Ok(())
    }
}

/// Fails while the switch is on; tests flip it off before retrying.
pub struct SwitchAction {
    name: String,
    pub should_fail: Arc<AtomicBool>,
}

impl SwitchAction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            should_fail: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[async_trait]
impl Action for SwitchAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &ExecuteContext, _params: &Value) -> dagflow::Result<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(FlowError::ActionError("switch is failing".to_string()));
        }
        Ok(())
    }
}

/// Writes one share-data entry taken from its params.
pub struct SetShareAction {
    name: String,
}

impl SetShareAction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Action for SetShareAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ExecuteContext, params: &Value) -> dagflow::Result<()> {
        let key = params["key"].as_str().unwrap_or_default();
        let value = params["value"].as_str().unwrap_or_default();
        ctx.share_data().set(key, value);
        ctx.trace(format!("share data {key}={value}"));
        Ok(())
    }
}

const POLL: Duration = Duration::from_millis(20);

/// Poll until the dag instance reaches `status` or panic after `timeout`.
pub async fn wait_for_dag_status(
    store: &MemStore,
    dag_ins_id: &str,
    status: DagInstanceStatus,
    timeout: Duration,
) -> DagInstance {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = None;
    while tokio::time::Instant::now() < deadline {
        if let Ok(ins) = store.get_dag_ins(dag_ins_id) {
            if ins.status == status {
                return ins;
            }
            last = Some(ins.status);
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("dag instance {dag_ins_id} never reached {status:?} (last seen {last:?})");
}

/// Poll until the task instance projected from `task_id` reaches `status`.
pub async fn wait_for_task_status(
    store: &MemStore,
    dag_ins_id: &str,
    task_id: &str,
    status: TaskInstanceStatus,
    timeout: Duration,
) -> TaskInstance {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = None;
    while tokio::time::Instant::now() < deadline {
        if let Some(ins) = task_by_template(store, dag_ins_id, task_id) {
            if ins.status == status {
                return ins;
            }
            last = Some(ins.status);
        }
        tokio::time::sleep(POLL).await;
    }
    panic!(
        "task {task_id} of {dag_ins_id} never reached {status:?} (last seen {last:?})"
    );
}

/// The task instance projected from the given template task, if created.
pub fn task_by_template(
    store: &MemStore,
    dag_ins_id: &str,
    task_id: &str,
) -> Option<TaskInstance> {
    store
        .list_task_ins(&ListTaskInsInput {
            dag_ins_id: Some(dag_ins_id.to_string()),
            ..ListTaskInsInput::default()
        })
        .ok()?
        .into_iter()
        .find(|t| t.task_id == task_id)
}
