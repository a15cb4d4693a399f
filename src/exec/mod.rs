// src/exec/mod.rs

//! Action execution: the user-facing [`Action`] trait, the per-task
//! [`ExecuteContext`] handed to actions, and the bounded worker pool in
//! [`executor`].

pub mod executor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::entity::{DagInstance, ShareData, TaskInstance, TraceMode};
use crate::errors::Result;
use crate::store::Store;

pub use executor::{spawn_executor, ExecutorHandle};

/// A named handler invoked by task instances.
///
/// Actions are registered once during engine initialization and looked up
/// by `Task.action_name`. `run` is raced against the task deadline and the
/// cancellation handle: a non-cooperative action still yields a terminal
/// task status because the worker decides the outcome independently of the
/// action's return. Cooperative actions observe [`ExecuteContext::canceled`].
#[async_trait]
pub trait Action: Send + Sync {
    /// Unique action identity referenced by task definitions.
    fn name(&self) -> &str;

    /// Execute with rendered params. An error fails the task instance with
    /// the message as reason.
    async fn run(&self, ctx: &ExecuteContext, params: &Value) -> Result<()>;
}

/// Registry of actions, keyed by name.
///
/// Mutated only during initialization; read concurrently afterwards.
#[derive(Default)]
pub struct ActionRegistry {
    map: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    pub fn register(&self, action: Arc<dyn Action>) {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name).cloned()
    }
}

/// Per-task context handed to [`Action::run`].
///
/// Exposes the cancellation handle, the dag instance variables, the shared
/// key-value bag and the trace sink of the running task instance.
pub struct ExecuteContext {
    store: Arc<dyn Store>,
    dag_ins: Arc<DagInstance>,
    task_ins: Arc<Mutex<TaskInstance>>,
    cancel: CancellationToken,
}

impl ExecuteContext {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        dag_ins: Arc<DagInstance>,
        task_ins: Arc<Mutex<TaskInstance>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            dag_ins,
            task_ins,
            cancel,
        }
    }

    /// Whether cancellation has been requested for this task.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested; cooperative actions can
    /// select against it.
    pub async fn canceled(&self) {
        self.cancel.cancelled().await
    }

    /// Read one dag-instance variable.
    pub fn var(&self, key: &str) -> Option<String> {
        self.dag_ins.vars.get(key).map(str::to_string)
    }

    /// Visit every dag-instance variable; stop early by returning `true`.
    pub fn iterate_vars(&self, f: impl FnMut(&str, &str) -> bool) {
        self.dag_ins.vars.iterate(f)
    }

    /// The shared key-value bag of the dag instance. Writes persist
    /// immediately.
    pub fn share_data(&self) -> &ShareData {
        &self.dag_ins.share_data
    }

    /// Append a trace line, persisted with its own patch right away.
    pub fn trace(&self, message: impl Into<String>) {
        self.trace_with(message, TraceMode::Immediate)
    }

    /// Append a trace line with explicit persistence behaviour.
    pub fn trace_with(&self, message: impl Into<String>, mode: TraceMode) {
        let mut task_ins = self
            .task_ins
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        task_ins.trace(&*self.store, message, mode);
    }

    /// Snapshot of the running task instance.
    pub fn task_ins(&self) -> TaskInstance {
        self.task_ins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
