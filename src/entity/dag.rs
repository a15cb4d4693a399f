// src/entity/dag.rs

//! DAG templates, DAG instances and their runtime companions.
//!
//! A [`Dag`] is a reusable template; [`Dag::run`] projects it into a
//! [`DagInstance`] that carries the per-execution state: rendered
//! variables, the shared key-value bag, the instance status and an
//! optional pending [`Command`]. Instances are advanced solely by the
//! parser; clients steer them through commands.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::error;

use crate::entity::task::Task;
use crate::errors::{FlowError, Result};
use crate::store::{DagInsPatch, Store};

/// Why a dag instance was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Manually,
    Cron,
}

/// Template status. A stopped dag refuses to produce new instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DagStatus {
    #[default]
    Normal,
    Stopped,
}

/// A variable declared on the template: description plus default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DagVar {
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub default_value: String,
}

/// A dag template: stable id, declared variables and an ordered task list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Dag {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub vars: HashMap<String, DagVar>,
    #[serde(default)]
    pub status: DagStatus,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Dag {
    /// Build a new [`DagInstance`] from this template.
    ///
    /// Variables are resolved by preferring a non-empty `spec_vars` entry
    /// over the declared default. The instance still has to be saved to the
    /// store and handed to the parser before anything runs.
    pub fn run(
        &self,
        trigger: Trigger,
        spec_vars: Option<&HashMap<String, String>>,
    ) -> Result<DagInstance> {
        if self.status != DagStatus::Normal {
            return Err(FlowError::DagStopped(self.id.clone()));
        }

        let mut vars = DagInstanceVars::default();
        for (key, var) in &self.vars {
            let value = match spec_vars.and_then(|sv| sv.get(key)) {
                Some(v) if !v.is_empty() => v.clone(),
                _ => var.default_value.clone(),
            };
            vars.insert(key.clone(), value);
        }

        Ok(DagInstance {
            id: String::new(),
            dag_id: self.id.clone(),
            trigger,
            worker: None,
            vars,
            share_data: ShareData::default(),
            status: DagInstanceStatus::Init,
            reason: String::new(),
            cmd: None,
            created_at: 0,
            updated_at: 0,
        })
    }
}

/// Status of one dag instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DagInstanceStatus {
    #[default]
    Init,
    Running,
    Blocked,
    Failed,
    Success,
}

impl DagInstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Success)
    }
}

/// A runtime variable value on a dag instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DagInstanceVar {
    #[serde(default)]
    pub value: String,
}

/// The variable set of a dag instance, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct DagInstanceVars(pub HashMap<String, DagInstanceVar>);

impl DagInstanceVars {
    pub fn insert(&mut self, key: String, value: String) {
        self.0.insert(key, DagInstanceVar { value });
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.value.as_str())
    }

    /// Visit every variable; stop early when the closure returns `true`.
    pub fn iterate(&self, mut f: impl FnMut(&str, &str) -> bool) {
        for (k, v) in &self.0 {
            if f(k, &v.value) {
                break;
            }
        }
    }

    /// Substitute `{{name}}` occurrences in every string leaf of `params`.
    ///
    /// Unknown names are left literal so downstream consumers can spot
    /// them.
    pub fn render(&self, params: &Value) -> Value {
        match params {
            Value::String(s) => Value::String(self.render_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn render_str(&self, s: &str) -> String {
        let mut out = s.to_string();
        for (key, var) in &self.0 {
            out = out.replace(&format!("{{{{{key}}}}}"), &var.value);
        }
        out
    }
}

type SaveFn = Box<dyn Fn(&HashMap<String, String>) -> Result<()> + Send + Sync>;

/// Shared key-value bag readable and writable from every task of one dag
/// instance. Thread-safe; each successful [`ShareData::set`] persists the
/// whole bag through the bound save hook. A failed save rolls the write
/// back and logs.
#[derive(Default)]
pub struct ShareData {
    dict: Mutex<HashMap<String, String>>,
    save: Mutex<Option<SaveFn>>,
}

impl ShareData {
    pub fn from_map(dict: HashMap<String, String>) -> Self {
        Self {
            dict: Mutex::new(dict),
            save: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let dict = self.dict.lock().unwrap_or_else(PoisonError::into_inner);
        dict.get(key).cloned()
    }

    /// Set a value and persist the bag. On persistence failure the write
    /// is rolled back and the error logged; readers never observe a value
    /// that was not stored.
    pub fn set(&self, key: &str, val: &str) {
        let mut dict = self.dict.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = dict.insert(key.to_string(), val.to_string());

        let save = self.save.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(save) = save.as_ref() {
            if let Err(err) = save(&dict) {
                match prev {
                    Some(prev) => dict.insert(key.to_string(), prev),
                    None => dict.remove(key),
                };
                error!(key, value = val, %err, "save share data failed");
            }
        }
    }

    /// Snapshot of the current mapping.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.dict
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn bind_save(&self, f: SaveFn) {
        let mut save = self.save.lock().unwrap_or_else(PoisonError::into_inner);
        *save = Some(f);
    }
}

impl Clone for ShareData {
    fn clone(&self) -> Self {
        // The save hook is a runtime binding and intentionally not cloned.
        Self::from_map(self.snapshot())
    }
}

impl fmt::Debug for ShareData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareData")
            .field("dict", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl PartialEq for ShareData {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

// Only the inner mapping crosses the wire.
impl Serialize for ShareData {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ShareData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let dict = HashMap::<String, String>::deserialize(deserializer)?;
        Ok(Self::from_map(dict))
    }
}

/// A user-issued intent attached to a dag instance until the parser
/// consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub name: CommandName,
    pub target_task_ins_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandName {
    Retry,
    Cancel,
}

type HookFn = Box<dyn Fn(&mut DagInstance) + Send + Sync>;

/// Lifecycle hooks fired right before the matching instance transition.
///
/// Hooks run on the parser worker owning the instance; authors must not
/// assume reentrancy. All fields default to no-op.
#[derive(Default)]
pub struct LifecycleHooks {
    pub before_run: Option<HookFn>,
    pub before_success: Option<HookFn>,
    pub before_fail: Option<HookFn>,
    pub before_block: Option<HookFn>,
    pub before_retry: Option<HookFn>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks").finish_non_exhaustive()
    }
}

fn fire(hook: &Option<HookFn>, dag_ins: &mut DagInstance) {
    if let Some(hook) = hook {
        hook(dag_ins);
    }
}

/// One execution of a dag template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DagInstance {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub dag_id: String,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub vars: DagInstanceVars,
    #[serde(default)]
    pub share_data: ShareData,
    #[serde(default)]
    pub status: DagInstanceStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub cmd: Option<Command>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl DagInstance {
    /// Request cancellation of the given task instances.
    ///
    /// Only records the command; the parser executes it.
    pub fn cancel(&mut self, task_ins_ids: Vec<String>) -> Result<()> {
        if self.status != DagInstanceStatus::Running {
            return Err(FlowError::InvalidCommandState(
                "you can only cancel a running dag instance".to_string(),
            ));
        }
        if self.cmd.is_some() {
            return Err(FlowError::InvalidCommandState(
                "dag instance has an incomplete command".to_string(),
            ));
        }
        self.cmd = Some(Command {
            name: CommandName::Cancel,
            target_task_ins_ids: task_ins_ids,
        });
        Ok(())
    }

    /// Request a retry of the given task instances.
    pub fn retry(&mut self, task_ins_ids: Vec<String>, hooks: &LifecycleHooks) -> Result<()> {
        if self.cmd.is_some() {
            return Err(FlowError::InvalidCommandState(
                "dag instance has an incomplete command".to_string(),
            ));
        }
        fire(&hooks.before_retry, self);
        self.cmd = Some(Command {
            name: CommandName::Retry,
            target_task_ins_ids: task_ins_ids,
        });
        Ok(())
    }

    pub fn run(&mut self, hooks: &LifecycleHooks) {
        fire(&hooks.before_run, self);
        self.status = DagInstanceStatus::Running;
        self.reason = String::new();
    }

    pub fn success(&mut self, hooks: &LifecycleHooks) {
        fire(&hooks.before_success, self);
        self.status = DagInstanceStatus::Success;
        self.reason = String::new();
    }

    /// Fail the instance. The reason is set before the hook fires so hook
    /// authors can observe it.
    pub fn fail(&mut self, reason: impl Into<String>, hooks: &LifecycleHooks) {
        self.reason = reason.into();
        fire(&hooks.before_fail, self);
        self.status = DagInstanceStatus::Failed;
    }

    /// Block the instance. The current reason is left untouched.
    pub fn block(&mut self, hooks: &LifecycleHooks) {
        fire(&hooks.before_block, self);
        self.status = DagInstanceStatus::Blocked;
    }

    /// A failed instance is terminal-sticky: the parser never moves it
    /// anywhere else. The retry command is the explicit escape hatch.
    pub fn can_modify_status(&self) -> bool {
        self.status != DagInstanceStatus::Failed
    }

    /// Bind the share-data bag to the store so every `set` persists.
    pub fn attach_store(&self, store: Arc<dyn Store>) {
        let id = self.id.clone();
        self.share_data.bind_save(Box::new(move |dict| {
            store.patch_dag_ins(
                &id,
                DagInsPatch {
                    share_data: Some(dict.clone()),
                    ..DagInsPatch::default()
                },
            )
        }));
    }
}
