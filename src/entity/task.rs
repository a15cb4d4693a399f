// src/entity/task.rs

//! Task templates and their runtime projections.
//!
//! A [`Task`] is a fragment of a [`crate::entity::Dag`]; a [`TaskInstance`]
//! is its projection bound to one dag instance. Instances own the trace
//! log, the pre-check gate and the status transitions the executor drives.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::entity::dag::DagInstance;
use crate::errors::{FlowError, Result};
use crate::store::{Store, TaskInsPatch};

/// Status of one task instance.
///
/// `Retrying` means a retry is pending (either a user command or the
/// executor's own retry policy); `Ending` means cancellation has been
/// acknowledged but the action is still draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskInstanceStatus {
    #[default]
    Init,
    Running,
    Retrying,
    Ending,
    Success,
    Failed,
    Canceled,
    Skipped,
    Blocked,
}

impl TaskInstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::Skipped
        )
    }
}

/// Retry policy of a task: how often the executor re-runs a failed action
/// within the same worker slot, and how long it waits in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Where a pre-check condition reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSource {
    Vars,
    ShareData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    In,
    NotIn,
}

/// One AND-joined condition of a pre-check entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCondition {
    pub source: ConditionSource,
    pub key: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub values: Vec<String>,
}

impl TaskCondition {
    fn meets(&self, dag_ins: &DagInstance) -> bool {
        let value = match self.source {
            ConditionSource::Vars => dag_ins.vars.get(&self.key).map(str::to_string),
            ConditionSource::ShareData => dag_ins.share_data.get(&self.key),
        };
        let Some(value) = value else {
            return false;
        };
        match self.op {
            ConditionOp::In => self.values.contains(&value),
            ConditionOp::NotIn => !self.values.contains(&value),
        }
    }
}

/// What a matched pre-check does with the task.
///
/// Unknown strings survive deserialization so the invalid-act error can
/// surface at pre-check time rather than at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveAction {
    Skip,
    Block,
    Unknown,
}

impl fmt::Display for ActiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => f.write_str("skip"),
            Self::Block => f.write_str("block"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for ActiveAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ActiveAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "skip" => Self::Skip,
            "block" => Self::Block,
            _ => Self::Unknown,
        })
    }
}

/// A named conditional gate evaluated before the action runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreCheck {
    pub conditions: Vec<TaskCondition>,
    pub act: ActiveAction,
}

/// Pre-check entries in declaration order; the first fully-satisfied entry
/// wins. Backed by a vector because declaration order is semantic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreChecks(pub Vec<(String, PreCheck)>);

impl PreChecks {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, PreCheck)> {
        self.0.iter()
    }
}

impl Serialize for PreChecks {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, check) in &self.0 {
            map.serialize_entry(name, check)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PreChecks {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PreChecksVisitor;

        impl<'de> Visitor<'de> for PreChecksVisitor {
            type Value = PreChecks;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of pre-check name to pre-check")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, check)) = access.next_entry::<String, PreCheck>()? {
                    entries.push((name, check));
                }
                Ok(PreChecks(entries))
            }
        }

        deserializer.deserialize_map(PreChecksVisitor)
    }
}

/// A task template fragment inside a dag.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depend_on: Vec<String>,
    #[serde(default)]
    pub pre_checks: PreChecks,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

/// One timestamped trace line on a task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TraceInfo {
    pub time: i64,
    pub message: String,
}

/// When a trace line reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceMode {
    /// Persist the trace with its own patch right away.
    #[default]
    Immediate,
    /// Buffer the trace; it is flushed with the terminal `set_status`.
    PersistAfterAction,
}

/// The runtime projection of one [`Task`] bound to a dag instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub dag_ins_id: String,
    /// Id of the template task this instance was projected from.
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depend_on: Vec<String>,
    #[serde(default)]
    pub pre_checks: PreChecks,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub status: TaskInstanceStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub traces: Vec<TraceInfo>,
    /// Traces recorded with [`TraceMode::PersistAfterAction`], merged into
    /// `traces` by the terminal `set_status`. Never persisted on its own.
    #[serde(skip)]
    pub buf_traces: Vec<TraceInfo>,
}

impl TaskInstance {
    /// Project a template task into a fresh instance of the given dag
    /// instance. The store assigns the id on creation.
    pub fn from_template(dag_ins_id: &str, task: &Task) -> Self {
        Self {
            id: String::new(),
            dag_ins_id: dag_ins_id.to_string(),
            task_id: task.id.clone(),
            name: task.name.clone(),
            action_name: task.action_name.clone(),
            params: task.params.clone(),
            depend_on: task.depend_on.clone(),
            pre_checks: task.pre_checks.clone(),
            timeout_secs: task.timeout_secs,
            retry_policy: task.retry_policy,
            status: TaskInstanceStatus::Init,
            reason: String::new(),
            traces: Vec::new(),
            buf_traces: Vec::new(),
        }
    }

    /// Append a trace line.
    ///
    /// [`TraceMode::Immediate`] patches the trace log right away; a failed
    /// patch keeps the line in memory and logs the error.
    pub fn trace(&mut self, store: &dyn Store, message: impl Into<String>, mode: TraceMode) {
        let info = TraceInfo {
            time: Utc::now().timestamp(),
            message: message.into(),
        };
        match mode {
            TraceMode::PersistAfterAction => self.buf_traces.push(info),
            TraceMode::Immediate => {
                self.traces.push(info);
                if let Err(err) = store.patch_task_ins(
                    &self.id,
                    TaskInsPatch {
                        traces: Some(self.traces.clone()),
                        ..TaskInsPatch::default()
                    },
                ) {
                    warn!(task_ins_id = %self.id, %err, "persist trace failed");
                }
            }
        }
    }

    /// Transition to `status`, flushing buffered traces atomically.
    ///
    /// Both the status and the merged traces are rolled back when the
    /// patch fails, so the in-memory instance stays consistent with the
    /// store.
    pub fn set_status(&mut self, store: &dyn Store, status: TaskInstanceStatus) -> Result<()> {
        let prev_status = self.status;
        let prev_traces_len = self.traces.len();
        let flushed = !self.buf_traces.is_empty();

        self.status = status;
        if flushed {
            let buffered = std::mem::take(&mut self.buf_traces);
            self.traces.extend(buffered);
        }

        let patch = TaskInsPatch {
            status: Some(status),
            reason: Some(self.reason.clone()),
            traces: flushed.then(|| self.traces.clone()),
        };

        if let Err(err) = store.patch_task_ins(&self.id, patch) {
            self.status = prev_status;
            if flushed {
                self.buf_traces = self.traces.split_off(prev_traces_len);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Evaluate the pre-check entries in declaration order and apply the
    /// act of the first fully-satisfied one.
    ///
    /// Returns whether an entry matched. Idempotent on instances that are
    /// already skipped or blocked: no conditions are evaluated and nothing
    /// is written.
    pub fn do_pre_check(&mut self, dag_ins: &DagInstance, store: &dyn Store) -> Result<bool> {
        if matches!(
            self.status,
            TaskInstanceStatus::Skipped | TaskInstanceStatus::Blocked
        ) {
            return Ok(false);
        }

        let mut matched_act = None;
        for (name, check) in self.pre_checks.iter() {
            if check.conditions.iter().all(|c| c.meets(dag_ins)) {
                matched_act = Some((name.clone(), check.act));
                break;
            }
        }

        let Some((name, act)) = matched_act else {
            return Ok(false);
        };

        let status = match act {
            ActiveAction::Skip => TaskInstanceStatus::Skipped,
            ActiveAction::Block => TaskInstanceStatus::Blocked,
            ActiveAction::Unknown => {
                return Err(FlowError::InvalidPreCheckAct {
                    check: name,
                    act: act.to_string(),
                })
            }
        };

        self.status = status;
        store.patch_task_ins(
            &self.id,
            TaskInsPatch {
                status: Some(status),
                ..TaskInsPatch::default()
            },
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::dag::ShareData;
    use crate::store::memory::MemStore;
    use crate::store::{DagInsPatch, ListDagInsInput, ListTaskInsInput};
    use std::collections::HashMap;

    fn stored_instance(store: &MemStore) -> TaskInstance {
        let mut ins = vec![TaskInstance {
            dag_ins_id: "di1".to_string(),
            task_id: "t1".to_string(),
            reason: "reason".to_string(),
            traces: vec![TraceInfo {
                time: 1,
                message: "traces".to_string(),
            }],
            ..TaskInstance::default()
        }];
        store.batch_create_task_ins(&mut ins).expect("create");
        ins.into_iter().next().unwrap()
    }

    /// Store wrapper whose task-instance patch always fails; everything
    /// else delegates.
    struct BrokenPatchStore(MemStore);

    impl Store for BrokenPatchStore {
        fn create_dag(&self, dag: &mut crate::entity::Dag) -> Result<()> {
            self.0.create_dag(dag)
        }
        fn update_dag(&self, dag: &crate::entity::Dag) -> Result<()> {
            self.0.update_dag(dag)
        }
        fn get_dag(&self, dag_id: &str) -> Result<crate::entity::Dag> {
            self.0.get_dag(dag_id)
        }
        fn create_dag_ins(&self, dag_ins: &mut DagInstance) -> Result<()> {
            self.0.create_dag_ins(dag_ins)
        }
        fn update_dag_ins(&self, dag_ins: &DagInstance) -> Result<()> {
            self.0.update_dag_ins(dag_ins)
        }
        fn patch_dag_ins(&self, id: &str, patch: DagInsPatch) -> Result<()> {
            self.0.patch_dag_ins(id, patch)
        }
        fn get_dag_ins(&self, id: &str) -> Result<DagInstance> {
            self.0.get_dag_ins(id)
        }
        fn list_dag_ins(&self, input: &ListDagInsInput) -> Result<Vec<DagInstance>> {
            self.0.list_dag_ins(input)
        }
        fn batch_create_task_ins(&self, task_ins: &mut [TaskInstance]) -> Result<()> {
            self.0.batch_create_task_ins(task_ins)
        }
        fn update_task_ins(&self, task_ins: &TaskInstance) -> Result<()> {
            self.0.update_task_ins(task_ins)
        }
        fn patch_task_ins(&self, _id: &str, _patch: TaskInsPatch) -> Result<()> {
            Err(FlowError::StoreError("patch failed".to_string()))
        }
        fn get_task_ins(&self, id: &str) -> Result<TaskInstance> {
            self.0.get_task_ins(id)
        }
        fn list_task_ins(&self, input: &ListTaskInsInput) -> Result<Vec<TaskInstance>> {
            self.0.list_task_ins(input)
        }
        fn close(&self) {}
    }

    #[test]
    fn set_status_without_buffered_traces_patches_status_and_reason() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);

        ins.set_status(&store, TaskInstanceStatus::Failed)
            .expect("set status");

        let stored = store.get_task_ins(&ins.id).expect("get");
        assert_eq!(stored.status, TaskInstanceStatus::Failed);
        assert_eq!(stored.reason, "reason");
        assert_eq!(stored.traces.len(), 1);
    }

    #[test]
    fn set_status_flushes_buffered_traces_atomically() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);
        ins.buf_traces.push(TraceInfo {
            time: 2,
            message: "buf-traces".to_string(),
        });

        ins.set_status(&store, TaskInstanceStatus::Success)
            .expect("set status");

        assert!(ins.buf_traces.is_empty());
        let stored = store.get_task_ins(&ins.id).expect("get");
        let messages: Vec<_> = stored.traces.iter().map(|t| t.message.as_str()).collect();
        assert_eq!(messages, vec!["traces", "buf-traces"]);
    }

    #[test]
    fn set_status_rolls_back_on_patch_failure() {
        let store = BrokenPatchStore(MemStore::new());
        let mut ins = stored_instance(&store.0);
        ins.buf_traces.push(TraceInfo {
            time: 2,
            message: "buf-traces".to_string(),
        });

        let err = ins
            .set_status(&store, TaskInstanceStatus::Failed)
            .unwrap_err();
        assert!(matches!(err, FlowError::StoreError(_)));

        assert_eq!(ins.status, TaskInstanceStatus::Init);
        assert_eq!(ins.traces.len(), 1);
        assert_eq!(ins.buf_traces.len(), 1);
        assert_eq!(ins.buf_traces[0].message, "buf-traces");
    }

    #[test]
    fn trace_immediate_patches_buffered_waits() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);

        ins.trace(&store, "now", TraceMode::Immediate);
        let stored = store.get_task_ins(&ins.id).expect("get");
        assert_eq!(stored.traces.len(), 2);
        assert_eq!(stored.traces[1].message, "now");

        ins.trace(&store, "later", TraceMode::PersistAfterAction);
        let stored = store.get_task_ins(&ins.id).expect("get");
        assert_eq!(stored.traces.len(), 2);
        assert_eq!(ins.buf_traces.len(), 1);
    }

    fn share_dag_ins(pairs: &[(&str, &str)]) -> DagInstance {
        DagInstance {
            id: "di1".to_string(),
            share_data: ShareData::from_map(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..DagInstance::default()
        }
    }

    fn check(source: ConditionSource, key: &str, values: &[&str], act: ActiveAction) -> PreCheck {
        PreCheck {
            conditions: vec![TaskCondition {
                source,
                key: key.to_string(),
                op: ConditionOp::In,
                values: values.iter().map(|v| v.to_string()).collect(),
            }],
            act,
        }
    }

    #[test]
    fn pre_check_share_data_skip() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);
        ins.pre_checks = PreChecks(vec![(
            "first".to_string(),
            check(
                ConditionSource::ShareData,
                "key1",
                &["value3"],
                ActiveAction::Skip,
            ),
        )]);

        let dag_ins = share_dag_ins(&[("key1", "value3")]);
        let matched = ins.do_pre_check(&dag_ins, &store).expect("pre-check");
        assert!(matched);
        assert_eq!(ins.status, TaskInstanceStatus::Skipped);
        assert_eq!(
            store.get_task_ins(&ins.id).unwrap().status,
            TaskInstanceStatus::Skipped
        );
    }

    #[test]
    fn pre_check_first_match_wins_in_declaration_order() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);
        ins.pre_checks = PreChecks(vec![
            (
                "first".to_string(),
                check(
                    ConditionSource::ShareData,
                    "key1",
                    &["value2"],
                    ActiveAction::Block,
                ),
            ),
            (
                "second".to_string(),
                check(
                    ConditionSource::ShareData,
                    "key1",
                    &["value2", "value3"],
                    ActiveAction::Skip,
                ),
            ),
        ]);

        let dag_ins = share_dag_ins(&[("key1", "value2")]);
        assert!(ins.do_pre_check(&dag_ins, &store).expect("pre-check"));
        assert_eq!(ins.status, TaskInstanceStatus::Blocked);
    }

    #[test]
    fn pre_check_second_entry_matches_when_first_does_not() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);
        ins.pre_checks = PreChecks(vec![
            (
                "first".to_string(),
                check(
                    ConditionSource::ShareData,
                    "key1",
                    &["value3"],
                    ActiveAction::Block,
                ),
            ),
            (
                "second".to_string(),
                check(
                    ConditionSource::ShareData,
                    "key1",
                    &["value4"],
                    ActiveAction::Skip,
                ),
            ),
        ]);

        let dag_ins = share_dag_ins(&[("key1", "value4")]);
        assert!(ins.do_pre_check(&dag_ins, &store).expect("pre-check"));
        assert_eq!(ins.status, TaskInstanceStatus::Skipped);
    }

    #[test]
    fn pre_check_vars_source_and_miss() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);
        ins.pre_checks = PreChecks(vec![(
            "first".to_string(),
            check(
                ConditionSource::Vars,
                "key1",
                &["value1", "value2"],
                ActiveAction::Block,
            ),
        )]);

        let mut dag_ins = DagInstance::default();
        dag_ins.vars.insert("key1".to_string(), "value3".to_string());
        assert!(!ins.do_pre_check(&dag_ins, &store).expect("pre-check"));
        assert_eq!(ins.status, TaskInstanceStatus::Init);

        dag_ins.vars.insert("key1".to_string(), "value2".to_string());
        assert!(ins.do_pre_check(&dag_ins, &store).expect("pre-check"));
        assert_eq!(ins.status, TaskInstanceStatus::Blocked);
    }

    #[test]
    fn pre_check_invalid_act_is_an_error() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);
        ins.pre_checks = PreChecks(vec![(
            "first".to_string(),
            check(
                ConditionSource::Vars,
                "key1",
                &["value3"],
                ActiveAction::Unknown,
            ),
        )]);

        let mut dag_ins = DagInstance::default();
        dag_ins.vars.insert("key1".to_string(), "value3".to_string());
        let err = ins.do_pre_check(&dag_ins, &store).unwrap_err();
        assert!(matches!(err, FlowError::InvalidPreCheckAct { check, .. } if check == "first"));
    }

    #[test]
    fn pre_check_is_idempotent_on_skipped_and_blocked() {
        let store = MemStore::new();
        let mut ins = stored_instance(&store);
        ins.pre_checks = PreChecks(vec![(
            "first".to_string(),
            check(
                ConditionSource::ShareData,
                "key1",
                &["value3"],
                ActiveAction::Skip,
            ),
        )]);
        ins.status = TaskInstanceStatus::Skipped;

        let dag_ins = share_dag_ins(&[("key1", "value3")]);
        assert!(!ins.do_pre_check(&dag_ins, &store).expect("pre-check"));
        assert_eq!(ins.status, TaskInstanceStatus::Skipped);
    }

    #[test]
    fn pre_checks_preserve_declaration_order_through_yaml() {
        let yaml = r#"
zeta:
  conditions:
    - source: share_data
      key: k
      op: in
      values: ["v"]
  act: skip
alpha:
  conditions:
    - source: vars
      key: k
      op: not_in
      values: ["v"]
  act: block
"#;
        let checks: PreChecks = serde_yaml::from_str(yaml).expect("parse");
        let names: Vec<_> = checks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(checks.0[0].1.act, ActiveAction::Skip);
        assert_eq!(checks.0[1].1.conditions[0].op, ConditionOp::NotIn);
    }

    #[test]
    fn unknown_pre_check_act_survives_deserialization() {
        let yaml = r#"
gate:
  conditions: []
  act: explode
"#;
        let checks: PreChecks = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(checks.0[0].1.act, ActiveAction::Unknown);
    }

    #[test]
    fn task_instance_serde_skips_buffered_traces() {
        let mut ins = TaskInstance {
            id: "ti1".to_string(),
            ..TaskInstance::default()
        };
        ins.buf_traces.push(TraceInfo {
            time: 1,
            message: "buffered".to_string(),
        });

        let raw = serde_json::to_value(&ins).expect("serialize");
        assert!(raw.get("bufTraces").is_none());

        let back: TaskInstance = serde_json::from_value(raw).expect("deserialize");
        assert!(back.buf_traces.is_empty());
    }

    #[test]
    fn condition_missing_key_never_matches() {
        let dag_ins = DagInstance {
            share_data: ShareData::from_map(HashMap::new()),
            ..DagInstance::default()
        };
        let cond = TaskCondition {
            source: ConditionSource::ShareData,
            key: "absent".to_string(),
            op: ConditionOp::NotIn,
            values: vec!["v".to_string()],
        };
        assert!(!cond.meets(&dag_ins));
    }
}
