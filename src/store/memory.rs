// src/store/memory.rs

//! In-memory store.
//!
//! One store-wide mutex serializes every operation; records are cloned on
//! the way in and out so callers never share memory with the store.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use uuid::Uuid;

use crate::entity::{Dag, DagInstance, ShareData, TaskInstance};
use crate::errors::{FlowError, Result};
use crate::store::{DagInsPatch, ListDagInsInput, ListTaskInsInput, Store, TaskInsPatch};

#[derive(Default)]
struct Inner {
    dags: HashMap<String, Dag>,
    dag_ins: HashMap<String, DagInstance>,
    task_ins: HashMap<String, TaskInstance>,
}

/// In-memory [`Store`] implementation backed by hash maps.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn next_id() -> String {
    Uuid::new_v4().to_string()
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemStore {
    fn create_dag(&self, dag: &mut Dag) -> Result<()> {
        if dag.id.is_empty() {
            dag.id = next_id();
        }
        let mut inner = self.lock();
        if inner.dags.contains_key(&dag.id) {
            return Err(FlowError::Conflict(dag.id.clone()));
        }
        inner.dags.insert(dag.id.clone(), dag.clone());
        Ok(())
    }

    fn update_dag(&self, dag: &Dag) -> Result<()> {
        let mut inner = self.lock();
        if !inner.dags.contains_key(&dag.id) {
            return Err(FlowError::NotFound(dag.id.clone()));
        }
        inner.dags.insert(dag.id.clone(), dag.clone());
        Ok(())
    }

    fn get_dag(&self, dag_id: &str) -> Result<Dag> {
        self.lock()
            .dags
            .get(dag_id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(dag_id.to_string()))
    }

    fn create_dag_ins(&self, dag_ins: &mut DagInstance) -> Result<()> {
        if dag_ins.id.is_empty() {
            dag_ins.id = next_id();
        }
        let now = Utc::now().timestamp();
        dag_ins.created_at = now;
        dag_ins.updated_at = now;

        let mut inner = self.lock();
        if inner.dag_ins.contains_key(&dag_ins.id) {
            return Err(FlowError::Conflict(dag_ins.id.clone()));
        }
        inner.dag_ins.insert(dag_ins.id.clone(), dag_ins.clone());
        Ok(())
    }

    fn update_dag_ins(&self, dag_ins: &DagInstance) -> Result<()> {
        let mut inner = self.lock();
        if !inner.dag_ins.contains_key(&dag_ins.id) {
            return Err(FlowError::NotFound(dag_ins.id.clone()));
        }
        let mut record = dag_ins.clone();
        record.updated_at = Utc::now().timestamp();
        inner.dag_ins.insert(record.id.clone(), record);
        Ok(())
    }

    fn patch_dag_ins(&self, id: &str, patch: DagInsPatch) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .dag_ins
            .get_mut(id)
            .ok_or_else(|| FlowError::NotFound(id.to_string()))?;

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(reason) = patch.reason {
            record.reason = reason;
        }
        if let Some(worker) = patch.worker {
            record.worker = Some(worker);
        }
        if let Some(share_data) = patch.share_data {
            record.share_data = ShareData::from_map(share_data);
        }
        if let Some(cmd) = patch.cmd {
            record.cmd = cmd;
        }
        record.updated_at = Utc::now().timestamp();
        Ok(())
    }

    fn get_dag_ins(&self, id: &str) -> Result<DagInstance> {
        self.lock()
            .dag_ins
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(id.to_string()))
    }

    fn list_dag_ins(&self, input: &ListDagInsInput) -> Result<Vec<DagInstance>> {
        let inner = self.lock();
        let mut out: Vec<DagInstance> = inner
            .dag_ins
            .values()
            .filter(|ins| {
                if let Some(dag_id) = &input.dag_id {
                    if &ins.dag_id != dag_id {
                        return false;
                    }
                }
                if !input.status.is_empty() && !input.status.contains(&ins.status) {
                    return false;
                }
                if let Some(has_cmd) = input.has_cmd {
                    if ins.cmd.is_some() != has_cmd {
                        return false;
                    }
                }
                if let Some(end) = input.updated_end {
                    if ins.updated_at > end {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn batch_create_task_ins(&self, task_ins: &mut [TaskInstance]) -> Result<()> {
        let mut inner = self.lock();
        for ins in task_ins.iter() {
            if !ins.id.is_empty() && inner.task_ins.contains_key(&ins.id) {
                return Err(FlowError::Conflict(ins.id.clone()));
            }
        }
        for ins in task_ins.iter_mut() {
            if ins.id.is_empty() {
                ins.id = next_id();
            }
            inner.task_ins.insert(ins.id.clone(), ins.clone());
        }
        Ok(())
    }

    fn update_task_ins(&self, task_ins: &TaskInstance) -> Result<()> {
        let mut inner = self.lock();
        if !inner.task_ins.contains_key(&task_ins.id) {
            return Err(FlowError::NotFound(task_ins.id.clone()));
        }
        inner.task_ins.insert(task_ins.id.clone(), task_ins.clone());
        Ok(())
    }

    fn patch_task_ins(&self, id: &str, patch: TaskInsPatch) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .task_ins
            .get_mut(id)
            .ok_or_else(|| FlowError::NotFound(id.to_string()))?;

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(reason) = patch.reason {
            record.reason = reason;
        }
        if let Some(traces) = patch.traces {
            record.traces = traces;
        }
        Ok(())
    }

    fn get_task_ins(&self, id: &str) -> Result<TaskInstance> {
        self.lock()
            .task_ins
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(id.to_string()))
    }

    fn list_task_ins(&self, input: &ListTaskInsInput) -> Result<Vec<TaskInstance>> {
        let inner = self.lock();
        let mut out: Vec<TaskInstance> = inner
            .task_ins
            .values()
            .filter(|ins| {
                if !input.ids.is_empty() && !input.ids.contains(&ins.id) {
                    return false;
                }
                if let Some(dag_ins_id) = &input.dag_ins_id {
                    if &ins.dag_ins_id != dag_ins_id {
                        return false;
                    }
                }
                if !input.status.is_empty() && !input.status.contains(&ins.status) {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Command, CommandName, DagInstanceStatus, TaskInstanceStatus};

    fn new_ins() -> DagInstance {
        DagInstance {
            dag_id: "d1".to_string(),
            ..DagInstance::default()
        }
    }

    #[test]
    fn create_assigns_id_and_rejects_duplicates() {
        let store = MemStore::new();
        let mut ins = new_ins();
        store.create_dag_ins(&mut ins).expect("create");
        assert!(!ins.id.is_empty());
        assert!(ins.created_at > 0);

        let err = store.create_dag_ins(&mut ins).unwrap_err();
        assert!(matches!(err, FlowError::Conflict(_)));
    }

    #[test]
    fn patch_leaves_cmd_untouched_unless_named() {
        let store = MemStore::new();
        let mut ins = new_ins();
        ins.cmd = Some(Command {
            name: CommandName::Retry,
            target_task_ins_ids: vec!["t1".to_string()],
        });
        store.create_dag_ins(&mut ins).expect("create");

        // A patch that does not name cmd keeps the pending command.
        store
            .patch_dag_ins(
                &ins.id,
                DagInsPatch {
                    status: Some(DagInstanceStatus::Running),
                    ..DagInsPatch::default()
                },
            )
            .expect("patch");
        let got = store.get_dag_ins(&ins.id).expect("get");
        assert_eq!(got.status, DagInstanceStatus::Running);
        assert!(got.cmd.is_some());

        // Naming cmd with the clear form removes it.
        store
            .patch_dag_ins(
                &ins.id,
                DagInsPatch {
                    cmd: Some(None),
                    ..DagInsPatch::default()
                },
            )
            .expect("patch");
        assert!(store.get_dag_ins(&ins.id).expect("get").cmd.is_none());

        // And a non-nil value writes it back.
        store
            .patch_dag_ins(
                &ins.id,
                DagInsPatch {
                    cmd: Some(Some(Command {
                        name: CommandName::Cancel,
                        target_task_ins_ids: vec![],
                    })),
                    ..DagInsPatch::default()
                },
            )
            .expect("patch");
        let got = store.get_dag_ins(&ins.id).expect("get");
        assert_eq!(got.cmd.unwrap().name, CommandName::Cancel);
    }

    #[test]
    fn patch_can_clear_reason() {
        let store = MemStore::new();
        let mut ins = new_ins();
        ins.reason = "t2".to_string();
        store.create_dag_ins(&mut ins).expect("create");

        store
            .patch_dag_ins(
                &ins.id,
                DagInsPatch {
                    reason: Some(String::new()),
                    ..DagInsPatch::default()
                },
            )
            .expect("patch");
        assert_eq!(store.get_dag_ins(&ins.id).expect("get").reason, "");
    }

    #[test]
    fn list_dag_ins_honours_all_filters() {
        let store = MemStore::new();

        let mut running = new_ins();
        running.status = DagInstanceStatus::Running;
        store.create_dag_ins(&mut running).expect("create");

        let mut other_dag = DagInstance {
            dag_id: "d2".to_string(),
            status: DagInstanceStatus::Running,
            cmd: Some(Command {
                name: CommandName::Cancel,
                target_task_ins_ids: vec![],
            }),
            ..DagInstance::default()
        };
        store.create_dag_ins(&mut other_dag).expect("create");

        let by_dag = store
            .list_dag_ins(&ListDagInsInput {
                dag_id: Some("d1".to_string()),
                ..ListDagInsInput::default()
            })
            .expect("list");
        assert_eq!(by_dag.len(), 1);
        assert_eq!(by_dag[0].id, running.id);

        let with_cmd = store
            .list_dag_ins(&ListDagInsInput {
                has_cmd: Some(true),
                ..ListDagInsInput::default()
            })
            .expect("list");
        assert_eq!(with_cmd.len(), 1);
        assert_eq!(with_cmd[0].id, other_dag.id);

        let none = store
            .list_dag_ins(&ListDagInsInput {
                status: vec![DagInstanceStatus::Failed],
                ..ListDagInsInput::default()
            })
            .expect("list");
        assert!(none.is_empty());

        let past = store
            .list_dag_ins(&ListDagInsInput {
                updated_end: Some(0),
                ..ListDagInsInput::default()
            })
            .expect("list");
        assert!(past.is_empty());
    }

    #[test]
    fn batch_create_and_task_filters() {
        let store = MemStore::new();
        let mut batch = vec![
            TaskInstance {
                dag_ins_id: "di1".to_string(),
                task_id: "t1".to_string(),
                ..TaskInstance::default()
            },
            TaskInstance {
                dag_ins_id: "di1".to_string(),
                task_id: "t2".to_string(),
                status: TaskInstanceStatus::Failed,
                ..TaskInstance::default()
            },
        ];
        store.batch_create_task_ins(&mut batch).expect("create");
        assert!(batch.iter().all(|t| !t.id.is_empty()));

        let of_ins = store
            .list_task_ins(&ListTaskInsInput {
                dag_ins_id: Some("di1".to_string()),
                ..ListTaskInsInput::default()
            })
            .expect("list");
        assert_eq!(of_ins.len(), 2);

        let failed = store
            .list_task_ins(&ListTaskInsInput {
                status: vec![TaskInstanceStatus::Failed],
                ..ListTaskInsInput::default()
            })
            .expect("list");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_id, "t2");

        let by_id = store
            .list_task_ins(&ListTaskInsInput {
                ids: vec![batch[0].id.clone()],
                ..ListTaskInsInput::default()
            })
            .expect("list");
        assert_eq!(by_id.len(), 1);

        let err = store.get_task_ins("ghost").unwrap_err();
        assert!(matches!(err, FlowError::NotFound(_)));
    }
}
