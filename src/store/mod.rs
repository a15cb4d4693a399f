// src/store/mod.rs

//! Persistence seam for the three entity families.
//!
//! Implementations are pluggable; [`memory::MemStore`] ships with the
//! crate and external stores plug in behind the same trait (multi-node
//! setups are a store concern: optimistic-locked rows plus the worker
//! field). Callers must tolerate [`crate::errors::FlowError::Conflict`]
//! from optimistically-locked backends.

pub mod memory;

use std::collections::HashMap;

use crate::entity::{
    Command, Dag, DagInstance, DagInstanceStatus, TaskInstance, TaskInstanceStatus, TraceInfo,
};
use crate::errors::Result;

pub use memory::MemStore;

/// Partial update of a dag instance. Absent fields are left untouched.
///
/// `cmd` is doubly wrapped: `Some(Some(_))` writes a command,
/// `Some(None)` explicitly clears the field (the form the parser uses
/// after consuming a command), `None` leaves it alone.
#[derive(Debug, Clone, Default)]
pub struct DagInsPatch {
    pub status: Option<DagInstanceStatus>,
    pub reason: Option<String>,
    pub worker: Option<String>,
    pub share_data: Option<HashMap<String, String>>,
    pub cmd: Option<Option<Command>>,
}

/// Partial update of a task instance. Absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskInsPatch {
    pub status: Option<TaskInstanceStatus>,
    pub reason: Option<String>,
    pub traces: Option<Vec<TraceInfo>>,
}

/// Filters for listing dag instances. Every filter is honored by every
/// implementation; empty/absent filters match everything.
#[derive(Debug, Clone, Default)]
pub struct ListDagInsInput {
    pub dag_id: Option<String>,
    pub status: Vec<DagInstanceStatus>,
    pub has_cmd: Option<bool>,
    /// Only instances whose `updated_at` is at or before this stamp.
    pub updated_end: Option<i64>,
}

/// Filters for listing task instances.
#[derive(Debug, Clone, Default)]
pub struct ListTaskInsInput {
    pub ids: Vec<String>,
    pub dag_ins_id: Option<String>,
    pub status: Vec<TaskInstanceStatus>,
}

/// Atomic per-record persistence of dags, dag instances and task
/// instances.
///
/// `create_*` assigns an id when the entity arrives without one and
/// stamps `created_at`/`updated_at` on dag instances.
pub trait Store: Send + Sync {
    fn create_dag(&self, dag: &mut Dag) -> Result<()>;
    fn update_dag(&self, dag: &Dag) -> Result<()>;
    fn get_dag(&self, dag_id: &str) -> Result<Dag>;

    fn create_dag_ins(&self, dag_ins: &mut DagInstance) -> Result<()>;
    fn update_dag_ins(&self, dag_ins: &DagInstance) -> Result<()>;
    fn patch_dag_ins(&self, id: &str, patch: DagInsPatch) -> Result<()>;
    fn get_dag_ins(&self, id: &str) -> Result<DagInstance>;
    fn list_dag_ins(&self, input: &ListDagInsInput) -> Result<Vec<DagInstance>>;

    fn batch_create_task_ins(&self, task_ins: &mut [TaskInstance]) -> Result<()>;
    fn update_task_ins(&self, task_ins: &TaskInstance) -> Result<()>;
    fn patch_task_ins(&self, id: &str, patch: TaskInsPatch) -> Result<()>;
    fn get_task_ins(&self, id: &str) -> Result<TaskInstance>;
    fn list_task_ins(&self, input: &ListTaskInsInput) -> Result<Vec<TaskInstance>>;

    fn close(&self);
}
