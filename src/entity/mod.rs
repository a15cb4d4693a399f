// src/entity/mod.rs

//! Entity model: dag templates, dag instances, tasks and task instances.

pub mod dag;
pub mod task;

pub use dag::{
    Command, CommandName, Dag, DagInstance, DagInstanceStatus, DagInstanceVar, DagInstanceVars,
    DagStatus, DagVar, LifecycleHooks, ShareData, Trigger,
};
pub use task::{
    ActiveAction, ConditionOp, ConditionSource, PreCheck, PreChecks, RetryPolicy, Task,
    TaskCondition, TaskInstance, TaskInstanceStatus, TraceInfo, TraceMode,
};
