// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("data not found: {0}")]
    NotFound(String),

    #[error("data conflicted: {0}")]
    Conflict(String),

    #[error("cannot run a stopped dag: {0}")]
    DagStopped(String),

    #[error("task id is repeated: {0}")]
    DuplicateTaskId(String),

    #[error("task '{task}' depends on unknown task '{depend}'")]
    MissingDependency { task: String, depend: String },

    #[error("dag has cycle at: {0}")]
    CycleDetected(String),

    #[error("dag has no start nodes")]
    NoStartNodes,

    #[error("no action registered with name: {0}")]
    UnknownAction(String),

    #[error("pre-check[{check}] act is invalid: {act}")]
    InvalidPreCheckAct { check: String, act: String },

    #[error("invalid command state: {0}")]
    InvalidCommandState(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("watch command executing timeout")]
    CommandTimeout,

    #[error("no task instances selected")]
    NoTasksSelected,

    #[error("task instances not found: {0}")]
    TasksNotFound(String),

    #[error("task instance '{0}' is from a different dag instance")]
    MultipleDagInstances(String),

    #[error("action failed: {0}")]
    ActionError(String),

    #[error("action timed out")]
    Timeout,

    #[error("action canceled")]
    Canceled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
