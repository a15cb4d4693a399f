// src/commander.rs

//! Public command API for clients: start instances, retry or cancel task
//! instances, optionally waiting until the parser has consumed the
//! command.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::entity::{DagInstance, LifecycleHooks, TaskInstanceStatus, Trigger};
use crate::errors::{FlowError, Result};
use crate::parser::{ParserMailbox, ParserWork};
use crate::store::{DagInsPatch, ListTaskInsInput, Store};

/// Options for command-style calls.
///
/// Commands usually execute within one parser turn, so the async default
/// is enough; `sync` makes the call watch the dag instance until its
/// command is consumed.
#[derive(Debug, Clone, Copy)]
pub struct CommandOption {
    pub is_sync: bool,
    pub sync_timeout: Duration,
    pub sync_interval: Duration,
}

impl Default for CommandOption {
    fn default() -> Self {
        Self {
            is_sync: false,
            sync_timeout: Duration::from_secs(5),
            sync_interval: Duration::from_millis(500),
        }
    }
}

impl CommandOption {
    /// Wait for the parser to consume the command before returning.
    pub fn sync() -> Self {
        Self {
            is_sync: true,
            ..Self::default()
        }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.sync_timeout = timeout;
        }
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.sync_interval = interval;
        }
        self
    }
}

/// Client-facing command surface of one engine.
#[derive(Clone)]
pub struct Commander {
    store: Arc<dyn Store>,
    mailbox: ParserMailbox,
    hooks: Arc<LifecycleHooks>,
}

impl Commander {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        mailbox: ParserMailbox,
        hooks: Arc<LifecycleHooks>,
    ) -> Self {
        Self {
            store,
            mailbox,
            hooks,
        }
    }

    /// Start a new instance of the given dag template.
    pub async fn run_dag(
        &self,
        dag_id: &str,
        spec_vars: Option<&HashMap<String, String>>,
    ) -> Result<DagInstance> {
        let dag = self.store.get_dag(dag_id)?;
        let mut dag_ins = dag.run(Trigger::Manually, spec_vars)?;
        self.store.create_dag_ins(&mut dag_ins)?;
        debug!(dag_id, dag_ins_id = %dag_ins.id, "dag instance created");
        self.mailbox
            .send(ParserWork::InitDagIns {
                dag_ins_id: dag_ins.id.clone(),
            })
            .await;
        Ok(dag_ins)
    }

    /// Retry every failed or canceled task instance of the given dag
    /// instance.
    pub async fn retry_dag_ins(&self, dag_ins_id: &str, opt: CommandOption) -> Result<()> {
        let task_ins = self.store.list_task_ins(&ListTaskInsInput {
            dag_ins_id: Some(dag_ins_id.to_string()),
            status: vec![TaskInstanceStatus::Failed, TaskInstanceStatus::Canceled],
            ..ListTaskInsInput::default()
        })?;
        if task_ins.is_empty() {
            return Err(FlowError::NoTasksSelected);
        }

        let ids: Vec<String> = task_ins.into_iter().map(|t| t.id).collect();
        self.retry_task(&ids, opt).await
    }

    /// Retry the given task instances.
    pub async fn retry_task(&self, task_ins_ids: &[String], opt: CommandOption) -> Result<()> {
        let ids = task_ins_ids.to_vec();
        let hooks = self.hooks.clone();
        self.execute_command(task_ins_ids, opt, move |dag_ins| dag_ins.retry(ids, &hooks))
            .await
    }

    /// Cancel the given task instances.
    pub async fn cancel_task(&self, task_ins_ids: &[String], opt: CommandOption) -> Result<()> {
        let ids = task_ins_ids.to_vec();
        self.execute_command(task_ins_ids, opt, move |dag_ins| dag_ins.cancel(ids))
            .await
    }

    async fn execute_command(
        &self,
        task_ins_ids: &[String],
        opt: CommandOption,
        perform: impl FnOnce(&mut DagInstance) -> Result<()>,
    ) -> Result<()> {
        if task_ins_ids.is_empty() {
            return Err(FlowError::NoTasksSelected);
        }

        let task_ins = self.store.list_task_ins(&ListTaskInsInput {
            ids: task_ins_ids.to_vec(),
            ..ListTaskInsInput::default()
        })?;

        if task_ins.len() != task_ins_ids.len() {
            let not_found: Vec<&str> = task_ins_ids
                .iter()
                .filter(|id| !task_ins.iter().any(|t| &t.id == *id))
                .map(String::as_str)
                .collect();
            return Err(FlowError::TasksNotFound(not_found.join(", ")));
        }

        let dag_ins_id = task_ins[0].dag_ins_id.clone();
        for t in &task_ins {
            if t.dag_ins_id != dag_ins_id {
                return Err(FlowError::MultipleDagInstances(t.id.clone()));
            }
        }

        let mut dag_ins = self.store.get_dag_ins(&dag_ins_id)?;
        perform(&mut dag_ins)?;

        self.store.patch_dag_ins(
            &dag_ins_id,
            DagInsPatch {
                worker: dag_ins.worker.clone(),
                cmd: Some(dag_ins.cmd.clone()),
                ..DagInsPatch::default()
            },
        )?;
        self.mailbox
            .send(ParserWork::ApplyCmd {
                dag_ins_id: dag_ins_id.clone(),
            })
            .await;

        if opt.is_sync {
            return self.ensure_cmd_executed(&dag_ins_id, &opt).await;
        }
        Ok(())
    }

    /// Poll the dag instance until its command is cleared or the sync
    /// timeout elapses.
    async fn ensure_cmd_executed(&self, dag_ins_id: &str, opt: &CommandOption) -> Result<()> {
        let timeout = tokio::time::sleep(opt.sync_timeout);
        tokio::pin!(timeout);
        let mut ticker = tokio::time::interval(opt.sync_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dag_ins = self.store.get_dag_ins(dag_ins_id)?;
                    if dag_ins.cmd.is_none() {
                        return Ok(());
                    }
                }
                _ = &mut timeout => return Err(FlowError::CommandTimeout),
            }
        }
    }
}
