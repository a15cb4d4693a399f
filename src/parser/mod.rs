// src/parser/mod.rs

//! The scheduling loop.
//!
//! The parser is the single writer of dag-instance state. Work is routed
//! to a fixed set of shard workers by hashing the dag instance id, so at
//! most one worker ever operates on a given instance; within a shard,
//! events for one instance process in FIFO order.
//!
//! Three streams feed the shards:
//! - init nudges for freshly created instances (direct from the commander,
//!   plus a periodic store scan that recovers instances a previous process
//!   never dispatched)
//! - completion events emitted by the executor
//! - command applications (direct nudge from the commander, plus a store
//!   poll with the has-cmd filter as the safety net for external writers)

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entity::{
    CommandName, DagInstance, DagInstanceStatus, LifecycleHooks, TaskInstance, TaskInstanceStatus,
};
use crate::errors::{FlowError, Result};
use crate::exec::ExecutorHandle;
use crate::store::{DagInsPatch, ListDagInsInput, ListTaskInsInput, Store, TaskInsPatch};
use crate::tree::{TaskTree, TreeStatus};

const SHARD_QUEUE_DEPTH: usize = 64;

/// Work items flowing into the parser shards.
#[derive(Debug)]
pub enum ParserWork {
    /// A dag instance with status `init` awaits materialization.
    InitDagIns { dag_ins_id: String },
    /// A task instance reached a terminal or blocked state.
    TaskCompleted { task_ins: TaskInstance },
    /// A dag instance may carry a pending command.
    ApplyCmd { dag_ins_id: String },
}

impl ParserWork {
    fn shard_key(&self) -> &str {
        match self {
            Self::InitDagIns { dag_ins_id } | Self::ApplyCmd { dag_ins_id } => dag_ins_id,
            Self::TaskCompleted { task_ins } => &task_ins.dag_ins_id,
        }
    }
}

/// Routing handle into the parser shards. Cloneable and cheap.
#[derive(Clone)]
pub struct ParserMailbox {
    shards: Arc<Vec<mpsc::Sender<ParserWork>>>,
}

impl ParserMailbox {
    /// Create the mailbox and the per-shard receivers.
    ///
    /// Separate from [`spawn_parser`] because the executor needs the
    /// mailbox before the parser needs the executor handle.
    pub fn channel(workers_cnt: usize) -> (Self, Vec<mpsc::Receiver<ParserWork>>) {
        let workers_cnt = workers_cnt.max(1);
        let mut senders = Vec::with_capacity(workers_cnt);
        let mut receivers = Vec::with_capacity(workers_cnt);
        for _ in 0..workers_cnt {
            let (tx, rx) = mpsc::channel::<ParserWork>(SHARD_QUEUE_DEPTH);
            senders.push(tx);
            receivers.push(rx);
        }
        (
            Self {
                shards: Arc::new(senders),
            },
            receivers,
        )
    }

    /// Route one work item to the shard owning its dag instance. Dropped
    /// silently when the parser has shut down.
    pub async fn send(&self, work: ParserWork) {
        let mut hasher = DefaultHasher::new();
        work.shard_key().hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        if self.shards[idx].send(work).await.is_err() {
            debug!("parser mailbox closed; dropping work");
        }
    }
}

/// Spawn the parser: one shard worker per receiver plus the two store
/// pollers.
///
/// `parser_interval` paces the command poll; `schedule_interval` paces the
/// recovery scan for undispatched `init` instances (both tick immediately
/// at startup).
pub fn spawn_parser(
    store: Arc<dyn Store>,
    executor: ExecutorHandle,
    hooks: Arc<LifecycleHooks>,
    mailbox: ParserMailbox,
    receivers: Vec<mpsc::Receiver<ParserWork>>,
    parser_interval: Duration,
    schedule_interval: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(receivers.len() + 2);

    for (shard_id, rx) in receivers.into_iter().enumerate() {
        let worker = ShardWorker {
            store: store.clone(),
            executor: executor.clone(),
            hooks: hooks.clone(),
            trees: HashMap::new(),
            shutdown: shutdown.clone(),
        };
        handles.push(tokio::spawn(worker.run(shard_id, rx)));
    }

    handles.push(spawn_cmd_poller(
        store.clone(),
        mailbox.clone(),
        parser_interval,
        shutdown.clone(),
    ));
    handles.push(spawn_init_scanner(
        store,
        mailbox,
        schedule_interval,
        shutdown,
    ));

    handles
}

fn spawn_cmd_poller(
    store: Arc<dyn Store>,
    mailbox: ParserMailbox,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let input = ListDagInsInput {
                has_cmd: Some(true),
                ..ListDagInsInput::default()
            };
            match store.list_dag_ins(&input) {
                Ok(list) => {
                    for ins in list {
                        mailbox
                            .send(ParserWork::ApplyCmd { dag_ins_id: ins.id })
                            .await;
                    }
                }
                Err(err) => warn!(%err, "poll pending commands failed"),
            }
        }
    })
}

fn spawn_init_scanner(
    store: Arc<dyn Store>,
    mailbox: ParserMailbox,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let input = ListDagInsInput {
                status: vec![DagInstanceStatus::Init],
                ..ListDagInsInput::default()
            };
            match store.list_dag_ins(&input) {
                Ok(list) => {
                    for ins in list {
                        mailbox
                            .send(ParserWork::InitDagIns { dag_ins_id: ins.id })
                            .await;
                    }
                }
                Err(err) => warn!(%err, "scan init dag instances failed"),
            }
        }
    })
}

/// Cached scheduling state of one dag instance: its dependency tree plus
/// the shared instance view handed to every worker. Sharing one view is
/// what makes concurrent share-data writes from parallel tasks land in
/// the same bag.
struct TreeEntry {
    tree: TaskTree,
    dag_ins: Arc<DagInstance>,
}

/// One parser shard: the only writer for the instances hashed to it.
struct ShardWorker {
    store: Arc<dyn Store>,
    executor: ExecutorHandle,
    hooks: Arc<LifecycleHooks>,
    trees: HashMap<String, TreeEntry>,
    shutdown: CancellationToken,
}

impl ShardWorker {
    async fn run(mut self, shard_id: usize, mut rx: mpsc::Receiver<ParserWork>) {
        debug!(shard_id, "parser shard started");
        loop {
            let work = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                work = rx.recv() => match work {
                    Some(work) => work,
                    None => break,
                },
            };

            match work {
                ParserWork::InitDagIns { dag_ins_id } => {
                    if let Err(err) = self.initial_dag_ins(&dag_ins_id).await {
                        error!(dag_ins_id = %dag_ins_id, %err, "initial dag instance failed");
                    }
                }
                ParserWork::TaskCompleted { task_ins } => {
                    let dag_ins_id = task_ins.dag_ins_id.clone();
                    if let Err(err) = self.entry_task_ins(task_ins).await {
                        error!(dag_ins_id = %dag_ins_id, %err, "entry task instance failed");
                    }
                }
                ParserWork::ApplyCmd { dag_ins_id } => {
                    if let Err(err) = self.apply_command(&dag_ins_id).await {
                        error!(dag_ins_id = %dag_ins_id, %err, "apply command failed");
                    }
                }
            }
        }
        debug!(shard_id, "parser shard stopped");
    }

    /// Materialize one `init` instance: validate the template graph,
    /// create the task instances, move the instance to `running` and push
    /// the executable frontier.
    async fn initial_dag_ins(&mut self, dag_ins_id: &str) -> Result<()> {
        let mut dag_ins = match self.store.get_dag_ins(dag_ins_id) {
            Ok(ins) => ins,
            Err(FlowError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if dag_ins.status != DagInstanceStatus::Init {
            return Ok(());
        }

        let dag = match self.store.get_dag(&dag_ins.dag_id) {
            Ok(dag) => dag,
            Err(err @ FlowError::NotFound(_)) => {
                self.fail_dag_ins(&mut dag_ins, err.to_string()).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // Validate on the template before any task instance exists.
        if let Err(err) = TaskTree::build(&dag.tasks) {
            warn!(
                dag_ins_id = %dag_ins.id,
                dag_id = %dag.id,
                %err,
                "dag instance graph is invalid"
            );
            self.fail_dag_ins(&mut dag_ins, err.to_string()).await;
            return Ok(());
        }

        let mut task_ins: Vec<TaskInstance> = dag
            .tasks
            .iter()
            .map(|task| TaskInstance::from_template(&dag_ins.id, task))
            .collect();
        self.store.batch_create_task_ins(&mut task_ins)?;

        dag_ins.run(&self.hooks);
        self.patch_with_retry(
            &dag_ins.id,
            DagInsPatch {
                status: Some(DagInstanceStatus::Running),
                reason: Some(String::new()),
                ..DagInsPatch::default()
            },
        )
        .await?;

        let tree = TaskTree::build(&task_ins)?;
        let executables = tree.executable_task_ids();

        dag_ins.attach_store(self.store.clone());
        info!(
            dag_ins_id = %dag_ins.id,
            dag_id = %dag.id,
            tasks = task_ins.len(),
            frontier = executables.len(),
            "dag instance scheduled"
        );
        self.trees.insert(
            dag_ins.id.clone(),
            TreeEntry {
                tree,
                dag_ins: Arc::new(dag_ins),
            },
        );
        self.dispatch(dag_ins_id, &executables).await
    }

    /// Advance one instance after a task instance finished (or moved back
    /// to `init` through a retry).
    async fn entry_task_ins(&mut self, task_ins: TaskInstance) -> Result<()> {
        let dag_ins_id = task_ins.dag_ins_id.clone();

        if !self.trees.contains_key(&dag_ins_id) && !self.rebuild_tree(&dag_ins_id)? {
            debug!(dag_ins_id = %dag_ins_id, "completion for unknown dag instance; ignoring");
            return Ok(());
        }

        let entry = self
            .trees
            .get_mut(&dag_ins_id)
            .ok_or_else(|| FlowError::NotFound(dag_ins_id.clone()))?;
        let (next, found) = entry.tree.next_task_ids(&task_ins);
        if !found {
            warn!(
                dag_ins_id = %dag_ins_id,
                task_ins_id = %task_ins.id,
                "completed task not reachable in tree"
            );
        }

        self.dispatch(&dag_ins_id, &next).await?;

        let entry = self
            .trees
            .get(&dag_ins_id)
            .ok_or_else(|| FlowError::NotFound(dag_ins_id.clone()))?;
        let (status, src) = entry.tree.compute_status();
        let mut dag_ins = self.store.get_dag_ins(&dag_ins_id)?;

        match status {
            TreeStatus::Running => {}
            TreeStatus::Blocked => {
                if dag_ins.can_modify_status() && dag_ins.status != DagInstanceStatus::Blocked {
                    dag_ins.block(&self.hooks);
                    self.patch_with_retry(
                        &dag_ins_id,
                        DagInsPatch {
                            status: Some(DagInstanceStatus::Blocked),
                            ..DagInsPatch::default()
                        },
                    )
                    .await?;
                    info!(dag_ins_id = %dag_ins_id, "dag instance blocked");
                }
            }
            TreeStatus::Failed => {
                if dag_ins.can_modify_status() {
                    let reason = src.unwrap_or_default();
                    dag_ins.fail(reason.clone(), &self.hooks);
                    self.patch_with_retry(
                        &dag_ins_id,
                        DagInsPatch {
                            status: Some(DagInstanceStatus::Failed),
                            reason: Some(reason),
                            ..DagInsPatch::default()
                        },
                    )
                    .await?;
                    info!(dag_ins_id = %dag_ins_id, "dag instance failed");
                }
                self.trees.remove(&dag_ins_id);
            }
            TreeStatus::Success => {
                if dag_ins.can_modify_status() {
                    dag_ins.success(&self.hooks);
                    self.patch_with_retry(
                        &dag_ins_id,
                        DagInsPatch {
                            status: Some(DagInstanceStatus::Success),
                            reason: Some(String::new()),
                            ..DagInsPatch::default()
                        },
                    )
                    .await?;
                    info!(dag_ins_id = %dag_ins_id, "dag instance succeeded");
                }
                self.trees.remove(&dag_ins_id);
            }
        }
        Ok(())
    }

    /// Apply a pending command, then clear it with the explicit clear-form
    /// patch. Safe to call again if the command is already gone.
    async fn apply_command(&mut self, dag_ins_id: &str) -> Result<()> {
        let dag_ins = match self.store.get_dag_ins(dag_ins_id) {
            Ok(ins) => ins,
            Err(FlowError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let Some(cmd) = dag_ins.cmd.clone() else {
            return Ok(());
        };

        match cmd.name {
            CommandName::Retry => {
                let mut revived = Vec::new();
                for target in &cmd.target_task_ins_ids {
                    let mut task_ins = match self.store.get_task_ins(target) {
                        Ok(ins) => ins,
                        Err(FlowError::NotFound(_)) => {
                            warn!(task_ins_id = %target, "retry target not found");
                            continue;
                        }
                        Err(err) => return Err(err),
                    };
                    if !matches!(
                        task_ins.status,
                        TaskInstanceStatus::Failed
                            | TaskInstanceStatus::Canceled
                            | TaskInstanceStatus::Blocked
                    ) {
                        debug!(
                            task_ins_id = %target,
                            status = ?task_ins.status,
                            "retry target not in a retryable state"
                        );
                        continue;
                    }
                    self.store.patch_task_ins(
                        target,
                        TaskInsPatch {
                            status: Some(TaskInstanceStatus::Init),
                            reason: Some(String::new()),
                            ..TaskInsPatch::default()
                        },
                    )?;
                    task_ins.status = TaskInstanceStatus::Init;
                    task_ins.reason = String::new();
                    revived.push(task_ins);
                }

                if revived.is_empty() {
                    warn!(dag_ins_id = %dag_ins_id, "retry command revived nothing");
                    self.patch_with_retry(
                        dag_ins_id,
                        DagInsPatch {
                            cmd: Some(None),
                            ..DagInsPatch::default()
                        },
                    )
                    .await?;
                    return Ok(());
                }

                // Revive the instance and consume the command together.
                let mut fresh = dag_ins;
                fresh.run(&self.hooks);
                self.patch_with_retry(
                    dag_ins_id,
                    DagInsPatch {
                        status: Some(DagInstanceStatus::Running),
                        reason: Some(String::new()),
                        cmd: Some(None),
                        ..DagInsPatch::default()
                    },
                )
                .await?;
                info!(
                    dag_ins_id = %dag_ins_id,
                    revived = revived.len(),
                    "retry command applied"
                );

                // Drop the cached entry so the revived tasks run against a
                // fresh instance view (share data may have changed while
                // the instance sat failed or blocked).
                self.trees.remove(dag_ins_id);
                for task_ins in revived {
                    self.entry_task_ins(task_ins).await?;
                }
            }
            CommandName::Cancel => {
                // The executor settles everything it still holds; only
                // targets it never saw (or already released) are handled
                // here.
                let missed = self.executor.cancel_task_ins(&cmd.target_task_ins_ids)?;

                for target in &missed {
                    let mut task_ins = match self.store.get_task_ins(target) {
                        Ok(ins) => ins,
                        Err(FlowError::NotFound(_)) => {
                            warn!(task_ins_id = %target, "cancel target not found");
                            continue;
                        }
                        Err(err) => return Err(err),
                    };
                    if !matches!(
                        task_ins.status,
                        TaskInstanceStatus::Init | TaskInstanceStatus::Blocked
                    ) {
                        debug!(
                            task_ins_id = %target,
                            status = ?task_ins.status,
                            "cancel target already settled"
                        );
                        continue;
                    }
                    self.store.patch_task_ins(
                        &task_ins.id,
                        TaskInsPatch {
                            status: Some(TaskInstanceStatus::Canceled),
                            ..TaskInsPatch::default()
                        },
                    )?;
                    task_ins.status = TaskInstanceStatus::Canceled;
                    self.entry_task_ins(task_ins).await?;
                }

                self.patch_with_retry(
                    dag_ins_id,
                    DagInsPatch {
                        cmd: Some(None),
                        ..DagInsPatch::default()
                    },
                )
                .await?;
                info!(dag_ins_id = %dag_ins_id, "cancel command applied");
            }
        }
        Ok(())
    }

    /// Push the given task instances to the executor under the shared
    /// instance view. Tasks whose stored status moved on since the tree
    /// last saw them are skipped and the tree is resynced instead.
    async fn dispatch(&mut self, dag_ins_id: &str, task_ins_ids: &[String]) -> Result<()> {
        if task_ins_ids.is_empty() {
            return Ok(());
        }

        let dag_ins = match self.trees.get(dag_ins_id) {
            Some(entry) => entry.dag_ins.clone(),
            None => {
                let dag_ins = self.store.get_dag_ins(dag_ins_id)?;
                dag_ins.attach_store(self.store.clone());
                Arc::new(dag_ins)
            }
        };

        for id in task_ins_ids {
            let task_ins = match self.store.get_task_ins(id) {
                Ok(ins) => ins,
                Err(FlowError::NotFound(_)) => {
                    warn!(task_ins_id = %id, "executable task instance missing");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !matches!(
                task_ins.status,
                TaskInstanceStatus::Init
                    | TaskInstanceStatus::Retrying
                    | TaskInstanceStatus::Ending
            ) {
                if let Some(entry) = self.trees.get_mut(dag_ins_id) {
                    entry.tree.next_task_ids(&task_ins);
                }
                continue;
            }
            debug!(dag_ins_id = %dag_ins_id, task_ins_id = %id, "dispatching task");
            self.executor.push(dag_ins.clone(), task_ins).await;
        }
        Ok(())
    }

    /// Reconstruct the tree of an instance from its stored task instances,
    /// preserving the template task order so DFS tie-breaking stays
    /// deterministic. Returns `false` when there is nothing to rebuild.
    fn rebuild_tree(&mut self, dag_ins_id: &str) -> Result<bool> {
        let dag_ins = match self.store.get_dag_ins(dag_ins_id) {
            Ok(ins) => ins,
            Err(FlowError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };

        let mut task_ins = self.store.list_task_ins(&ListTaskInsInput {
            dag_ins_id: Some(dag_ins_id.to_string()),
            ..ListTaskInsInput::default()
        })?;
        if task_ins.is_empty() {
            return Ok(false);
        }

        if let Ok(dag) = self.store.get_dag(&dag_ins.dag_id) {
            let order: HashMap<&str, usize> = dag
                .tasks
                .iter()
                .enumerate()
                .map(|(i, t)| (t.id.as_str(), i))
                .collect();
            task_ins.sort_by_key(|ins| order.get(ins.task_id.as_str()).copied().unwrap_or(usize::MAX));
        }

        let tree = TaskTree::build(&task_ins)?;
        dag_ins.attach_store(self.store.clone());
        self.trees.insert(
            dag_ins_id.to_string(),
            TreeEntry {
                tree,
                dag_ins: Arc::new(dag_ins),
            },
        );
        Ok(true)
    }

    async fn fail_dag_ins(&mut self, dag_ins: &mut DagInstance, reason: String) {
        dag_ins.fail(reason, &self.hooks);
        let _ = self
            .patch_with_retry(
                &dag_ins.id,
                DagInsPatch {
                    status: Some(DagInstanceStatus::Failed),
                    reason: Some(dag_ins.reason.clone()),
                    ..DagInsPatch::default()
                },
            )
            .await;
    }

    /// Patch with bounded backoff; persistent failure marks the instance
    /// failed with reason `store_error` as a last resort.
    async fn patch_with_retry(&self, dag_ins_id: &str, patch: DagInsPatch) -> Result<()> {
        const ATTEMPTS: u32 = 3;

        let mut last_err = None;
        for attempt in 1..=ATTEMPTS {
            match self.store.patch_dag_ins(dag_ins_id, patch.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(dag_ins_id = %dag_ins_id, attempt, %err, "patch dag instance failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
            }
        }

        let _ = self.store.patch_dag_ins(
            dag_ins_id,
            DagInsPatch {
                status: Some(DagInstanceStatus::Failed),
                reason: Some("store_error".to_string()),
                ..DagInsPatch::default()
            },
        );
        Err(last_err.unwrap_or_else(|| FlowError::StoreError("patch failed".to_string())))
    }
}
