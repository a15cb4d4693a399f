// src/exec/executor.rs

//! Bounded worker pool running one action per task instance.
//!
//! Work is submitted onto a bounded queue; overflow blocks the pusher,
//! which is the natural backpressure onto the parser. A semaphore bounds
//! the concurrently running workers; each worker owns its task instance
//! for the whole attempt chain (retries run in the same slot) and emits a
//! completion event to the parser when the instance reaches a terminal or
//! blocked state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entity::{DagInstance, TaskInstance, TaskInstanceStatus, TraceMode};
use crate::errors::{FlowError, Result};
use crate::exec::{ActionRegistry, ExecuteContext};
use crate::parser::{ParserMailbox, ParserWork};
use crate::store::{Store, TaskInsPatch};

/// How long `close` waits for in-flight workers before aborting them.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

type CancelMap = Arc<Mutex<HashMap<String, CancellationToken>>>;

struct WorkItem {
    dag_ins: Arc<DagInstance>,
    task_ins: TaskInstance,
    token: CancellationToken,
}

/// Handle used by the parser (and engine) to feed and steer the executor.
#[derive(Clone)]
pub struct ExecutorHandle {
    work_tx: mpsc::Sender<WorkItem>,
    cancels: CancelMap,
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
}

impl ExecutorHandle {
    /// Hand off one unit of work. Blocks when the submission queue is
    /// full; returns once the unit is queued.
    pub async fn push(&self, dag_ins: Arc<DagInstance>, task_ins: TaskInstance) {
        let token = self.shutdown.child_token();
        {
            let mut cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
            cancels.insert(task_ins.id.clone(), token.clone());
        }

        let id = task_ins.id.clone();
        let item = WorkItem {
            dag_ins,
            task_ins,
            token,
        };
        if self.work_tx.send(item).await.is_err() {
            let mut cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
            cancels.remove(&id);
            warn!(task_ins_id = %id, "executor closed; dropping pushed task");
        }
    }

    /// Mark matching in-flight units for cooperative cancellation and
    /// return immediately. Units still on the queue short-circuit when
    /// they are dequeued. Returns the ids that were not in flight at all,
    /// so the caller can settle them directly.
    pub fn cancel_task_ins(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut missed = Vec::new();
        for id in ids {
            let token = {
                let cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
                cancels.get(id).cloned()
            };
            let Some(token) = token else {
                debug!(task_ins_id = %id, "cancel requested for task not in flight");
                missed.push(id.clone());
                continue;
            };

            // Cancellation is acknowledged before the action drains.
            if let Err(err) = self.store.patch_task_ins(
                id,
                TaskInsPatch {
                    status: Some(TaskInstanceStatus::Ending),
                    ..TaskInsPatch::default()
                },
            ) {
                warn!(task_ins_id = %id, %err, "mark task ending failed");
            }
            token.cancel();
        }
        Ok(missed)
    }
}

/// Spawn the background executor: dispatcher loop plus worker slots.
///
/// Returns the handle for pushing work and the join handle of the
/// dispatcher, which drains in-flight workers (bounded by a grace period)
/// once `shutdown` fires or all handles are dropped.
pub fn spawn_executor(
    store: Arc<dyn Store>,
    actions: Arc<ActionRegistry>,
    mailbox: ParserMailbox,
    worker_cnt: usize,
    default_timeout: Duration,
    shutdown: CancellationToken,
) -> (ExecutorHandle, tokio::task::JoinHandle<()>) {
    let worker_cnt = worker_cnt.max(1);
    let (work_tx, mut work_rx) = mpsc::channel::<WorkItem>(worker_cnt);
    let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));

    let handle = ExecutorHandle {
        work_tx,
        cancels: cancels.clone(),
        store: store.clone(),
        shutdown: shutdown.clone(),
    };

    let dispatcher = tokio::spawn(async move {
        info!(worker_cnt, "executor started");
        let semaphore = Arc::new(Semaphore::new(worker_cnt));
        let mut workers = JoinSet::new();

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = work_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            // Reap finished workers so the set doesn't grow unbounded.
            while workers.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = Worker {
                store: store.clone(),
                actions: actions.clone(),
                mailbox: mailbox.clone(),
                cancels: cancels.clone(),
                default_timeout,
            };
            workers.spawn(async move {
                worker.run(item).await;
                drop(permit);
            });
        }

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            warn!("executor drain grace elapsed; aborting remaining workers");
            workers.abort_all();
        }
        info!("executor stopped");
    });

    (handle, dispatcher)
}

enum Outcome {
    Done(Result<()>),
    Canceled,
    TimedOut,
}

struct Worker {
    store: Arc<dyn Store>,
    actions: Arc<ActionRegistry>,
    mailbox: ParserMailbox,
    cancels: CancelMap,
    default_timeout: Duration,
}

impl Worker {
    async fn run(&self, item: WorkItem) {
        let WorkItem {
            dag_ins,
            task_ins,
            token,
        } = item;

        let task_ins = Arc::new(Mutex::new(task_ins));
        let final_status = self.drive(&dag_ins, &task_ins, &token).await;

        if let Some(status) = final_status {
            let mut guard = lock(&task_ins);
            if let Err(err) = guard.set_status(&*self.store, status) {
                error!(
                    task_ins_id = %guard.id,
                    ?status,
                    %err,
                    "persist final task status failed"
                );
            }
        }

        let snapshot = lock(&task_ins).clone();
        {
            let mut cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
            cancels.remove(&snapshot.id);
        }
        self.mailbox
            .send(ParserWork::TaskCompleted { task_ins: snapshot })
            .await;
    }

    /// Run the attempt chain and decide the terminal status, or `None`
    /// when a matched pre-check already persisted one.
    async fn drive(
        &self,
        dag_ins: &Arc<DagInstance>,
        task_ins: &Arc<Mutex<TaskInstance>>,
        token: &CancellationToken,
    ) -> Option<TaskInstanceStatus> {
        // Queued units short-circuit when cancellation already fired.
        if token.is_cancelled() {
            return Some(TaskInstanceStatus::Canceled);
        }

        let pre_check = {
            let mut guard = lock(task_ins);
            guard.do_pre_check(dag_ins, &*self.store)
        };
        match pre_check {
            Ok(true) => {
                let guard = lock(task_ins);
                debug!(task_ins_id = %guard.id, status = ?guard.status, "pre-check matched");
                return None;
            }
            Ok(false) => {}
            Err(err) => {
                let mut guard = lock(task_ins);
                guard.reason = err.to_string();
                return Some(TaskInstanceStatus::Failed);
            }
        }

        let (max_attempts, backoff, deadline, action_name) = {
            let guard = lock(task_ins);
            (
                guard.retry_policy.map(|p| p.max_attempts.max(1)).unwrap_or(1),
                guard
                    .retry_policy
                    .map(|p| p.backoff())
                    .unwrap_or(Duration::ZERO),
                guard
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_timeout),
                guard.action_name.clone(),
            )
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if let Err(err) = lock(task_ins).set_status(&*self.store, TaskInstanceStatus::Running)
            {
                warn!(%err, "mark task running failed; executing anyway");
            }

            let Some(action) = self.actions.get(&action_name) else {
                let mut guard = lock(task_ins);
                guard.reason = FlowError::UnknownAction(action_name.clone()).to_string();
                return Some(TaskInstanceStatus::Failed);
            };

            let params = {
                let guard = lock(task_ins);
                dag_ins.vars.render(&guard.params)
            };
            let ctx = ExecuteContext::new(
                self.store.clone(),
                dag_ins.clone(),
                task_ins.clone(),
                token.clone(),
            );

            let outcome = tokio::select! {
                res = action.run(&ctx, &params) => Outcome::Done(res),
                _ = token.cancelled() => Outcome::Canceled,
                _ = tokio::time::sleep(deadline) => Outcome::TimedOut,
            };

            match outcome {
                Outcome::Done(Ok(())) => return Some(TaskInstanceStatus::Success),
                Outcome::Done(Err(err)) => {
                    if attempt < max_attempts {
                        {
                            let mut guard = lock(task_ins);
                            guard.trace(
                                &*self.store,
                                format!("attempt {attempt} failed: {err}"),
                                TraceMode::Immediate,
                            );
                            if let Err(err) =
                                guard.set_status(&*self.store, TaskInstanceStatus::Retrying)
                            {
                                warn!(%err, "mark task retrying failed");
                            }
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => continue,
                            _ = token.cancelled() => return Some(TaskInstanceStatus::Canceled),
                        }
                    }
                    let mut guard = lock(task_ins);
                    guard.reason = err.to_string();
                    return Some(TaskInstanceStatus::Failed);
                }
                Outcome::Canceled => return Some(TaskInstanceStatus::Canceled),
                Outcome::TimedOut => {
                    let mut guard = lock(task_ins);
                    guard.reason = "timeout".to_string();
                    return Some(TaskInstanceStatus::Failed);
                }
            }
        }
    }
}

fn lock(task_ins: &Arc<Mutex<TaskInstance>>) -> std::sync::MutexGuard<'_, TaskInstance> {
    task_ins.lock().unwrap_or_else(PoisonError::into_inner)
}
