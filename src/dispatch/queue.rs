// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use deadqueue::unlimited::Queue;
use log::{debug, error, info};
use tokio::sync::broadcast;

use crate::context::Context;
use crate::dispatch::{Task, TaskPayload, TaskStatus};

/// Broadcast whenever a task changes status, so observers can follow execution without polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatusChange {
    pub task_id: u64,
    pub status: TaskStatus,
}

/// Per-alert queue of delivery tasks plus the worker pool draining it.
///
/// The queue is filled completely during assembly, then drained once: workers run until the
/// queue is empty and return their completed tasks. A failed task never stops its siblings, the
/// failure is recorded on the task itself.
pub struct TaskQueue {
    context: Context,
    queue: Arc<Queue<Task>>,
    counter: AtomicU64,
    tx_status: broadcast::Sender<TaskStatusChange>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("enqueued", &self.counter)
            .finish()
    }
}

impl TaskQueue {
    /// Returns a new, empty task queue.
    pub fn new(context: Context) -> Self {
        let (tx_status, _) = broadcast::channel(64);
        Self {
            context,
            queue: Arc::new(Queue::new()),
            counter: AtomicU64::new(0),
            tx_status,
        }
    }

    /// Enqueues one payload for delivery and returns its task id.
    pub fn enqueue(&self, payload: TaskPayload) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Enqueueing {} task {} to {}",
            payload.kind(),
            id,
            payload.recipient()
        );
        self.queue.push(Task::new(id, payload));
        id
    }

    /// Number of tasks enqueued so far.
    pub fn len(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to task status changes.
    pub fn on_task_status_change(&self) -> broadcast::Receiver<TaskStatusChange> {
        self.tx_status.subscribe()
    }

    /// Runs the configured number of workers until the queue is empty and returns every task in
    /// id order, each in a terminal status.
    pub async fn drain(&self) -> Result<Vec<Task>> {
        let pool_size = self.context.config.worker_pool_size.max(1) as usize;
        info!("Draining task queue with {} workers", pool_size);

        let mut handles = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let context = self.context.clone();
            let queue = self.queue.clone();
            let tx_status = self.tx_status.clone();

            handles.push(tokio::spawn(async move {
                let mut completed = Vec::new();
                while let Some(mut task) = queue.try_pop() {
                    task.status = TaskStatus::Running;
                    task.attempts += 1;
                    task.started_at = Some(SystemTime::now());
                    // Send failures just mean nobody subscribed
                    let _ = tx_status.send(TaskStatusChange {
                        task_id: task.id,
                        status: task.status,
                    });

                    match execute(&context, &task.payload).await {
                        Ok(()) => {
                            debug!("Task {} succeeded", task.id);
                            task.status = TaskStatus::Succeeded;
                        }
                        Err(err) => {
                            error!("Task {} failed: {:#}", task.id, err);
                            task.status = TaskStatus::Failed;
                            task.error = Some(format!("{:#}", err));
                        }
                    }
                    task.finished_at = Some(SystemTime::now());
                    let _ = tx_status.send(TaskStatusChange {
                        task_id: task.id,
                        status: task.status,
                    });
                    completed.push(task);
                }
                completed
            }));
        }

        let mut tasks = Vec::new();
        for handle in handles {
            tasks.extend(handle.await?);
        }
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }
}

async fn execute(context: &Context, payload: &TaskPayload) -> Result<()> {
    match payload {
        TaskPayload::Email(payload) => context.email.send(payload).await,
        TaskPayload::Sms(payload) => match &context.sms {
            Some(sms) => sms.send(payload).await,
            None => anyhow::bail!("no SMS client is configured"),
        },
    }
}
