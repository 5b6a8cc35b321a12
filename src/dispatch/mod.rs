// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task execution: the per-alert queue of outgoing messages and the worker pool draining it.

mod queue;

pub use queue::{TaskQueue, TaskStatusChange};

use std::time::SystemTime;

use crate::transport::{EmailPayload, SmsPayload};

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Email,
    Sms,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
        }
    }
}

/// The assembled message a task delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    Email(EmailPayload),
    Sms(SmsPayload),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Email(_) => TaskKind::Email,
            Self::Sms(_) => TaskKind::Sms,
        }
    }

    /// Short description of the recipient, for logs and failure reports.
    pub fn recipient(&self) -> &str {
        match self {
            Self::Email(payload) => &payload.to,
            Self::Sms(payload) => &payload.to,
        }
    }
}

/// Lifecycle state of a task. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One unit of work: a single message to deliver over a transport.
#[derive(Debug, Clone)]
pub struct Task {
    /// Queue-local id, assigned at enqueue time in enqueue order.
    pub id: u64,

    pub payload: TaskPayload,
    pub status: TaskStatus,

    /// Number of delivery attempts made. Workers make exactly one attempt per task; retrying a
    /// failed delivery means re-running the alert.
    pub attempts: u32,

    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,

    /// Message of the failure when the task failed.
    pub error: Option<String>,
}

impl Task {
    pub(crate) fn new(id: u64, payload: TaskPayload) -> Self {
        Self {
            id,
            payload,
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}
