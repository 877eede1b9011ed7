//! Background role-change tasks
//!
//! Webhook handlers and the claim flow submit [`RoleTask`]s and return
//! without waiting on the platform. A single supervisor task receives them
//! over an mpsc channel and runs each on a `JoinSet`; panics are logged and
//! reported to the submitter as failures. Duplicate submissions are harmless
//! because every role operation is a set operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use keepwarden_billing::MembershipStore;
use keepwarden_shared::ManagedRole;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::error::{AccessError, AccessResult};
use crate::roles::RoleAssignmentService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleTask {
    Assign {
        platform_user_id: String,
        role: ManagedRole,
    },
    Swap {
        platform_user_id: String,
        from: ManagedRole,
        to: ManagedRole,
    },
    /// Re-read the member and converge to the expected role
    RestoreAccess { member_id: Uuid },
    RemoveAndKick {
        platform_user_id: String,
        member_id: Uuid,
    },
}

impl RoleTask {
    pub fn kind(&self) -> &'static str {
        match self {
            RoleTask::Assign { .. } => "assign",
            RoleTask::Swap { .. } => "swap",
            RoleTask::RestoreAccess { .. } => "restore_access",
            RoleTask::RemoveAndKick { .. } => "remove_and_kick",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed { reason: String },
    Skipped { reason: String },
}

impl TaskOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            reason: reason.into(),
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        TaskOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// Completion channel for one submitted task. Dropping it does not cancel the task.
pub struct TaskHandle {
    id: u64,
    receiver: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn outcome(self) -> TaskOutcome {
        self.receiver
            .await
            .unwrap_or_else(|_| TaskOutcome::failed("task abandoned before completion"))
    }
}

struct Envelope {
    id: u64,
    task: RoleTask,
    reply: oneshot::Sender<TaskOutcome>,
}

/// Runs tasks against the role service
pub struct TaskExecutor {
    roles: Arc<RoleAssignmentService>,
    store: Arc<dyn MembershipStore>,
}

impl TaskExecutor {
    pub fn new(roles: Arc<RoleAssignmentService>, store: Arc<dyn MembershipStore>) -> Self {
        Self { roles, store }
    }

    pub async fn execute(&self, task: &RoleTask) -> TaskOutcome {
        match task {
            RoleTask::Assign {
                platform_user_id,
                role,
            } => {
                if self.roles.assign(platform_user_id, *role).await {
                    TaskOutcome::Completed
                } else {
                    TaskOutcome::failed(format!("could not assign {}", role))
                }
            }
            RoleTask::Swap {
                platform_user_id,
                from,
                to,
            } => {
                if self.roles.swap(platform_user_id, *from, *to).await {
                    TaskOutcome::Completed
                } else {
                    TaskOutcome::failed(format!("could not swap {} for {}", from, to))
                }
            }
            RoleTask::RestoreAccess { member_id } => self.restore_access(*member_id).await,
            RoleTask::RemoveAndKick {
                platform_user_id,
                member_id,
            } => {
                let outcome = self.roles.remove_and_kick(platform_user_id, *member_id).await;
                if outcome.kicked {
                    TaskOutcome::Completed
                } else {
                    TaskOutcome::failed("kick failed; status recorded as cancelled")
                }
            }
        }
    }

    async fn restore_access(&self, member_id: Uuid) -> TaskOutcome {
        let member = match self.store.get_member(member_id).await {
            Ok(Some(member)) => member,
            Ok(None) => return TaskOutcome::skipped("member not found"),
            Err(e) => return TaskOutcome::failed(e.to_string()),
        };
        let Some(platform_user_id) = member.platform_user_id.clone() else {
            return TaskOutcome::skipped("member has no platform account");
        };

        let team = match member.team_id {
            Some(team_id) => match self.store.get_team(team_id).await {
                Ok(team) => team,
                Err(e) => return TaskOutcome::failed(e.to_string()),
            },
            None => None,
        };
        let expected = member.expected_role(member.effective_status(team.as_ref()));

        if self
            .roles
            .apply_expected(&platform_user_id, expected, self.roles.policy(), None)
            .await
        {
            TaskOutcome::Completed
        } else {
            TaskOutcome::failed("could not restore expected role")
        }
    }
}

pub struct TaskQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl TaskQueue {
    /// Spawn the supervisor. Must be called inside a tokio runtime.
    pub fn start(executor: Arc<TaskExecutor>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(receiver, executor));
        Self {
            sender: Mutex::new(Some(sender)),
            supervisor: tokio::sync::Mutex::new(Some(supervisor)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueue a task and return immediately
    pub fn submit(&self, task: RoleTask) -> AccessResult<TaskHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();

        let guard = self.sender.lock().map_err(|_| AccessError::QueueClosed)?;
        let sender = guard.as_ref().ok_or(AccessError::QueueClosed)?;

        tracing::debug!(task_id = id, kind = task.kind(), "Submitting role task");
        sender
            .send(Envelope { id, task, reply })
            .map_err(|_| AccessError::QueueClosed)?;

        Ok(TaskHandle { id, receiver })
    }

    /// Stop accepting tasks, wait for everything queued or running to finish
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            if let Err(e) = supervisor.await {
                tracing::error!(error = %e, "Role task supervisor ended abnormally");
            }
        }
        tracing::info!("Role task queue drained");
    }
}

async fn supervise(mut receiver: mpsc::UnboundedReceiver<Envelope>, executor: Arc<TaskExecutor>) {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            Some(envelope) = receiver.recv() => {
                let executor = executor.clone();
                running.spawn(async move {
                    let outcome = executor.execute(&envelope.task).await;
                    match &outcome {
                        TaskOutcome::Completed => {
                            tracing::debug!(task_id = envelope.id, kind = envelope.task.kind(), "Role task completed");
                        }
                        TaskOutcome::Failed { reason } => {
                            tracing::warn!(task_id = envelope.id, kind = envelope.task.kind(), reason = %reason, "Role task failed");
                        }
                        TaskOutcome::Skipped { reason } => {
                            tracing::info!(task_id = envelope.id, kind = envelope.task.kind(), reason = %reason, "Role task skipped");
                        }
                    }
                    // Submitter may have dropped the handle
                    let _ = envelope.reply.send(outcome);
                });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Role task panicked");
                }
            }
            else => break,
        }
    }
}
