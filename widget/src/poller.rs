//! Task poller - tracks the one backend task whose reply the widget waits on
//!
//! ```text
//!   Idle ──start(task_id)──▶ Polling ──success──▶ Settled ──▶ Idle (+ refetch)
//!                             │  ▲
//!                             │  └─ pending / other: wait `interval`, query again
//!                             └──── failed / ceiling / cancel ──▶ Idle
//! ```
//!
//! The poller owns no timer and performs no IO. The session queries the
//! backend and feeds each outcome to [`TaskPoller::observe`] together with the
//! [`PollTicket`] it was issued. Starting a new task or cancelling bumps the
//! generation, so results carrying an older ticket come back as
//! [`PollStep::Stale`] and must be dropped.

use std::time::Duration;

use shared_types::TaskStatus;

use crate::error::ApiError;

/// Limits on a single polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Status queries before giving up on a task that never settles.
    pub max_attempts: u32,
    /// Consecutive failed queries before giving up.
    pub max_consecutive_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: 240,
            max_consecutive_errors: 3,
        }
    }
}

/// Token identifying one polling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTicket {
    task_id: String,
    generation: u64,
}

impl PollTicket {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

/// Why a run ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStop {
    TimedOut { attempts: u32 },
    Failed { reason: String },
}

/// What the driver should do after feeding an outcome to the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    /// The ticket is no longer active; drop the result untouched.
    Stale,
    /// Still running; query again after the delay.
    Continue(Duration),
    /// The task succeeded and the poller is idle again; refetch now.
    Settled,
    /// The run ended without a reply; the poller is idle again.
    Stopped(PollStop),
}

#[derive(Debug)]
struct ActiveRun {
    ticket: PollTicket,
    attempts: u32,
    consecutive_errors: u32,
}

#[derive(Debug, Default)]
pub struct TaskPoller {
    policy: PollPolicy,
    generation: u64,
    active: Option<ActiveRun>,
}

impl TaskPoller {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            generation: 0,
            active: None,
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn is_polling(&self) -> bool {
        self.active.is_some()
    }

    /// Active task id, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.active.as_ref().map(|run| run.ticket.task_id.as_str())
    }

    /// Begin polling `task_id`, superseding any run already in progress.
    pub fn start(&mut self, task_id: impl Into<String>) -> PollTicket {
        self.generation += 1;
        let ticket = PollTicket {
            task_id: task_id.into(),
            generation: self.generation,
        };
        if let Some(previous) = self.active.take() {
            tracing::debug!(
                superseded = %previous.ticket.task_id,
                task_id = %ticket.task_id,
                "Replacing active poll"
            );
        }
        self.active = Some(ActiveRun {
            ticket: ticket.clone(),
            attempts: 0,
            consecutive_errors: 0,
        });
        ticket
    }

    /// Clear the active task. Results still in flight become stale.
    pub fn cancel(&mut self) -> Option<String> {
        self.generation += 1;
        self.active.take().map(|run| run.ticket.task_id)
    }

    pub fn is_current(&self, ticket: &PollTicket) -> bool {
        self.active
            .as_ref()
            .is_some_and(|run| run.ticket == *ticket)
    }

    /// Feed one status query outcome for `ticket`.
    pub fn observe(
        &mut self,
        ticket: &PollTicket,
        outcome: Result<TaskStatus, ApiError>,
    ) -> PollStep {
        if !self.is_current(ticket) {
            return PollStep::Stale;
        }
        let Some(run) = self.active.as_mut() else {
            return PollStep::Stale;
        };
        run.attempts += 1;
        let attempts = run.attempts;

        let stop = match outcome {
            Ok(TaskStatus::Success) => {
                self.active = None;
                return PollStep::Settled;
            }
            Ok(TaskStatus::Failed(status)) => Some(PollStop::Failed {
                reason: format!("backend reported {status}"),
            }),
            Ok(TaskStatus::Pending) | Ok(TaskStatus::Other(_)) => {
                run.consecutive_errors = 0;
                None
            }
            Err(e) => {
                run.consecutive_errors += 1;
                tracing::warn!(
                    task_id = %ticket.task_id,
                    attempt = attempts,
                    error = %e,
                    "Task status query failed"
                );
                (run.consecutive_errors >= self.policy.max_consecutive_errors).then(|| {
                    PollStop::Failed {
                        reason: e.to_string(),
                    }
                })
            }
        };

        let stop = stop.or_else(|| {
            (attempts >= self.policy.max_attempts).then_some(PollStop::TimedOut { attempts })
        });

        match stop {
            Some(stop) => {
                self.active = None;
                PollStep::Stopped(stop)
            }
            None => PollStep::Continue(self.policy.interval),
        }
    }
}
