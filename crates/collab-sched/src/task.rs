//! Task handles and terminal states

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

/// Scheduler assigned task number
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a scheduled job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Registered and not yet terminal
    Running,
    /// The step sequence was exhausted
    Finished,
    /// Stopped through its handle
    Stopped,
    /// A step returned an error or panicked
    Failed(String),
    /// The scheduler went away before the job ended
    Done,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Finished => write!(f, "finished"),
            TaskState::Stopped => write!(f, "stopped"),
            TaskState::Failed(reason) => write!(f, "failed: {}", reason),
            TaskState::Done => write!(f, "done"),
        }
    }
}

/// Why a stop request had nothing to stop.
///
/// None of these is fatal; callers that only want the task gone treat every
/// variant as success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskStopError {
    #[error("scheduler already shut down")]
    Done,

    #[error("task already stopped")]
    Stopped,

    #[error("task already failed: {0}")]
    Failed(String),

    #[error("task already finished")]
    Finished,
}

/// Shared view of one scheduled job
#[derive(Clone, Debug)]
pub struct TaskHandle {
    id: TaskId,
    state: Arc<watch::Sender<TaskState>>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, state: Arc<watch::Sender<TaskState>>) -> Self {
        TaskHandle { id, state }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    pub fn is_live(&self) -> bool {
        !self.state.borrow().is_terminal()
    }

    /// Stop the job. The step currently in flight, if any, runs to
    /// completion; no further step is started.
    pub fn stop(&self) -> Result<(), TaskStopError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state {
            TaskState::Running => {
                *state = TaskState::Stopped;
                true
            }
            TaskState::Finished => {
                outcome = Err(TaskStopError::Finished);
                false
            }
            TaskState::Stopped => {
                outcome = Err(TaskStopError::Stopped);
                false
            }
            TaskState::Failed(reason) => {
                outcome = Err(TaskStopError::Failed(reason.clone()));
                false
            }
            TaskState::Done => {
                outcome = Err(TaskStopError::Done);
                false
            }
        });
        outcome
    }

    /// Wait until the job reaches a terminal state
    pub async fn finished(&self) -> TaskState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(TaskState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => TaskState::Done,
        };
        state
    }
}

/// Move a running task into `terminal`. Terminal tasks are left alone.
pub(crate) fn settle(state: &watch::Sender<TaskState>, terminal: TaskState) -> bool {
    state.send_if_modified(|s| {
        if *s == TaskState::Running {
            *s = terminal;
            true
        } else {
            false
        }
    })
}
