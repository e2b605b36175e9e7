use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A status enum backed by a statically declared transition table.
pub trait StatusMachine: Copy + Eq + fmt::Debug + fmt::Display + 'static {
    /// Every variant, in declaration order.
    const ALL: &'static [Self];

    /// Statuses this status may legally move to.
    fn allowed_next(self) -> &'static [Self];

    /// Terminal statuses need no further polling or scheduling.
    fn is_end(self) -> bool;
}

/// Outcome of comparing a requested status change against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance,
    NoOp,
    Illegal,
}

/// `true` iff `new` is in the declared transition set of `old`.
pub fn check_status_transition<S: StatusMachine>(old: S, new: S) -> bool {
    old.allowed_next().contains(&new)
}

pub fn classify_transition<S: StatusMachine>(old: S, new: S) -> Transition {
    if old == new {
        Transition::NoOp
    } else if check_status_transition(old, new) {
        Transition::Advance
    } else {
        Transition::Illegal
    }
}

/// Rerun re-entry: any end status may go back to `Waiting`, nothing else.
pub fn check_rerun_transition(old: JobStatus, new: JobStatus) -> bool {
    old.is_end() && new == JobStatus::Waiting
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! status_strings {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Primary job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Waiting,
    Running,
    Success,
    Failed,
    Canceled,
}

status_strings!(JobStatus, "job", {
    Waiting => "WAITING",
    Running => "RUNNING",
    Success => "SUCCESS",
    Failed => "FAILED",
    Canceled => "CANCELED",
});

impl StatusMachine for JobStatus {
    const ALL: &'static [Self] = &[
        JobStatus::Waiting,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    fn allowed_next(self) -> &'static [Self] {
        match self {
            JobStatus::Waiting => &[JobStatus::Running, JobStatus::Failed, JobStatus::Canceled],
            JobStatus::Running => &[JobStatus::Success, JobStatus::Failed, JobStatus::Canceled],
            JobStatus::Success | JobStatus::Failed | JobStatus::Canceled => &[],
        }
    }

    fn is_end(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl JobStatus {
    pub fn end_statuses() -> Vec<JobStatus> {
        Self::ALL.iter().copied().filter(|s| s.is_end()).collect()
    }

    pub fn non_end_statuses() -> Vec<JobStatus> {
        Self::ALL.iter().copied().filter(|s| !s.is_end()).collect()
    }
}

/// Job status set used by protocol adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdapterJobStatus {
    Pending,
    Ready,
    Rejected,
    Running,
    Finished,
}

status_strings!(AdapterJobStatus, "adapter job", {
    Pending => "PENDING",
    Ready => "READY",
    Rejected => "REJECTED",
    Running => "RUNNING",
    Finished => "FINISHED",
});

impl StatusMachine for AdapterJobStatus {
    const ALL: &'static [Self] = &[
        AdapterJobStatus::Pending,
        AdapterJobStatus::Ready,
        AdapterJobStatus::Rejected,
        AdapterJobStatus::Running,
        AdapterJobStatus::Finished,
    ];

    fn allowed_next(self) -> &'static [Self] {
        match self {
            AdapterJobStatus::Pending => &[AdapterJobStatus::Ready, AdapterJobStatus::Rejected],
            AdapterJobStatus::Ready => &[AdapterJobStatus::Running, AdapterJobStatus::Finished],
            AdapterJobStatus::Running => &[AdapterJobStatus::Finished],
            AdapterJobStatus::Rejected | AdapterJobStatus::Finished => &[],
        }
    }

    fn is_end(self) -> bool {
        matches!(self, AdapterJobStatus::Finished | AdapterJobStatus::Rejected)
    }
}

impl AdapterJobStatus {
    /// Explicit mapping into the primary lifecycle. Every adapter status has
    /// exactly one counterpart; unknown strings never reach this point because
    /// parsing rejects them.
    pub fn to_job_status(self) -> JobStatus {
        match self {
            AdapterJobStatus::Pending => JobStatus::Waiting,
            AdapterJobStatus::Ready => JobStatus::Waiting,
            AdapterJobStatus::Running => JobStatus::Running,
            AdapterJobStatus::Finished => JobStatus::Success,
            AdapterJobStatus::Rejected => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failed,
}

status_strings!(TaskStatus, "task", {
    Pending => "PENDING",
    Ready => "READY",
    Running => "RUNNING",
    Success => "SUCCESS",
    Failed => "FAILED",
});

impl StatusMachine for TaskStatus {
    const ALL: &'static [Self] = &[
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failed,
    ];

    fn allowed_next(self) -> &'static [Self] {
        match self {
            TaskStatus::Pending => &[
                TaskStatus::Ready,
                TaskStatus::Running,
                TaskStatus::Success,
                TaskStatus::Failed,
            ],
            TaskStatus::Ready => &[TaskStatus::Running, TaskStatus::Failed, TaskStatus::Success],
            TaskStatus::Running => &[TaskStatus::Success, TaskStatus::Failed],
            TaskStatus::Success | TaskStatus::Failed => &[],
        }
    }

    fn is_end(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl TaskStatus {
    /// Dispatched to a worker but not finished.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB_TABLE: &[(JobStatus, &[JobStatus])] = &[
        (
            JobStatus::Waiting,
            &[JobStatus::Running, JobStatus::Failed, JobStatus::Canceled],
        ),
        (
            JobStatus::Running,
            &[JobStatus::Success, JobStatus::Failed, JobStatus::Canceled],
        ),
        (JobStatus::Success, &[]),
        (JobStatus::Failed, &[]),
        (JobStatus::Canceled, &[]),
    ];

    const TASK_TABLE: &[(TaskStatus, &[TaskStatus])] = &[
        (
            TaskStatus::Pending,
            &[
                TaskStatus::Ready,
                TaskStatus::Running,
                TaskStatus::Success,
                TaskStatus::Failed,
            ],
        ),
        (
            TaskStatus::Ready,
            &[TaskStatus::Running, TaskStatus::Failed, TaskStatus::Success],
        ),
        (TaskStatus::Running, &[TaskStatus::Success, TaskStatus::Failed]),
        (TaskStatus::Success, &[]),
        (TaskStatus::Failed, &[]),
    ];

    const ADAPTER_TABLE: &[(AdapterJobStatus, &[AdapterJobStatus])] = &[
        (
            AdapterJobStatus::Pending,
            &[AdapterJobStatus::Ready, AdapterJobStatus::Rejected],
        ),
        (
            AdapterJobStatus::Ready,
            &[AdapterJobStatus::Running, AdapterJobStatus::Finished],
        ),
        (AdapterJobStatus::Running, &[AdapterJobStatus::Finished]),
        (AdapterJobStatus::Rejected, &[]),
        (AdapterJobStatus::Finished, &[]),
    ];

    fn assert_table<S: StatusMachine>(table: &[(S, &[S])]) {
        assert_eq!(table.len(), S::ALL.len());
        for (old, allowed) in table {
            for new in S::ALL {
                assert_eq!(
                    check_status_transition(*old, *new),
                    allowed.contains(new),
                    "{} -> {}",
                    old,
                    new
                );
            }
        }
    }

    #[test]
    fn test_job_transition_table_is_exhaustive() {
        assert_table(JOB_TABLE);
    }

    #[test]
    fn test_task_transition_table_is_exhaustive() {
        assert_table(TASK_TABLE);
    }

    #[test]
    fn test_adapter_transition_table_is_exhaustive() {
        assert_table(ADAPTER_TABLE);
    }

    #[test]
    fn test_self_transition_is_noop_not_illegal() {
        for status in TaskStatus::ALL {
            assert_eq!(classify_transition(*status, *status), Transition::NoOp);
        }
        assert_eq!(
            classify_transition(TaskStatus::Success, TaskStatus::Running),
            Transition::Illegal
        );
        assert_eq!(
            classify_transition(TaskStatus::Running, TaskStatus::Success),
            Transition::Advance
        );
    }

    #[test]
    fn test_end_statuses() {
        assert_eq!(
            JobStatus::end_statuses(),
            vec![JobStatus::Success, JobStatus::Failed, JobStatus::Canceled]
        );
        assert!(TaskStatus::Failed.is_end());
        assert!(!TaskStatus::Ready.is_end());
        assert!(AdapterJobStatus::Finished.is_end());
    }

    #[test]
    fn test_rerun_reentry_only_from_end() {
        for old in JobStatus::ALL {
            assert_eq!(
                check_rerun_transition(*old, JobStatus::Waiting),
                old.is_end()
            );
            assert!(!check_rerun_transition(*old, JobStatus::Running));
        }
    }

    #[test]
    fn test_adapter_mapping_and_strict_parse() {
        assert_eq!(
            "FINISHED".parse::<AdapterJobStatus>().unwrap().to_job_status(),
            JobStatus::Success
        );
        assert_eq!(
            AdapterJobStatus::Rejected.to_job_status(),
            JobStatus::Failed
        );
        let err = "DONE".parse::<AdapterJobStatus>().unwrap_err();
        assert_eq!(err.value, "DONE");
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Running).unwrap(),
            "\"RUNNING\""
        );
        assert_eq!("CANCELED".parse::<JobStatus>(), Ok(JobStatus::Canceled));
    }
}
