//! Job lifecycle state machine.
//!
//! ```text
//! Closed → Opening → Opened → Closing → Closed
//!             │         │         │
//!             └────→ Failed ←─────┘
//! ```
//!
//! `Failed` is terminal. Recovering a failed job means constructing a new one.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use aj_common::{Error, JobId, Result};
use serde::{Deserialize, Serialize};

use crate::status::JobStatusObserver;

/// Operational state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Closed,
    Opening,
    Opened,
    Closing,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Closed,
        JobState::Opening,
        JobState::Opened,
        JobState::Closing,
        JobState::Failed,
    ];

    /// Whether `self → to` is in the transition table.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Closed, Opening)
                | (Opening, Opened)
                | (Opening, Failed)
                | (Opened, Closing)
                | (Opened, Failed)
                | (Closing, Closed)
                | (Closing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == JobState::Failed
    }

    pub fn is_any_of(self, candidates: &[JobState]) -> bool {
        candidates.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Closed => "closed",
            JobState::Opening => "opening",
            JobState::Opened => "opened",
            JobState::Closing => "closing",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns a job's [`JobState`] and enforces the transition table.
pub struct JobLifecycle {
    job_id: JobId,
    state: Mutex<JobState>,
    observer: Option<Arc<dyn JobStatusObserver>>,
}

impl JobLifecycle {
    /// New lifecycle in `Closed`.
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            state: Mutex::new(JobState::Closed),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobStatusObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_any_of(&self, candidates: &[JobState]) -> bool {
        self.state().is_any_of(candidates)
    }

    /// Move to `to`, returning the previous state.
    ///
    /// Illegal transitions leave the state untouched.
    pub fn transition(&self, to: JobState) -> Result<JobState> {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(Error::InvalidStateTransition {
                    job_id: self.job_id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            *state = to;
            from
        };

        if let Some(observer) = &self.observer {
            observer.state_changed(&self.job_id, from, to);
        }
        Ok(from)
    }
}

impl fmt::Debug for JobLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLifecycle")
            .field("job_id", &self.job_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingObserver;

    #[test]
    fn test_starts_closed() {
        let lifecycle = JobLifecycle::new(JobId::new("job-1"));
        assert_eq!(lifecycle.state(), JobState::Closed);
    }

    #[test]
    fn test_full_cycle() {
        let lifecycle = JobLifecycle::new(JobId::new("job-1"));
        for to in [
            JobState::Opening,
            JobState::Opened,
            JobState::Closing,
            JobState::Closed,
            JobState::Opening,
        ] {
            lifecycle.transition(to).unwrap();
            assert_eq!(lifecycle.state(), to);
        }
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let lifecycle = JobLifecycle::new(JobId::new("job-1"));
        let err = lifecycle.transition(JobState::Closing).unwrap_err();
        assert_eq!(err.code(), 10);
        assert_eq!(lifecycle.state(), JobState::Closed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let lifecycle = JobLifecycle::new(JobId::new("job-1"));
        lifecycle.transition(JobState::Opening).unwrap();
        lifecycle.transition(JobState::Failed).unwrap();
        for to in JobState::ALL {
            assert!(lifecycle.transition(to).is_err());
        }
        assert_eq!(lifecycle.state(), JobState::Failed);
    }

    #[test]
    fn test_closed_cannot_fail() {
        assert!(!JobState::Closed.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_is_any_of() {
        let lifecycle = JobLifecycle::new(JobId::new("job-1"));
        assert!(lifecycle.is_any_of(&[JobState::Closed, JobState::Failed]));
        assert!(!lifecycle.is_any_of(&[JobState::Opened]));
        assert!(!lifecycle.is_any_of(&[]));
    }

    #[test]
    fn test_observer_sees_transitions() {
        let observer = Arc::new(RecordingObserver::default());
        let lifecycle = JobLifecycle::new(JobId::new("job-1")).with_observer(observer.clone());
        lifecycle.transition(JobState::Opening).unwrap();
        let _ = lifecycle.transition(JobState::Closed);
        lifecycle.transition(JobState::Failed).unwrap();

        assert_eq!(
            observer.transitions(),
            vec![
                (JobState::Closed, JobState::Opening),
                (JobState::Opening, JobState::Failed),
            ]
        );
    }
}
