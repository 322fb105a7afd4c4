//! Job and pipeline lifecycle states.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of a job row.
///
/// Transitions only move forward along
/// `NotReady -> New -> InProgress -> {Done | Error}`. Chain materialization may
/// create rows directly in `NotReady` or `New`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Part of a pipeline chain, waiting for its predecessor.
    NotReady,
    /// Runnable, waiting to be claimed.
    New,
    /// Claimed by a runner.
    InProgress,
    /// Completed successfully.
    Done,
    /// Failed; `error` holds the failure description.
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::NotReady,
        JobStatus::New,
        JobStatus::InProgress,
        JobStatus::Done,
        JobStatus::Error,
    ];

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotReady => "NOT_READY",
            JobStatus::New => "NEW",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `Error` is reachable from every non-terminal state, since a failure can
    /// be observed at any point a row is in flight.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (NotReady, New)
                | (New, InProgress)
                | (InProgress, Done)
                | (NotReady, Error)
                | (New, Error)
                | (InProgress, Error)
        )
    }

    /// Validate a transition, returning the new state.
    ///
    /// The in-memory store routes claim, completion and promotion through this;
    /// the Postgres store encodes the same edges in its `WHERE status = …`
    /// guards. Recording a failure and handing back a stale claim are resets,
    /// not lifecycle steps.
    pub fn transition(self, next: JobStatus) -> Result<JobStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::serialization(format!("invalid JobStatus: {s}")))
    }
}

/// Stored state of a pipeline row.
///
/// Only `New` is ever written by the engine; the live state of a pipeline is
/// derived from its jobs (see `PipelineProgress`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    New,
    InProgress,
    Done,
    Error,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::New => "NEW",
            PipelineStatus::InProgress => "IN_PROGRESS",
            PipelineStatus::Done => "DONE",
            PipelineStatus::Error => "ERROR",
        }
    }
}

impl core::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(PipelineStatus::New),
            "IN_PROGRESS" => Ok(PipelineStatus::InProgress),
            "DONE" => Ok(PipelineStatus::Done),
            "ERROR" => Ok(PipelineStatus::Error),
            _ => Err(DomainError::serialization(format!(
                "invalid PipelineStatus: {s}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIFECYCLE: [JobStatus; 4] = [
        JobStatus::NotReady,
        JobStatus::New,
        JobStatus::InProgress,
        JobStatus::Done,
    ];

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    #[test]
    fn stored_form_round_trips() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DELETED".parse::<JobStatus>().is_err());
    }

    #[test]
    fn serde_uses_stored_form() {
        let json = serde_json::to_string(&JobStatus::NotReady).unwrap();
        assert_eq!(json, "\"NOT_READY\"");
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [JobStatus::Done, JobStatus::Error] {
            for to in JobStatus::ALL {
                assert!(from.transition(to).is_err());
            }
        }
    }

    proptest! {
        /// Whatever transitions are attempted, the accepted ones form a prefix of
        /// the lifecycle, optionally ending in `Error`.
        #[test]
        fn accepted_transitions_are_monotonic(
            start_new in any::<bool>(),
            attempts in prop::collection::vec(any_status(), 0..32),
        ) {
            let mut current = if start_new { JobStatus::New } else { JobStatus::NotReady };
            let mut observed = vec![current];
            for next in attempts {
                if let Ok(status) = current.transition(next) {
                    current = status;
                    observed.push(status);
                }
            }

            let offset = if start_new { 1 } else { 0 };
            for (idx, status) in observed.iter().enumerate() {
                if *status == JobStatus::Error {
                    prop_assert_eq!(idx, observed.len() - 1);
                } else {
                    prop_assert_eq!(*status, LIFECYCLE[idx + offset]);
                }
            }
        }
    }
}
