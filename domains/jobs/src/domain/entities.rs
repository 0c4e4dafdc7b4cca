//! Job domain entities for Shootout
//!
//! A shootout is the user-declared work description (DI tracks x signal
//! chains); a job is the executable unit derived from exactly one shootout.
//! Each entity includes validation, serialization, and its business rules.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use shootout_common::{Error, Result};

use crate::domain::state::{JobEvent, JobState, JobStateMachine, StateError};

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Check if status is terminal (job has finished)
    pub fn is_terminal(&self) -> bool {
        self.to_state().is_terminal()
    }

    /// Convert to state machine state
    pub fn to_state(&self) -> JobState {
        match self {
            JobStatus::Pending => JobState::Pending,
            JobStatus::Queued => JobState::Queued,
            JobStatus::Running => JobState::Running,
            JobStatus::Succeeded => JobState::Succeeded,
            JobStatus::Failed => JobState::Failed,
            JobStatus::Cancelled => JobState::Cancelled,
        }
    }

    /// Create from state machine state
    pub fn from_state(state: JobState) -> Self {
        match state {
            JobState::Pending => JobStatus::Pending,
            JobState::Queued => JobStatus::Queued,
            JobState::Running => JobStatus::Running,
            JobState::Succeeded => JobStatus::Succeeded,
            JobState::Failed => JobStatus::Failed,
            JobState::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Stable exit kinds recorded on failed and cancelled jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Ok,
    InvalidSpec,
    Auth,
    ModelFetch,
    Render,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Ok => "ok",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::Auth => "auth",
            ErrorKind::ModelFetch => "model_fetch",
            ErrorKind::Render => "render",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A tagged processing step in a signal chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Model,
    Ir,
    Eq,
    Reverb,
    Delay,
    Gain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub parameter: String,
}

/// An input audio recording, referenced by path under the uploads root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiTrack {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guitar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// An ordered sequence of stages applied to each DI track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalChain {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub stages: Vec<Stage>,
}

/// Unvalidated user submission, as received by the front door
#[derive(Debug, Clone, Deserialize)]
pub struct ShootoutDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub di_tracks: Vec<DiTrack>,
    #[serde(default)]
    pub signal_chains: Vec<SignalChain>,
}

/// Shootout entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Shootout {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub di_tracks: Json<Vec<DiTrack>>,
    pub signal_chains: Json<Vec<SignalChain>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shootout {
    /// Build a shootout from a validated draft
    pub fn from_draft(owner_id: Uuid, draft: ShootoutDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            title: draft.title,
            description: draft.description,
            di_tracks: Json(draft.di_tracks),
            signal_chains: Json(draft.signal_chains),
            created_at: now,
            updated_at: now,
        }
    }

    /// Distinct model references across all chains, in first-seen order
    pub fn model_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        for chain in self.signal_chains.0.iter() {
            for stage in &chain.stages {
                if stage.kind == StageKind::Model && !refs.contains(&stage.parameter) {
                    refs.push(stage.parameter.clone());
                }
            }
        }
        refs
    }
}

/// Job entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub shootout_id: Uuid,
    pub owner_id: Uuid,
    pub status: JobStatus,
    pub progress: i16,
    pub message: Option<String>,
    pub attempts: i16,
    pub result_path: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job for a shootout, admitted directly into `queued`
    pub fn new(shootout_id: Uuid, owner_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            shootout_id,
            owner_id,
            status: JobStatus::Queued,
            progress: 0,
            message: None,
            attempts: 0,
            result_path: None,
            error_kind: None,
            error_detail: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Check if job is terminal
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if a transition is valid without applying it
    pub fn can_transition(&self, event: &JobEvent) -> bool {
        JobStateMachine::can_transition(self.status.to_state(), event)
    }

    /// Compute the next status for an event, or a validation error
    pub fn next_status(&self, event: JobEvent) -> Result<JobStatus> {
        let next = JobStateMachine::transition(self.status.to_state(), event).map_err(
            |e| match e {
                StateError::InvalidTransition { from, event, .. } => Error::Conflict(format!(
                    "Invalid job transition: cannot apply '{}' event from '{}' state",
                    event, from
                )),
                StateError::TerminalState(state) => Error::Conflict(format!(
                    "Job is in terminal state '{}' and cannot transition",
                    state
                )),
            },
        )?;
        Ok(JobStatus::from_state(next))
    }

    /// Validate invariants
    pub fn validate(&self) -> Result<()> {
        if !(0..=100).contains(&self.progress) {
            return Err(Error::Internal(
                "Progress must be between 0 and 100".to_string(),
            ));
        }

        // progress = 100 iff succeeded
        if (self.progress == 100) != (self.status == JobStatus::Succeeded) {
            return Err(Error::Internal(
                "Progress 100 is reserved for succeeded jobs".to_string(),
            ));
        }

        // result_path is only ever set on succeeded jobs (retention may null it later)
        if self.result_path.is_some() && self.status != JobStatus::Succeeded {
            return Err(Error::Internal(
                "Only succeeded jobs carry a result path".to_string(),
            ));
        }

        if self.is_terminal() && self.completed_at.is_none() {
            return Err(Error::Internal(
                "Terminal jobs must have a completion timestamp".to_string(),
            ));
        }

        if self.status == JobStatus::Running && self.started_at.is_none() {
            return Err(Error::Internal(
                "Running jobs must have a start timestamp".to_string(),
            ));
        }

        match (&self.status, &self.error_kind) {
            (JobStatus::Failed | JobStatus::Cancelled, None) => {
                return Err(Error::Internal(
                    "Failed/cancelled jobs must have an error kind".to_string(),
                ));
            }
            (JobStatus::Succeeded, Some(_)) => {
                return Err(Error::Internal(
                    "Succeeded jobs must not have an error kind".to_string(),
                ));
            }
            _ => {}
        }

        if self.attempts < 0 {
            return Err(Error::Internal("Attempts cannot be negative".to_string()));
        }

        Ok(())
    }
}

/// Per-owner external-provider credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credential {
    pub owner_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
    pub broken: bool,
}

impl Credential {
    /// Whether the access token must be refreshed before use
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now >= self.access_expires_at - skew
    }
}
