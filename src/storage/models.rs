//! Data models for storage operations.
//!
//! This module defines the task run record and the mutations the
//! aggregator applies to it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Current time, truncated to the millisecond precision the store keeps.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Lifecycle status of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is the active aggregation window.
    InProgress,
    /// All writes for the run completed.
    Success,
    /// A write for the run failed.
    Failed,
}

impl RunStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(StorageError::Database(format!("unknown run status '{other}'"))),
        }
    }
}

/// What opened a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// A content scan.
    Scan,
    /// A file addition or deletion.
    Activity,
}

impl RunTrigger {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Activity => "activity",
        }
    }
}

impl FromStr for RunTrigger {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan" => Ok(Self::Scan),
            "activity" => Ok(Self::Activity),
            other => Err(StorageError::Database(format!("unknown run trigger '{other}'"))),
        }
    }
}

/// A window of aggregated filesystem activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Store-assigned identifier, `None` until created.
    pub id: Option<i64>,

    /// When the run was opened. Never changes afterwards.
    pub start_time: DateTime<Utc>,

    /// When the run was finalized; `None` while in progress.
    pub end_time: Option<DateTime<Utc>>,

    /// Paths created during the run, in arrival order.
    pub files_added: Vec<String>,

    /// Paths deleted during the run, in arrival order.
    pub files_deleted: Vec<String>,

    /// Cumulative marker-string occurrences from scans attributed to the run.
    pub magic_string_hits: u64,

    /// Current status.
    pub status: RunStatus,

    /// What opened the run.
    pub opened_by: RunTrigger,
}

impl TaskRun {
    /// Create a new in-progress run starting now.
    #[must_use]
    pub fn begin(opened_by: RunTrigger) -> Self {
        Self {
            id: None,
            start_time: now(),
            end_time: None,
            files_added: Vec::new(),
            files_deleted: Vec::new(),
            magic_string_hits: 0,
            status: RunStatus::InProgress,
            opened_by,
        }
    }

    /// Set the initial hit count.
    #[must_use]
    pub const fn with_hits(mut self, hits: u64) -> Self {
        self.magic_string_hits = hits;
        self
    }

    /// Whether this run is the active aggregation window.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::InProgress
    }

    /// Runtime as of `at`: `end - start` once finalized, `at - start` otherwise.
    #[must_use]
    pub fn runtime_at(&self, at: DateTime<Utc>) -> Duration {
        let end = match (self.status, self.end_time) {
            (RunStatus::InProgress, _) | (_, None) => at,
            (_, Some(end)) => end,
        };
        (end - self.start_time).to_std().unwrap_or_default()
    }

    /// Runtime as of now.
    #[must_use]
    pub fn runtime(&self) -> Duration {
        self.runtime_at(Utc::now())
    }
}

/// A single persisted change to a task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMutation {
    /// Append to `files_added`; (re)opens the run.
    AppendAdded(String),
    /// Append to `files_deleted`; (re)opens the run.
    AppendDeleted(String),
    /// Add scan hits to the cumulative count; (re)opens the run.
    AddHits(u64),
    /// Move the run to a terminal status.
    Finish {
        status: RunStatus,
        at: DateTime<Utc>,
    },
}

impl RunMutation {
    /// Finalize as successful now.
    #[must_use]
    pub fn succeed() -> Self {
        Self::Finish {
            status: RunStatus::Success,
            at: now(),
        }
    }

    /// Finalize as failed now.
    #[must_use]
    pub fn fail() -> Self {
        Self::Finish {
            status: RunStatus::Failed,
            at: now(),
        }
    }
}
