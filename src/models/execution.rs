// src/models/execution.rs

//! Execution records persisted by the orchestrator.
//!
//! A [`PipelineExecution`] is created when a trigger matches, mutated only by
//! the pipeline runner, and frozen once it reaches a terminal status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::{ConfigResolution, ScheduleArtifact, TriggerInput};

/// Stages of the main pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    PersistRecords,
    EnsureUserConfig,
    RenderSchedule,
    Deliver,
}

/// Whether a stage runs once per execution or once per user branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageScope {
    Execution,
    Branch,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Ingest,
        Stage::PersistRecords,
        Stage::EnsureUserConfig,
        Stage::RenderSchedule,
        Stage::Deliver,
    ];

    pub fn scope(self) -> StageScope {
        match self {
            Stage::Ingest | Stage::PersistRecords => StageScope::Execution,
            _ => StageScope::Branch,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "Ingest",
            Stage::PersistRecords => "PersistRecords",
            Stage::EnsureUserConfig => "EnsureUserConfig",
            Stage::RenderSchedule => "RenderSchedule",
            Stage::Deliver => "Deliver",
        }
    }

    /// Name used in configuration keys and serialized records.
    pub fn key(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::PersistRecords => "persist_records",
            Stage::EnsureUserConfig => "ensure_user_config",
            Stage::RenderSchedule => "render_schedule",
            Stage::Deliver => "deliver",
        }
    }

    pub fn stages_in(scope: StageScope) -> impl Iterator<Item = Stage> {
        Self::ALL.into_iter().filter(move |s| s.scope() == scope)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
}

/// A failure attributed to a stage and, for branch stages, a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub state: StageState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOutcome {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Progress of one user's branch (EnsureUserConfig → RenderSchedule → Deliver).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub user_id: String,
    pub outcome: BranchOutcome,
    pub stages: BTreeMap<Stage, StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigResolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ScheduleArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl BranchRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            outcome: BranchOutcome::Pending,
            stages: Stage::stages_in(StageScope::Branch)
                .map(|s| (s, StageRecord::default()))
                .collect(),
            config: None,
            artifact: None,
            failure: None,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(&stage)
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageRecord {
        self.stages.entry(stage).or_default()
    }

    /// Succeeded or failed; no stage of this branch will run again.
    pub fn is_finished(&self) -> bool {
        matches!(self.outcome, BranchOutcome::Succeeded | BranchOutcome::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of the main pipeline for one triggering object version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub execution_id: String,
    pub trigger: TriggerInput,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    /// Execution-wide stages (Ingest, PersistRecords)
    pub stages: BTreeMap<Stage, StageRecord>,
    /// Per-user branches keyed by user id
    #[serde(default)]
    pub branches: BTreeMap<String, BranchRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl PipelineExecution {
    pub fn new(trigger: TriggerInput) -> Self {
        Self {
            execution_id: trigger.execution_id(),
            trigger,
            status: ExecutionStatus::Running,
            current_stage: None,
            stages: Stage::stages_in(StageScope::Execution)
                .map(|s| (s, StageRecord::default()))
                .collect(),
            branches: BTreeMap::new(),
            started_at: Utc::now(),
            ended_at: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(&stage)
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageRecord {
        self.stages.entry(stage).or_default()
    }

    pub fn branch(&self, user_id: &str) -> Option<&BranchRecord> {
        self.branches.get(user_id)
    }

    pub fn branch_mut(&mut self, user_id: &str) -> &mut BranchRecord {
        self.branches
            .entry(user_id.to_string())
            .or_insert_with(|| BranchRecord::new(user_id))
    }

    pub fn failed_branches(&self) -> impl Iterator<Item = &BranchRecord> {
        self.branches
            .values()
            .filter(|b| b.outcome == BranchOutcome::Failed)
    }

    /// Failure summarising the branches once all of them finished.
    ///
    /// A mix of succeeded and failed branches is a partial delivery; if every
    /// branch failed, the first failure's kind is reported.
    pub fn branch_failure(&self) -> Option<FailureRecord> {
        let failed: Vec<&BranchRecord> = self.failed_branches().collect();
        let first = failed.first()?.failure.clone()?;
        let any_succeeded = self
            .branches
            .values()
            .any(|b| b.outcome == BranchOutcome::Succeeded);

        if !any_succeeded {
            return Some(first);
        }

        let users: Vec<&str> = failed.iter().map(|b| b.user_id.as_str()).collect();
        Some(FailureRecord {
            stage: first.stage,
            user_id: None,
            kind: ErrorKind::PartialDelivery,
            reason: format!(
                "{} of {} branches failed: {}",
                failed.len(),
                self.branches.len(),
                users.join(", ")
            ),
        })
    }

    /// Move to a terminal status. Ignored if already terminal.
    pub fn finish(&mut self, status: ExecutionStatus, failure: Option<FailureRecord>) {
        if self.is_terminal() {
            return;
        }
        self.status = status;
        self.failure = failure;
        self.current_stage = None;
        self.ended_at = Some(Utc::now());
    }
}
