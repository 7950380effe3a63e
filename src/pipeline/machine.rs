// src/pipeline/machine.rs

//! The main pipeline as an explicit transition table.
//!
//! ```text
//! Ingest ─ok→ PersistRecords ─ok→ fan out per user:
//!     EnsureUserConfig ─ok/skip→ RenderSchedule ─ok→ Deliver ─ok→ branch succeeded
//! execution stages ─fail→ execution failed
//! branch stages    ─fail→ branch failed
//! ```

use crate::error::{AppError, Result};
use crate::models::{Stage, StageScope};

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Succeeded,
    Skipped,
    Failed,
}

/// Where the runtime goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Continue with another stage in the same scope
    Stage(Stage),
    /// Start one branch per user at the given stage
    FanOut(Stage),
    BranchSucceeded,
    BranchFailed,
    ExecutionFailed,
}

/// Transition table evaluated by the pipeline runner.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    start: Stage,
    transitions: Vec<(Stage, Event, Target)>,
}

impl PipelineDefinition {
    /// Ingest → PersistRecords → per user (EnsureUserConfig → RenderSchedule → Deliver).
    pub fn standard() -> Self {
        use Event::*;
        use Stage::*;

        Self {
            start: Ingest,
            transitions: vec![
                (Ingest, Succeeded, Target::Stage(PersistRecords)),
                (Ingest, Failed, Target::ExecutionFailed),
                (PersistRecords, Succeeded, Target::FanOut(EnsureUserConfig)),
                (PersistRecords, Failed, Target::ExecutionFailed),
                (EnsureUserConfig, Succeeded, Target::Stage(RenderSchedule)),
                (EnsureUserConfig, Skipped, Target::Stage(RenderSchedule)),
                (EnsureUserConfig, Failed, Target::BranchFailed),
                (RenderSchedule, Succeeded, Target::Stage(Deliver)),
                (RenderSchedule, Failed, Target::BranchFailed),
                (Deliver, Succeeded, Target::BranchSucceeded),
                (Deliver, Failed, Target::BranchFailed),
            ],
        }
    }

    pub fn start(&self) -> Stage {
        self.start
    }

    pub fn next(&self, stage: Stage, event: Event) -> Option<Target> {
        self.transitions
            .iter()
            .find(|(s, e, _)| *s == stage && *e == event)
            .map(|(_, _, target)| *target)
    }

    /// Check that the table is well formed: every stage has a success and a
    /// failure edge, edges stay in their scope, and failures end the scope.
    pub fn validate(&self) -> Result<()> {
        if self.start.scope() != StageScope::Execution {
            return Err(AppError::config("pipeline must start with an execution stage"));
        }

        for stage in Stage::ALL {
            let ok = self.next(stage, Event::Succeeded).ok_or_else(|| {
                AppError::config(format!("{stage} has no success transition"))
            })?;
            let failed = self.next(stage, Event::Failed).ok_or_else(|| {
                AppError::config(format!("{stage} has no failure transition"))
            })?;

            let (expected_fail, ok_valid) = match stage.scope() {
                StageScope::Execution => (
                    Target::ExecutionFailed,
                    match ok {
                        Target::Stage(next) => next.scope() == StageScope::Execution,
                        Target::FanOut(next) => next.scope() == StageScope::Branch,
                        _ => false,
                    },
                ),
                StageScope::Branch => (
                    Target::BranchFailed,
                    match ok {
                        Target::Stage(next) => next.scope() == StageScope::Branch,
                        Target::BranchSucceeded => true,
                        _ => false,
                    },
                ),
            };
            if failed != expected_fail || !ok_valid {
                return Err(AppError::config(format!("{stage} has an invalid transition")));
            }
        }
        Ok(())
    }

    /// Stages in the order a successful run visits them.
    pub fn happy_path(&self) -> Vec<Stage> {
        let mut path = vec![self.start];
        let mut stage = self.start;
        while let Some(Target::Stage(next) | Target::FanOut(next)) =
            self.next(stage, Event::Succeeded)
        {
            if path.contains(&next) {
                break;
            }
            path.push(next);
            stage = next;
        }
        path
    }
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        Self::standard()
    }
}
