// src/pipeline/runner.rs

//! Runtime evaluating the [`PipelineDefinition`] for one execution.
//!
//! Execution-wide stages run in sequence; after PersistRecords the run fans
//! out into one branch per user, bounded by `max_parallel_branches`. Every
//! state change is written to the [`ExecutionLedger`] so the status surface
//! reflects progress while the run is in flight.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};

use crate::error::{ErrorKind, Result};
use crate::models::{
    BranchOutcome, ConfigResolution, ExecutionStatus, FailureRecord, PipelineConfig,
    PipelineExecution, ScheduleArtifact, Stage, StageRecord, StageState, USER_CONFIG_SK,
    UserConfig,
};
use crate::pipeline::AbortSignal;
use crate::pipeline::machine::{Event, PipelineDefinition, Target};
use crate::stage::{Budget, Outcome, StageInvoker, StageUnit};
use crate::stages::{
    ConfigReady, DeliverOutput, DeliverRequest, EnsureConfigRequest, PersistOutput, RenderRequest,
    UserMonths, from_payload, to_payload,
};
use crate::store::{DataStore, ExecutionLedger};

/// The unit of work behind each stage.
#[derive(Clone)]
pub struct StageUnits {
    pub ingest: Arc<dyn StageUnit>,
    pub persist: Arc<dyn StageUnit>,
    /// The user-config sub-workflow, invoked only when no config exists
    pub ensure_config: Arc<dyn StageUnit>,
    pub render: Arc<dyn StageUnit>,
    pub deliver: Arc<dyn StageUnit>,
}

impl StageUnits {
    fn get(&self, stage: Stage) -> &dyn StageUnit {
        match stage {
            Stage::Ingest => self.ingest.as_ref(),
            Stage::PersistRecords => self.persist.as_ref(),
            Stage::EnsureUserConfig => self.ensure_config.as_ref(),
            Stage::RenderSchedule => self.render.as_ref(),
            Stage::Deliver => self.deliver.as_ref(),
        }
    }
}

/// Shared execution record; every mutation is persisted.
#[derive(Clone)]
struct Tracker {
    execution: Arc<Mutex<PipelineExecution>>,
    ledger: ExecutionLedger,
}

impl Tracker {
    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PipelineExecution),
    {
        let mut execution = self.execution.lock().await;
        f(&mut execution);
        if let Err(e) = self.ledger.save(&execution).await {
            warn!("Failed to save execution {}: {}", execution.execution_id, e);
        }
    }

    async fn snapshot(&self) -> PipelineExecution {
        self.execution.lock().await.clone()
    }
}

/// Per-run limits shared by every stage.
#[derive(Clone)]
struct RunContext {
    execution_id: String,
    source_bucket: String,
    tracker: Tracker,
    deadline: Instant,
    abort: AbortSignal,
}

impl RunContext {
    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Failure explaining why no further stage may start, if any.
    fn stop_reason(&self, stage: Stage, user_id: Option<&str>) -> Option<FailureRecord> {
        let (kind, reason) = if self.abort.is_aborted() {
            (ErrorKind::Cancelled, "execution aborted")
        } else if self.expired() {
            (ErrorKind::TransientInfra, "execution deadline reached")
        } else {
            return None;
        };
        Some(FailureRecord {
            stage,
            user_id: user_id.map(String::from),
            kind,
            reason: reason.to_string(),
        })
    }
}

/// The orchestrator proper.
pub struct MainPipeline {
    definition: PipelineDefinition,
    units: StageUnits,
    invoker: StageInvoker,
    store: Arc<dyn DataStore>,
    ledger: ExecutionLedger,
    config: PipelineConfig,
}

impl MainPipeline {
    pub fn new(
        units: StageUnits,
        invoker: StageInvoker,
        store: Arc<dyn DataStore>,
        ledger: ExecutionLedger,
        config: PipelineConfig,
    ) -> Self {
        Self {
            definition: PipelineDefinition::standard(),
            units,
            invoker,
            store,
            ledger,
            config,
        }
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    /// Run an execution to a terminal status and return the final record.
    ///
    /// The record must already exist in the ledger.
    pub async fn run(&self, execution: PipelineExecution, abort: AbortSignal) -> Result<PipelineExecution> {
        let span = info_span!("execution", execution_id = %execution.execution_id);
        self.run_inner(execution, abort).instrument(span).await
    }

    async fn run_inner(&self, execution: PipelineExecution, abort: AbortSignal) -> Result<PipelineExecution> {
        info!(
            "Starting execution for {}/{}",
            execution.trigger.bucket, execution.trigger.key
        );
        let ctx = RunContext {
            execution_id: execution.execution_id.clone(),
            source_bucket: execution.trigger.bucket.clone(),
            tracker: Tracker {
                execution: Arc::new(Mutex::new(execution.clone())),
                ledger: self.ledger.clone(),
            },
            deadline: Instant::now() + self.config.execution_timeout(),
            abort,
        };

        let mut payload = to_payload(&execution.trigger)?;
        let mut stage = self.definition.start();

        let branch_start = loop {
            if let Some(failure) = ctx.stop_reason(stage, None) {
                return self.finish_stopped(&ctx, failure).await;
            }

            let (event, output) = self.run_stage(&ctx, stage, None, payload.clone()).await;
            if let Some(output) = output {
                payload = output;
            }

            match self.definition.next(stage, event) {
                Some(Target::Stage(next)) => stage = next,
                Some(Target::FanOut(next)) => break next,
                _ => return self.finish_failed(&ctx).await,
            }
        };

        let persisted: PersistOutput = match decode_output(Stage::PersistRecords, payload) {
            Ok(persisted) => persisted,
            Err(failure) => {
                ctx.tracker
                    .update(|e| e.stage_mut(Stage::PersistRecords).error = Some(failure))
                    .await;
                return self.finish_failed(&ctx).await;
            }
        };

        ctx.tracker
            .update(|e| {
                for user in &persisted.users {
                    e.branch_mut(&user.user_id);
                }
            })
            .await;
        info!("Fanning out to {} users", persisted.users.len());

        stream::iter(persisted.users)
            .map(|user| self.run_branch(&ctx, branch_start, user))
            .buffer_unordered(self.config.max_parallel_branches.max(1))
            .collect::<Vec<()>>()
            .await;

        self.finish_branches(&ctx).await
    }

    /// Invoke one stage and record its progress. Returns the transition event
    /// and, on success, the stage output.
    async fn run_stage(
        &self,
        ctx: &RunContext,
        stage: Stage,
        user_id: Option<&str>,
        input: Value,
    ) -> (Event, Option<Value>) {
        let unit = self.units.get(stage);
        self.mark(ctx, stage, user_id, |record| {
            record.state = StageState::Running;
            record.started_at = Some(Utc::now());
        })
        .await;

        let budget = Budget::new(self.config.stage_timeout(stage))
            .with_deadline(ctx.deadline)
            .with_abort(ctx.abort.clone());
        let invocation = self.invoker.invoke_within(unit, input, &budget).await;

        match invocation.outcome {
            Outcome::Success(output) => {
                self.mark(ctx, stage, user_id, |record| {
                    record.state = StageState::Succeeded;
                    record.attempts = invocation.attempts;
                    record.ended_at = Some(Utc::now());
                })
                .await;
                (Event::Succeeded, Some(output))
            }
            Outcome::RetryableFailure(failure) | Outcome::TerminalFailure(failure) => {
                warn!(
                    stage = %stage,
                    user_id = user_id.unwrap_or("-"),
                    "Stage failed [{}]: {}",
                    failure.kind,
                    failure.reason
                );
                let record = FailureRecord {
                    stage,
                    user_id: user_id.map(String::from),
                    kind: failure.kind,
                    reason: failure.reason,
                };
                self.fail(ctx, stage, user_id, invocation.attempts, record).await;
                (Event::Failed, None)
            }
        }
    }

    async fn mark<F>(&self, ctx: &RunContext, stage: Stage, user_id: Option<&str>, f: F)
    where
        F: FnOnce(&mut StageRecord),
    {
        ctx.tracker
            .update(|e| {
                match user_id {
                    Some(user) => f(e.branch_mut(user).stage_mut(stage)),
                    None => {
                        e.current_stage = Some(stage);
                        f(e.stage_mut(stage));
                    }
                }
            })
            .await;
    }

    async fn fail(
        &self,
        ctx: &RunContext,
        stage: Stage,
        user_id: Option<&str>,
        attempts: u32,
        failure: FailureRecord,
    ) {
        ctx.tracker
            .update(|e| {
                let record = match user_id {
                    Some(user) => {
                        let branch = e.branch_mut(user);
                        branch.outcome = BranchOutcome::Failed;
                        branch.failure = Some(failure.clone());
                        branch.stage_mut(stage)
                    }
                    None => e.stage_mut(stage),
                };
                record.state = StageState::Failed;
                record.attempts = attempts;
                record.ended_at = Some(Utc::now());
                record.error = Some(failure);
            })
            .await;
    }

    /// One user's branch: EnsureUserConfig → RenderSchedule → Deliver.
    async fn run_branch(&self, ctx: &RunContext, start: Stage, user: UserMonths) {
        let span = info_span!("branch", user_id = %user.user_id);
        self.run_branch_inner(ctx, start, user).instrument(span).await
    }

    async fn run_branch_inner(&self, ctx: &RunContext, start: Stage, user: UserMonths) {
        let user_id = user.user_id.as_str();
        ctx.tracker
            .update(|e| e.branch_mut(user_id).outcome = BranchOutcome::Running)
            .await;

        let mut stage = start;
        let mut config: Option<UserConfig> = None;
        let mut artifact: Option<ScheduleArtifact> = None;

        loop {
            if let Some(failure) = ctx.stop_reason(stage, Some(user_id)) {
                self.fail(ctx, stage, Some(user_id), 0, failure).await;
                return;
            }

            let event = match stage {
                Stage::EnsureUserConfig => match self.ensure_config(ctx, user_id).await {
                    Some((event, ready)) => {
                        config = Some(ready);
                        event
                    }
                    None => Event::Failed,
                },
                Stage::RenderSchedule => {
                    let Some(config) = config.clone() else {
                        self.fail_missing_input(ctx, stage, user_id, "user config").await;
                        return;
                    };
                    let request = RenderRequest {
                        execution_id: ctx.execution_id.clone(),
                        source_bucket: ctx.source_bucket.clone(),
                        user_id: user_id.to_string(),
                        months: user.months.clone(),
                        config,
                    };
                    match self.run_typed::<_, ScheduleArtifact>(ctx, stage, user_id, &request).await {
                        Some(rendered) => {
                            let stored = rendered.clone();
                            ctx.tracker
                                .update(|e| e.branch_mut(user_id).artifact = Some(stored))
                                .await;
                            artifact = Some(rendered);
                            Event::Succeeded
                        }
                        None => Event::Failed,
                    }
                }
                Stage::Deliver => {
                    let Some(artifact) = artifact.clone() else {
                        self.fail_missing_input(ctx, stage, user_id, "schedule artifact").await;
                        return;
                    };
                    let request = DeliverRequest {
                        user_id: user_id.to_string(),
                        channel: config.as_ref().and_then(|c| c.channel.clone()),
                        artifact,
                    };
                    match self.run_typed::<_, DeliverOutput>(ctx, stage, user_id, &request).await {
                        Some(receipt) => {
                            info!("Delivered to {} as {}", receipt.channel, receipt.file_id);
                            Event::Succeeded
                        }
                        None => Event::Failed,
                    }
                }
                other => {
                    self.fail_missing_input(ctx, other, user_id, "branch stage").await;
                    return;
                }
            };

            match self.definition.next(stage, event) {
                Some(Target::Stage(next)) => stage = next,
                Some(Target::BranchSucceeded) => {
                    ctx.tracker
                        .update(|e| e.branch_mut(user_id).outcome = BranchOutcome::Succeeded)
                        .await;
                    info!("Branch succeeded");
                    return;
                }
                _ => return,
            }
        }
    }

    /// Skip the sub-workflow when a config already exists; otherwise invoke
    /// it and wait for the config to be confirmed.
    async fn ensure_config(&self, ctx: &RunContext, user_id: &str) -> Option<(Event, UserConfig)> {
        let stage = Stage::EnsureUserConfig;

        match self.store.get(user_id, USER_CONFIG_SK).await {
            Ok(Some(item)) => match item.decode::<UserConfig>() {
                Ok(config) => {
                    self.mark(ctx, stage, Some(user_id), |record| {
                        record.state = StageState::Skipped;
                        record.ended_at = Some(Utc::now());
                    })
                    .await;
                    ctx.tracker
                        .update(|e| e.branch_mut(user_id).config = Some(ConfigResolution::Existing))
                        .await;
                    return Some((Event::Skipped, config));
                }
                Err(e) => warn!("Stored config for {} is unreadable: {}", user_id, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Config existence check failed, invoking workflow: {}", e),
        }

        let request = EnsureConfigRequest {
            user_id: user_id.to_string(),
        };
        let ready: ConfigReady = self.run_typed(ctx, stage, user_id, &request).await?;
        ctx.tracker
            .update(|e| e.branch_mut(user_id).config = Some(ready.resolution))
            .await;
        Some((Event::Succeeded, ready.config))
    }

    /// Run a branch stage with a typed request and decode its output.
    async fn run_typed<I, O>(&self, ctx: &RunContext, stage: Stage, user_id: &str, request: &I) -> Option<O>
    where
        I: serde::Serialize,
        O: DeserializeOwned,
    {
        let input = match to_payload(request) {
            Ok(input) => input,
            Err(e) => {
                let failure = FailureRecord {
                    stage,
                    user_id: Some(user_id.to_string()),
                    kind: e.kind(),
                    reason: e.to_string(),
                };
                self.fail(ctx, stage, Some(user_id), 0, failure).await;
                return None;
            }
        };

        let (event, output) = self.run_stage(ctx, stage, Some(user_id), input).await;
        let output = match (event, output) {
            (Event::Succeeded, Some(output)) => output,
            _ => return None,
        };

        match decode_output(stage, output) {
            Ok(value) => Some(value),
            Err(mut failure) => {
                failure.user_id = Some(user_id.to_string());
                let attempts = ctx
                    .tracker
                    .snapshot()
                    .await
                    .branch(user_id)
                    .and_then(|b| b.stage(stage))
                    .map(|r| r.attempts)
                    .unwrap_or(1);
                self.fail(ctx, stage, Some(user_id), attempts, failure).await;
                None
            }
        }
    }

    async fn fail_missing_input(&self, ctx: &RunContext, stage: Stage, user_id: &str, what: &str) {
        error!("{} reached without {}", stage, what);
        let failure = FailureRecord {
            stage,
            user_id: Some(user_id.to_string()),
            kind: ErrorKind::Rejected,
            reason: format!("{stage} reached without {what}"),
        };
        self.fail(ctx, stage, Some(user_id), 0, failure).await;
    }

    /// Abort or deadline hit before an execution-wide stage.
    async fn finish_stopped(&self, ctx: &RunContext, failure: FailureRecord) -> Result<PipelineExecution> {
        let status = if failure.kind == ErrorKind::Cancelled {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::TimedOut
        };
        ctx.tracker
            .update(|e| e.stage_mut(failure.stage).error = Some(failure.clone()))
            .await;
        self.finish(ctx, status, Some(failure)).await
    }

    /// An execution-wide stage failed terminally.
    async fn finish_failed(&self, ctx: &RunContext) -> Result<PipelineExecution> {
        let snapshot = ctx.tracker.snapshot().await;
        let failure = snapshot
            .stages
            .values()
            .find_map(|record| record.error.clone());
        let status = if ctx.expired() {
            ExecutionStatus::TimedOut
        } else {
            ExecutionStatus::Failed
        };
        self.finish(ctx, status, failure).await
    }

    /// Every branch reached a terminal outcome.
    async fn finish_branches(&self, ctx: &RunContext) -> Result<PipelineExecution> {
        let snapshot = ctx.tracker.snapshot().await;
        let Some(mut failure) = snapshot.branch_failure() else {
            return self.finish(ctx, ExecutionStatus::Succeeded, None).await;
        };

        let status = if ctx.abort.is_aborted() {
            failure.kind = ErrorKind::Cancelled;
            ExecutionStatus::Failed
        } else if ctx.expired() {
            ExecutionStatus::TimedOut
        } else {
            ExecutionStatus::Failed
        };
        self.finish(ctx, status, Some(failure)).await
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        status: ExecutionStatus,
        failure: Option<FailureRecord>,
    ) -> Result<PipelineExecution> {
        let mut execution = ctx.tracker.execution.lock().await;
        execution.finish(status, failure);
        self.ledger.save(&execution).await?;

        match &execution.failure {
            Some(f) => warn!("Execution {} [{}] {}: {}", status, f.kind, f.stage, f.reason),
            None => info!("Execution {}", status),
        }
        Ok(execution.clone())
    }
}

fn decode_output<T: DeserializeOwned>(stage: Stage, output: Value) -> std::result::Result<T, FailureRecord> {
    from_payload(stage.as_str(), output).map_err(|e| FailureRecord {
        stage,
        user_id: None,
        kind: ErrorKind::Input,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::AppError;
    use crate::models::TriggerInput;
    use crate::pipeline::AbortHandle;
    use crate::storage::ObjectStore;
    use crate::store::Item;
    use crate::test_support::{Harness, ScriptedUnit};
    use crate::utils::log::execution_report;

    const KEY: &str = "raw/2024-01.csv";

    async fn run(harness: &Harness, units: StageUnits, abort: AbortSignal) -> PipelineExecution {
        let pipeline = harness.pipeline(units);
        let execution = PipelineExecution::new(TriggerInput::new("b", KEY, Some("v1".into())));
        pipeline.ledger().create_if_absent(&execution).await.unwrap();
        pipeline.run(execution, abort).await.unwrap()
    }

    /// Wraps a unit and logs `start`/`end` events per user.
    struct Traced {
        inner: Arc<dyn StageUnit>,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl StageUnit for Traced {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn call(&self, input: Value) -> Result<Value> {
            let user = input["user_id"].as_str().unwrap_or("-").to_string();
            self.log.lock().unwrap().push(format!("start {} {}", self.name(), user));
            let output = self.inner.call(input).await;
            self.log.lock().unwrap().push(format!("end {} {}", self.name(), user));
            output
        }
    }

    /// Aborts the execution from inside a running stage.
    struct AbortingUnit {
        inner: Arc<dyn StageUnit>,
        handle: AbortHandle,
    }

    #[async_trait]
    impl StageUnit for AbortingUnit {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn call(&self, input: Value) -> Result<Value> {
            self.handle.abort();
            self.inner.call(input).await
        }
    }

    #[tokio::test]
    async fn test_two_new_users_succeed() {
        let harness = Harness::new().await;
        harness.upload("b", KEY, &["u1", "u2"]).await;

        let exec = run(&harness, harness.units(), AbortSignal::never()).await;

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert!(exec.failure.is_none());
        assert_eq!(exec.branches.len(), 2);
        for user in ["u1", "u2"] {
            let branch = exec.branch(user).unwrap();
            assert_eq!(branch.outcome, BranchOutcome::Succeeded);
            assert_eq!(branch.config, Some(ConfigResolution::Created));
            assert!(branch.artifact.is_some());

            let rows = harness.store.query_by_id(user, "").await.unwrap();
            assert_eq!(rows.iter().filter(|i| i.sk == USER_CONFIG_SK).count(), 1);
            assert_eq!(rows.iter().filter(|i| i.sk.starts_with("WorkData#")).count(), 2);
        }

        let artifacts = harness.objects.keys("b").await;
        assert_eq!(
            artifacts
                .iter()
                .filter(|k| k.starts_with("work_schedule/"))
                .count(),
            2
        );
        assert_eq!(harness.messenger.deliveries().len(), 2);

        let stored = harness.pipeline(harness.units()).ledger().status(&exec.execution_id).await.unwrap();
        assert_eq!(stored, exec);
    }

    #[tokio::test]
    async fn test_permission_error_fails_only_that_branch() {
        let harness = Harness::new().await;
        harness.upload("b", KEY, &["u1", "u2"]).await;
        harness
            .messenger
            .fail_for("u2", || AppError::permission("slack: not_in_channel"));

        let exec = run(&harness, harness.units(), AbortSignal::never()).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.branch("u1").unwrap().outcome, BranchOutcome::Succeeded);

        let u2 = exec.branch("u2").unwrap();
        assert_eq!(u2.outcome, BranchOutcome::Failed);
        let failure = u2.failure.as_ref().unwrap();
        assert_eq!(failure.kind, ErrorKind::Permission);
        assert_eq!(failure.stage, Stage::Deliver);
        assert_eq!(u2.stage(Stage::Deliver).unwrap().attempts, 1);

        let summary = exec.failure.as_ref().unwrap();
        assert_eq!(summary.kind, ErrorKind::PartialDelivery);
        assert!(summary.reason.contains("u2"));

        let report = execution_report(&exec).join("\n");
        assert!(report.contains("user u1 → succeeded"));
        assert!(report.contains("user u2 → failed(PermissionError)"));
        assert_eq!(harness.messenger.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_config_skips_workflow() {
        let harness = Harness::new().await;
        harness.upload("b", KEY, &["u1"]).await;
        let existing = crate::models::TemplateConfig::builtin("default").derive_for("u1");
        harness
            .store
            .put(Item::encode("u1", USER_CONFIG_SK, &existing).unwrap())
            .await
            .unwrap();

        let workflow = Arc::new(ScriptedUnit::new("UserConfigWorkflow", vec![]));
        let mut units = harness.units();
        units.ensure_config = workflow.clone();

        let exec = run(&harness, units, AbortSignal::never()).await;

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(workflow.calls(), 0);
        let branch = exec.branch("u1").unwrap();
        assert_eq!(branch.config, Some(ConfigResolution::Existing));
        assert_eq!(
            branch.stage(Stage::EnsureUserConfig).unwrap().state,
            StageState::Skipped
        );
    }

    #[tokio::test]
    async fn test_branch_stages_run_in_order() {
        let harness = Harness::new().await;
        harness.upload("b", KEY, &["u1", "u2", "u3"]).await;

        let log = Arc::new(StdMutex::new(Vec::new()));
        let trace = |inner: Arc<dyn StageUnit>| -> Arc<dyn StageUnit> {
            Arc::new(Traced {
                inner,
                log: log.clone(),
            })
        };
        let base = harness.units();
        let units = StageUnits {
            ingest: base.ingest.clone(),
            persist: base.persist.clone(),
            ensure_config: trace(base.ensure_config.clone()),
            render: trace(base.render.clone()),
            deliver: trace(base.deliver.clone()),
        };

        let exec = run(&harness, units, AbortSignal::never()).await;
        assert_eq!(exec.status, ExecutionStatus::Succeeded);

        let log = log.lock().unwrap().clone();
        let position = |event: &str| log.iter().position(|l| l == event).unwrap();
        for user in ["u1", "u2", "u3"] {
            assert!(
                position(&format!("end UserConfigWorkflow {user}"))
                    < position(&format!("start RenderSchedule {user}"))
            );
            assert!(
                position(&format!("end RenderSchedule {user}"))
                    < position(&format!("start Deliver {user}"))
            );
        }
    }

    #[tokio::test]
    async fn test_transient_render_failure_is_retried_three_times() {
        let harness = Harness::new().await;
        harness.upload("b", KEY, &["u1"]).await;

        let render = Arc::new(ScriptedUnit::always("RenderSchedule", || {
            AppError::remote("ThrottlingException", "Rate exceeded")
        }));
        let mut units = harness.units();
        units.render = render.clone();

        let exec = run(&harness, units, AbortSignal::never()).await;

        assert_eq!(render.calls(), 3);
        assert_eq!(exec.status, ExecutionStatus::Failed);
        let branch = exec.branch("u1").unwrap();
        let record = branch.stage(Stage::RenderSchedule).unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.state, StageState::Failed);
        assert_eq!(
            branch.failure.as_ref().unwrap().kind,
            ErrorKind::TransientInfra
        );
        assert_eq!(
            branch.stage(Stage::Deliver).unwrap().state,
            StageState::Pending
        );
        assert!(harness.messenger.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_upload_fails_execution_at_ingest() {
        let harness = Harness::new().await;
        harness
            .objects
            .put_object("b", KEY, b"id\tname\nu1\tonly two columns".to_vec(), "text/plain")
            .await
            .unwrap();

        let exec = run(&harness, harness.units(), AbortSignal::never()).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        let failure = exec.failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::Ingest);
        assert_eq!(failure.kind, ErrorKind::Input);
        assert_eq!(exec.stage(Stage::Ingest).unwrap().attempts, 1);
        assert_eq!(
            exec.stage(Stage::PersistRecords).unwrap().state,
            StageState::Pending
        );
        assert!(exec.branches.is_empty());
    }

    #[tokio::test]
    async fn test_abort_before_start_runs_nothing() {
        let harness = Harness::new().await;
        harness.upload("b", KEY, &["u1"]).await;
        let (handle, signal) = AbortHandle::new();
        handle.abort();

        let ingest = Arc::new(ScriptedUnit::new("Ingest", vec![Ok(json!({ "users": [] }))]));
        let mut units = harness.units();
        units.ingest = ingest.clone();

        let exec = run(&harness, units, signal).await;

        assert_eq!(ingest.calls(), 0);
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.failure.as_ref().unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_abort_lets_running_stage_finish() {
        let harness = Harness::new().await;
        harness.upload("b", KEY, &["u1"]).await;
        let (handle, signal) = AbortHandle::new();

        let mut units = harness.units();
        units.ensure_config = Arc::new(AbortingUnit {
            inner: units.ensure_config.clone(),
            handle,
        });

        let exec = run(&harness, units, signal).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.failure.as_ref().unwrap().kind, ErrorKind::Cancelled);

        let branch = exec.branch("u1").unwrap();
        assert_eq!(
            branch.stage(Stage::EnsureUserConfig).unwrap().state,
            StageState::Succeeded
        );
        assert_eq!(branch.failure.as_ref().unwrap().stage, Stage::RenderSchedule);
        assert_eq!(
            branch.stage(Stage::Deliver).unwrap().state,
            StageState::Pending
        );
        // The config write completed before the stop.
        assert!(harness.store.get("u1", USER_CONFIG_SK).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_execution_deadline_times_out() {
        let mut harness = Harness::new().await;
        harness.config.pipeline.execution_timeout_secs = 1;
        harness.upload("b", KEY, &["u1"]).await;

        let render = Arc::new(
            ScriptedUnit::new("RenderSchedule", vec![]).with_delay(Duration::from_secs(5)),
        );
        let mut units = harness.units();
        units.render = render.clone();

        let exec = run(&harness, units, AbortSignal::never()).await;

        assert_eq!(exec.status, ExecutionStatus::TimedOut);
        assert_eq!(render.calls(), 1);
        assert_eq!(
            exec.branch("u1").unwrap().failure.as_ref().unwrap().stage,
            Stage::RenderSchedule
        );
        assert!(harness.messenger.deliveries().is_empty());
    }
}
