//! Orchestration of the work-schedule pipeline.
//!
//! - [`EventTrigger`]: turns storage notifications into executions
//! - [`MainPipeline`]: runs the stage graph in [`machine`]
//! - [`UserConfigWorkflow`]: lookup-or-create of per-user configuration

pub mod abort;
pub mod machine;
pub mod runner;
pub mod trigger;
pub mod user_config;

use std::sync::Arc;

use crate::delivery::Messenger;
use crate::error::Result;
use crate::models::Config;
use crate::stage::StageInvoker;
use crate::stages::{DeliverUnit, IngestUnit, PersistUnit, RenderUnit};
use crate::storage::ObjectStore;
use crate::store::{DataStore, ExecutionLedger};

pub use abort::{AbortHandle, AbortSignal};
pub use machine::{Event, PipelineDefinition, Target};
pub use runner::{MainPipeline, StageUnits};
pub use trigger::{EventTrigger, TriggerOutcome};
pub use user_config::UserConfigWorkflow;

/// External services the pipeline runs against.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn DataStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub messenger: Arc<dyn Messenger>,
}

/// Wire the standard stage units from configuration.
pub fn standard_units(config: &Config, services: &Services) -> StageUnits {
    StageUnits {
        ingest: Arc::new(IngestUnit::new(services.objects.clone())),
        persist: Arc::new(PersistUnit::new(services.store.clone())),
        ensure_config: Arc::new(UserConfigWorkflow::new(
            services.store.clone(),
            &config.store.template_kind,
        )),
        render: Arc::new(RenderUnit::new(
            services.store.clone(),
            services.objects.clone(),
            config.artifacts.bucket.clone(),
            &config.artifacts.prefix,
        )),
        deliver: Arc::new(DeliverUnit::new(
            services.objects.clone(),
            services.messenger.clone(),
            config.delivery.default_channel.clone(),
        )),
    }
}

/// Build a ready-to-use trigger over `services`.
pub fn build(config: &Config, services: Services) -> Result<EventTrigger> {
    PipelineDefinition::standard().validate()?;

    let pipeline = MainPipeline::new(
        standard_units(config, &services),
        StageInvoker::from_config(&config.retry),
        services.store.clone(),
        ExecutionLedger::new(services.store.clone()),
        config.pipeline.clone(),
    );
    Ok(EventTrigger::new(config.trigger.clone(), Arc::new(pipeline)))
}
