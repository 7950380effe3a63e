//! Test doubles shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::delivery::{DeliveryReceipt, DeliveryRequest, Messenger};
use crate::error::{AppError, Result};
use crate::models::{Config, TemplateConfig};
use crate::pipeline::{
    EventTrigger, MainPipeline, Services, StageUnits, UserConfigWorkflow, build, standard_units,
};
use crate::stage::{StageInvoker, StageUnit};
use crate::storage::{MemoryObjectStore, ObjectStore};
use crate::store::{DataStore, ExecutionLedger, MemoryStore};

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

enum Script {
    Steps(Mutex<VecDeque<Result<Value>>>),
    Always(ErrorFactory),
}

/// Stage unit replaying a fixed list of results.
pub struct ScriptedUnit {
    name: String,
    script: Script,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedUnit {
    pub fn new(name: &str, steps: Vec<Result<Value>>) -> Self {
        Self {
            name: name.to_string(),
            script: Script::Steps(Mutex::new(steps.into())),
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Fails every call with a fresh error from `make`.
    pub fn always<F>(name: &str, make: F) -> Self
    where
        F: Fn() -> AppError + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            script: Script::Always(Arc::new(make)),
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageUnit for ScriptedUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, _input: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.script {
            Script::Always(make) => Err(make()),
            Script::Steps(steps) => steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::rejected(format!("{}: script exhausted", self.name)))),
        }
    }
}

/// Messenger that records deliveries and can fail for chosen users.
#[derive(Clone, Default)]
pub struct RecordingMessenger {
    sent: Arc<Mutex<Vec<DeliveryRequest>>>,
    failures: Arc<Mutex<HashMap<String, ErrorFactory>>>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery for `user_id` fails with an error from `make`.
    pub fn fail_for<F>(&self, user_id: &str, make: F)
    where
        F: Fn() -> AppError + Send + Sync + 'static,
    {
        self.failures
            .lock()
            .unwrap()
            .insert(user_id.to_string(), Arc::new(make));
    }

    pub fn deliveries(&self) -> Vec<DeliveryRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReceipt> {
        let failure = self.failures.lock().unwrap().get(&request.user_id).cloned();
        if let Some(make) = failure {
            return Err(make());
        }

        let receipt = DeliveryReceipt {
            user_id: request.user_id.clone(),
            channel: request.channel.clone(),
            file_id: format!("F{}", self.sent.lock().unwrap().len() + 1),
            delivered_at: Utc::now(),
        };
        self.sent.lock().unwrap().push(request);
        Ok(receipt)
    }
}

const WORK_HEADER: &str = "id\tname\tdate\twork_num\tdate_code\tdate_type\twork_code\twork_type\tstart_time\tend_time\tstart_time_round\tend_time_round\tbreak_hours\twork_hours\tnight_hours\tmemo";

/// A tab-delimited upload with two January days per user.
pub fn work_file(users: &[&str]) -> Vec<u8> {
    let mut text = WORK_HEADER.to_string();
    for user in users {
        for (num, date) in [(1, "20240105"), (2, "20240108")] {
            text.push_str(&format!(
                "\n{user}\tName\t{date}\t{num}\t0\tweekday\t01\tonsite\t09:00\t18:00\t09:00\t18:00\t1:00\t8:00\t0:00\t"
            ));
        }
    }
    text.into_bytes()
}

/// In-memory services plus a configuration tuned for fast tests.
pub struct Harness {
    pub store: MemoryStore,
    pub objects: MemoryObjectStore,
    pub messenger: RecordingMessenger,
    pub config: Config,
}

impl Harness {
    /// Services with the default template seeded.
    pub async fn new() -> Self {
        let mut config = Config::default();
        config.delivery.default_channel = Some("C-default".into());
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 1;
        config.retry.jitter = false;

        let store = MemoryStore::new();
        UserConfigWorkflow::new(Arc::new(store.clone()), &config.store.template_kind)
            .seed_template(&TemplateConfig::builtin(&config.store.template_kind), false)
            .await
            .unwrap();

        Self {
            store,
            objects: MemoryObjectStore::new(),
            messenger: RecordingMessenger::new(),
            config,
        }
    }

    pub async fn upload(&self, bucket: &str, key: &str, users: &[&str]) {
        self.objects
            .put_object(bucket, key, work_file(users), "text/tab-separated-values")
            .await
            .unwrap();
    }

    pub fn services(&self) -> Services {
        Services {
            store: Arc::new(self.store.clone()),
            objects: Arc::new(self.objects.clone()),
            messenger: Arc::new(self.messenger.clone()),
        }
    }

    pub fn units(&self) -> StageUnits {
        standard_units(&self.config, &self.services())
    }

    pub fn pipeline(&self, units: StageUnits) -> MainPipeline {
        let store: Arc<dyn DataStore> = Arc::new(self.store.clone());
        MainPipeline::new(
            units,
            StageInvoker::from_config(&self.config.retry),
            store.clone(),
            ExecutionLedger::new(store),
            self.config.pipeline.clone(),
        )
    }

    pub fn trigger(&self) -> EventTrigger {
        build(&self.config, self.services()).unwrap()
    }
}
