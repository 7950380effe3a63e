//! AWS Lambda entry point for the work schedule pipeline
//!
//! Deploy with `cargo lambda build --release --features lambda` and subscribe
//! the function to the upload bucket's object-created notifications.

use std::sync::Arc;

use lambda_runtime::{Error as LambdaError, LambdaEvent, service_fn};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aws_lambda_events::s3::S3Event;
use workschedule::{
    config::RemoteConfigLoader,
    delivery::SlackMessenger,
    lambda,
    models::Config,
    pipeline::{self, Services},
    storage::{ObjectStore, S3ObjectStore},
    store::DynamoStore,
};

/// Main entry point for the AWS Lambda function.
#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Work schedule Lambda starting...");

    let objects: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::from_env().await);
    let config = match std::env::var("CONFIG_BUCKET") {
        Ok(bucket) => {
            let prefix = std::env::var("CONFIG_PREFIX").unwrap_or_else(|_| "config".to_string());
            RemoteConfigLoader::new(objects.clone(), &bucket, &prefix)
                .load_config()
                .await?
        }
        Err(_) => {
            let mut config = Config::default();
            config.apply_env();
            config.validate()?;
            config
        }
    };

    let services = Services {
        store: Arc::new(DynamoStore::from_env(&config.store.table_name).await),
        objects,
        messenger: Arc::new(SlackMessenger::from_config(&config.delivery)?),
    };
    let trigger = Arc::new(pipeline::build(&config, services)?);

    lambda_runtime::run(service_fn(move |event: LambdaEvent<S3Event>| {
        let trigger = Arc::clone(&trigger);
        async move { lambda::handler(&trigger, event).await }
    }))
    .await
}
