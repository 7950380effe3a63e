//! Work Schedule CLI
//!
//! Local execution entry point. For AWS Lambda, use `workschedule-lambda`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use workschedule::{
    config::load_config,
    delivery::{Messenger, OutboxMessenger, SlackMessenger},
    error::{AppError, Result},
    models::{ExecutionStatus, StorageNotification, TemplateConfig},
    pipeline::{self, AbortHandle, Services, TriggerOutcome, UserConfigWorkflow},
    storage::{LocalObjectStore, ObjectStore},
    store::{DataStore, ExecutionLedger, LocalStore, PutOutcome},
    utils::log,
};

/// Work Schedule - upload-triggered schedule pipeline
#[derive(Parser, Debug)]
#[command(
    name = "workschedule",
    version,
    about = "Turns uploaded work-data files into per-user schedules"
)]
struct Cli {
    /// Path to storage directory containing config.toml and local objects
    #[arg(short, long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline for one uploaded object
    Run {
        #[arg(long)]
        bucket: String,

        #[arg(long)]
        key: String,

        /// Object version (unversioned when omitted)
        #[arg(long)]
        version: Option<String>,

        /// Copy this local file to bucket/key before running
        #[arg(long)]
        file: Option<PathBuf>,

        /// Deliver through Slack instead of the local outbox
        #[arg(long)]
        slack: bool,
    },

    /// Show the recorded state of an execution
    Status { execution_id: String },

    /// Seed the configuration template users are derived from
    Template {
        /// Template kind (default: store.template_kind)
        #[arg(long)]
        kind: Option<String>,

        /// Overwrite an existing template
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration files
    Validate,
}

/// Initialize logging from the verbosity flag, else the configured level.
fn init_logging(verbose: bool, configured: &str) {
    let level = if verbose { "debug" } else { configured };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.storage_dir.join("config.toml");
    let config = load_config(&config_path)?;
    init_logging(cli.verbose, &config.logging.level);
    ::log::info!("Loaded configuration from {}", cli.storage_dir.display());

    let store: Arc<dyn DataStore> = Arc::new(LocalStore::new(&config.store.local_path));
    let objects: Arc<dyn ObjectStore> =
        Arc::new(LocalObjectStore::new(cli.storage_dir.join("objects")));

    match cli.command {
        Command::Run {
            bucket,
            key,
            version,
            file,
            slack,
        } => {
            if let Some(file) = file {
                let bytes = tokio::fs::read(&file).await?;
                objects
                    .put_object(&bucket, &key, bytes, "text/plain")
                    .await?;
                log::info(&format!("Uploaded {} to {}/{}", file.display(), bucket, key));
            }

            let messenger: Arc<dyn Messenger> = if slack {
                Arc::new(SlackMessenger::from_config(&config.delivery)?)
            } else {
                Arc::new(OutboxMessenger::new(&config.delivery.outbox_dir))
            };
            let trigger = pipeline::build(
                &config,
                Services {
                    store,
                    objects,
                    messenger,
                },
            )?;

            let (handle, signal) = AbortHandle::new();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn("Interrupted; stopping after the running stages");
                    handle.abort();
                }
            });

            let mut notification = StorageNotification::object_created(&bucket, &key);
            notification.version_id = version;

            log::header(&format!("Run {}/{}", bucket, key));
            match trigger.handle(&notification, signal).await? {
                TriggerOutcome::Started(execution) => {
                    log::execution(&execution);
                    if execution.status != ExecutionStatus::Succeeded {
                        return Err(AppError::validation(format!(
                            "execution {} finished {}",
                            execution.execution_id, execution.status
                        )));
                    }
                    log::success("Execution succeeded");
                }
                TriggerOutcome::Duplicate { execution_id } => {
                    log::warn(&format!(
                        "Already processed as execution {execution_id}; use `status` to inspect it"
                    ));
                }
                TriggerOutcome::Ignored { reason } => {
                    log::warn(&format!("Not started: {reason}"));
                }
            }
        }

        Command::Status { execution_id } => {
            let execution = ExecutionLedger::new(store).status(&execution_id).await?;
            log::execution(&execution);
        }

        Command::Template { kind, force } => {
            let kind = kind.unwrap_or_else(|| config.store.template_kind.clone());
            let workflow = UserConfigWorkflow::new(store, &kind);
            match workflow
                .seed_template(&TemplateConfig::builtin(&kind), force)
                .await?
            {
                PutOutcome::Created => log::success(&format!("Template {kind:?} written")),
                PutOutcome::AlreadyExists => log::warn(&format!(
                    "Template {kind:?} already exists. Use --force to overwrite."
                )),
            }
        }

        Command::Validate => {
            log::info("Validating configuration...");
            pipeline::PipelineDefinition::standard().validate()?;
            log::summary(
                "Configuration",
                &[
                    ("trigger prefix", config.trigger.prefix.clone()),
                    ("table", config.store.table_name.clone()),
                    ("template", config.store.template_kind.clone()),
                    ("artifact prefix", config.artifacts.prefix.clone()),
                    (
                        "execution timeout",
                        format!("{}s", config.pipeline.execution_timeout_secs),
                    ),
                    ("max attempts", config.retry.max_attempts.to_string()),
                ],
            );
            log::success("✓ Config OK");
        }
    }

    Ok(())
}
