//! ephemera CLI
//!
//! Controller side (`launch`, `monitor`, `kill`, `cleanup`) runs on an operator
//! machine. `worker` runs on the launched instance.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ephemera_core::app::{App, AppBuilder, LaunchRequest, MonitorEvent, WorkerParts};
use ephemera_core::config::{DEFAULT_CONFIG_FILE, EphemeraConfig, StorageBackend};
use ephemera_core::domain::{CleanupReport, InstanceId, RunId};
use ephemera_core::impls::{
    AwsCliProvisioner, CommandSync, CommandTrainer, LocalBlobStore, NvidiaSmiProbe, S3CliBlobStore,
};
use ephemera_core::ports::BlobStore;

#[derive(Parser)]
#[command(name = "ephemera", about = "Ephemeral GPU training runs")]
struct Cli {
    /// Path to ephemera.toml (defaults apply when the file is absent)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Environment name, overrides the config file
    #[arg(short, long, global = true, env = "EPHEMERA_ENV")]
    env: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a new run
    Launch {
        /// JSON file handed to the trainer as-is
        #[arg(short, long)]
        training_config: Option<PathBuf>,

        /// Keep watching the run after launch
        #[arg(long)]
        watch: bool,
    },

    /// Watch the active run until it finishes
    Monitor {
        /// Poll interval in seconds, overrides the config file
        #[arg(short, long)]
        interval: Option<u64>,

        /// Print the current status once and exit
        #[arg(long)]
        once: bool,
    },

    /// Kill the active run and tear down its instance
    Kill {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,

        #[arg(short, long, default_value = "killed by operator")]
        reason: String,
    },

    /// Execute the phases of a run (on the instance)
    Worker {
        #[arg(long, env = "EPHEMERA_RUN_ID")]
        run_id: String,
    },

    /// Tear down a run's resources by hand
    Cleanup {
        /// Defaults to the run in the state object
        #[arg(long, requires = "instance_id")]
        run_id: Option<String>,

        #[arg(long, requires = "run_id")]
        instance_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<EphemeraConfig> {
    let mut config = if cli.config.exists() {
        EphemeraConfig::load(&cli.config)?
    } else {
        tracing::debug!(path = %cli.config.display(), "config file not found, using defaults");
        EphemeraConfig::default()
    };
    if let Some(env) = &cli.env {
        config.environment = env.clone();
    }
    Ok(config)
}

fn build_app(config: &EphemeraConfig) -> anyhow::Result<App> {
    let mut compute = AwsCliProvisioner::new(config.compute.profile.region.clone());
    if let Some(profile) = &config.compute.aws_profile {
        compute = compute.with_profile(profile);
    }
    let blob: Arc<dyn BlobStore> = match config.storage.backend {
        StorageBackend::Local => Arc::new(LocalBlobStore::new(&config.storage.root)),
        StorageBackend::S3 => {
            let Some(bucket) = &config.storage.bucket else {
                bail!("storage.bucket is required for the s3 backend");
            };
            let mut store = S3CliBlobStore::new(bucket.as_str(), config.storage_region())
                .with_profile(config.compute.aws_profile.clone());
            if let Some(prefix) = &config.storage.prefix {
                store = store.with_prefix(prefix.as_str());
            }
            Arc::new(store)
        }
    };
    let app = AppBuilder::new()
        .environment(config.environment.as_str())
        .blob_store(blob)
        .compute(Arc::new(compute))
        .retry_policy(config.retry_policy())
        .timeouts(config.timeouts())
        .profile(config.compute.profile.clone())
        .build()?;
    Ok(app)
}

/// `Ok(false)` means the command ran but the run did not end cleanly.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = load_config(&cli)?;
    let app = build_app(&config)?;
    run_command(&app, config, cli.command).await
}

async fn run_command(app: &App, config: EphemeraConfig, command: Commands) -> anyhow::Result<bool> {
    match command {
        Commands::Launch {
            training_config,
            watch,
        } => {
            let training_config = match training_config {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => serde_json::json!({}),
            };
            let state = app
                .launcher()
                .launch(LaunchRequest {
                    profile: config.compute.profile.clone(),
                    training_config,
                })
                .await?;
            println!("launched run={} instance={}", state.run_id, state.instance_id);
            if watch {
                return watch_run(app, &config, false).await;
            }
            Ok(true)
        }

        Commands::Monitor { interval, once } => {
            let mut config = config;
            if let Some(secs) = interval {
                config.monitor.interval_secs = secs;
            }
            watch_run(app, &config, once).await
        }

        Commands::Kill { force, reason } => {
            let Some(state) = app.store().try_read().await? else {
                eprintln!("no active run in environment {}", app.environment());
                return Ok(false);
            };
            if !force && !confirm(&format!("Kill run {} ({})?", state.run_id, state.status)).await? {
                println!("aborted");
                return Ok(true);
            }
            let report = app.killer().kill(&config.kill_options(reason)).await?;
            println!("{}", report.summary());
            if let Some(cleanup) = &report.cleanup {
                print_cleanup(cleanup);
            }
            Ok(report.succeeded())
        }

        Commands::Worker { run_id } => {
            let parts = WorkerParts {
                trainer: Arc::new(CommandTrainer::new(config.worker.trainer.clone())),
                sync: Arc::new(CommandSync::new(
                    config.worker.sync_in.clone(),
                    config.worker.sync_out.clone(),
                )),
                probe: Arc::new(NvidiaSmiProbe),
            };
            let executor = app.executor(parts, config.worker_options());
            let outcome = executor.execute(&RunId::new(run_id)).await?;
            println!(
                "run {} finished in {:.0}s, {} model file(s)",
                outcome.training.run_id,
                outcome.training.total_duration_seconds,
                outcome.training.model_files.len()
            );
            print_cleanup(&outcome.cleanup);
            Ok(!outcome.cleanup.manual_action_required)
        }

        Commands::Cleanup {
            run_id,
            instance_id,
        } => {
            let mut agent = app.cleanup_agent();
            let (run_id, instance_id) = match (run_id, instance_id) {
                // 明示された id なら、読めない state も消してよい
                (Some(run_id), Some(instance_id)) => {
                    agent = agent.discarding_unreadable_state();
                    (RunId::new(run_id), InstanceId::new(instance_id))
                }
                _ => match app.store().try_read().await? {
                    Some(state) => (state.run_id, state.instance_id),
                    None => bail!("no run state found; pass --run-id and --instance-id"),
                },
            };
            let report = agent.cleanup(&run_id, &instance_id).await;
            print_cleanup(&report);
            Ok(!report.manual_action_required)
        }
    }
}

async fn watch_run(app: &App, config: &EphemeraConfig, once: bool) -> anyhow::Result<bool> {
    let mut monitor = app.monitor(config.monitor_interval());
    if once {
        let event = monitor.poll_once().await?;
        print_event(&event);
        return Ok(true);
    }

    let last = tokio::select! {
        res = monitor.run(print_event) => res?,
        _ = tokio::signal::ctrl_c() => {
            println!("stopped watching; the run continues");
            return Ok(true);
        }
    };
    Ok(match last {
        MonitorEvent::Finished {
            cleanup: Some(report),
            ..
        } => !report.manual_action_required,
        _ => true,
    })
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::NotStarted => println!("no active run"),
        MonitorEvent::Active(view) => println!("{view}"),
        MonitorEvent::Finished { run_id, cleanup } => {
            println!("run {run_id} finished");
            if let Some(report) = cleanup {
                print_cleanup(report);
            }
        }
    }
}

fn print_cleanup(report: &CleanupReport) {
    for (name, outcome) in &report.resources {
        match &outcome.error {
            Some(error) => println!("  {name}: {:?} ({error})", outcome.status),
            None => println!("  {name}: {:?}", outcome.status),
        }
    }
    if report.manual_action_required {
        println!(
            "MANUAL ACTION REQUIRED: check instance {} for leftover resources",
            report.instance_id
        );
    }
}

async fn confirm(question: &str) -> anyhow::Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{question} [y/N] ").as_bytes()).await?;
    stdout.flush().await?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
mod tests {
    use ephemera_core::impls::{InMemoryBlobStore, InMemoryProvisioner};

    use super::*;

    fn app_with(blob: Arc<InMemoryBlobStore>) -> App {
        AppBuilder::new()
            .environment("dev")
            .blob_store(blob)
            .compute(Arc::new(InMemoryProvisioner::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn kill_without_an_active_run_fails() {
        let app = app_with(Arc::new(InMemoryBlobStore::new()));
        let command = Commands::Kill {
            force: true,
            reason: "stop".to_string(),
        };

        let ok = run_command(&app, EphemeraConfig::default(), command)
            .await
            .unwrap();

        assert!(!ok);
    }

    #[tokio::test]
    async fn cleanup_with_explicit_ids_removes_unreadable_state() {
        let blob = Arc::new(InMemoryBlobStore::new());
        let app = app_with(blob.clone());
        blob.put(app.store().key(), b"{\"run_id\": ".to_vec())
            .await
            .unwrap();
        let command = Commands::Cleanup {
            run_id: Some("R1".to_string()),
            instance_id: Some("i-gone".to_string()),
        };

        run_command(&app, EphemeraConfig::default(), command)
            .await
            .unwrap();

        assert!(!app.store().exists().await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_without_ids_needs_a_readable_state() {
        let app = app_with(Arc::new(InMemoryBlobStore::new()));
        let command = Commands::Cleanup {
            run_id: None,
            instance_id: None,
        };

        let err = run_command(&app, EphemeraConfig::default(), command)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no run state found"));
    }
}
