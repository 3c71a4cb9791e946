use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cmdqueue::{
    AppContext, CancellationSignal, CommandDecoder, DecodedCommand, DurabilityMode, JobRecord,
    JobState, QueueService, QueueSettings, TypeRegistry, executor_fn,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cmdqueue")]
#[command(about = "Inspect and drain a durable bounded command queue")]
#[command(long_about = "Inspect and drain a durable bounded command queue.\n\n\
A file:// collection belongs to one process at a time. While `run` is \
draining it, other cmdqueue invocations on the same directory fail with \
\"store unavailable\"; stop the consumer before using enqueue, list, stats \
or reset on that collection.")]
struct Cli {
    /// Storage endpoint, file://<dir> or memory://<name>
    #[arg(long, global = true, env = "CMDQUEUE_CONNECTION")]
    connection: Option<String>,

    #[arg(long, global = true, env = "CMDQUEUE_COLLECTION")]
    collection: Option<String>,

    #[arg(long, global = true)]
    max_size_bytes: Option<usize>,

    #[arg(long, global = true)]
    max_documents: Option<usize>,

    #[arg(long, global = true, value_enum)]
    durability: Option<Durability>,

    /// Command names this process accepts, in addition to Noop
    #[arg(long = "command", global = true)]
    commands: Vec<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Append a job
    Enqueue {
        name: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// Print the jobs held by the collection
    List {
        #[arg(long, value_enum)]
        state: Option<StateFilter>,
    },
    Stats,
    /// Drop and recreate the collection
    Reset,
    /// Run the consumer, logging every job, until Ctrl-C
    Run {
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
        #[arg(long)]
        reset_on_start: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Durability {
    Sync,
    Async,
    None,
}

impl From<Durability> for DurabilityMode {
    fn from(value: Durability) -> Self {
        match value {
            Durability::Sync => DurabilityMode::Sync,
            Durability::Async => DurabilityMode::Async,
            Durability::None => DurabilityMode::None,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StateFilter {
    Pending,
    Complete,
    Failed,
}

impl From<StateFilter> for JobState {
    fn from(value: StateFilter) -> Self {
        match value {
            StateFilter::Pending => JobState::Pending,
            StateFilter::Complete => JobState::Complete,
            StateFilter::Failed => JobState::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut settings = base_settings(&cli);
    let mut registry = registry_for(&cli.commands);

    match cli.command {
        CliCommand::Enqueue { name, payload, user, roles } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            registry.register(name.clone(), raw_decoder(&name));
            let queue = QueueService::new(settings, registry).context("Failed to open queue")?;

            let mut context = AppContext::new().request_is_local(true);
            if let Some(user) = user {
                context = context.username(user);
            }
            for role in roles {
                context = context.role(role);
            }

            let position = queue
                .enqueue_payload(&name, payload, &context)
                .await
                .with_context(|| format!("Failed to enqueue '{}'", name))?;
            println!("enqueued {} at position {}", name, position);
        }
        CliCommand::List { state } => {
            let queue = QueueService::new(settings, registry).context("Failed to open queue")?;
            let jobs = match state {
                Some(state) => queue.jobs_in_state(state.into()).await?,
                None => queue.jobs().await?,
            };
            for job in &jobs {
                print_job(job);
            }
            println!("{} job(s)", jobs.len());
        }
        CliCommand::Stats => {
            let queue = QueueService::new(settings, registry).context("Failed to open queue")?;
            let stats = queue.stats().await?;
            let durability = if queue.endpoint().is_durable() { "durable" } else { "in-memory" };
            println!("endpoint:    {} ({})", queue.endpoint(), durability);
            println!("collection:  {}", stats.name);
            println!("records:     {} / {}", stats.record_count, stats.max_documents);
            println!("bytes:       {} / {}", stats.total_bytes, stats.max_size_bytes);
            println!("pending:     {}", stats.pending);
            println!("complete:    {}", stats.complete);
            println!("failed:      {}", stats.failed);
            if let (Some(first), Some(last)) = (stats.first_position, stats.last_position) {
                println!("positions:   {}..={}", first, last);
            }
            println!("collections: {}", queue.collection_names().await.join(", "));
        }
        CliCommand::Reset => {
            let queue = QueueService::new(settings, registry).context("Failed to open queue")?;
            queue.reset().await?;
            println!("collection '{}' reset", queue.settings().collection_name);
        }
        CliCommand::Run { poll_ms, reset_on_start } => {
            settings = settings
                .poll_interval(Duration::from_millis(poll_ms))
                .reset_collection(reset_on_start);
            let queue = QueueService::new(settings, registry).context("Failed to open queue")?;

            let cancel = CancellationSignal::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            let report = queue
                .start_processing(
                    &cancel,
                    executor_fn(|command: DecodedCommand, context: AppContext| async move {
                        let payload = command
                            .downcast_ref::<serde_json::Value>()
                            .map(|p| p.to_string())
                            .unwrap_or_default();
                        event!(
                            Level::INFO,
                            command = %command.name(),
                            user = context.username.as_deref().unwrap_or("-"),
                            payload = %payload,
                            "job executed"
                        );
                        anyhow::Ok(())
                    }),
                )
                .await?;
            println!(
                "executed {} job(s): {} completed, {} failed, {} skipped",
                report.executed, report.completed, report.failed, report.skipped
            );
        }
    }

    Ok(())
}

fn base_settings(cli: &Cli) -> QueueSettings {
    let mut settings = QueueSettings::new();
    if let Some(connection) = &cli.connection {
        settings = settings.connection_string(connection);
    }
    if let Some(collection) = &cli.collection {
        settings = settings.collection_name(collection);
    }
    if let Some(bytes) = cli.max_size_bytes {
        settings = settings.max_size_bytes(bytes);
    }
    if let Some(count) = cli.max_documents {
        settings = settings.max_documents(count);
    }
    if let Some(durability) = cli.durability {
        settings = settings.durability(durability.into());
    }
    settings
}

fn registry_for(names: &[String]) -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    for name in names {
        registry.register(name.clone(), raw_decoder(name));
    }
    registry
}

/// Decoder that keeps the payload as plain JSON.
fn raw_decoder(name: &str) -> CommandDecoder {
    let name = name.to_string();
    Arc::new(move |payload: &serde_json::Value| -> cmdqueue::Result<DecodedCommand> {
        Ok(DecodedCommand::from_parts(name.clone(), Box::new(payload.clone())))
    })
}

fn print_job(job: &JobRecord) {
    let state = match job.state() {
        JobState::Pending => "pending",
        JobState::Complete => "complete",
        JobState::Failed => "failed",
    };
    let mut line = format!(
        "{:>8}  {:<8}  {}  {}",
        job.position,
        state,
        job.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
        job.name
    );
    if job.error().is_set() {
        line.push_str(&format!("  error: {}", job.error().message()));
    }
    println!("{}", line);
}
