use anyhow::Context;
use clap::{Parser, Subcommand};
use signal_sync_bot::audit::jsonl::JsonlAuditSink;
use signal_sync_bot::audit::{AuditSink, NoopAuditSink};
use signal_sync_bot::bus::{DataBus, FileBus};
use signal_sync_bot::config::{load_config, Config, ConfigFormat};
use signal_sync_bot::engine::demo::{DemoAlpha, StaticAlpha};
use signal_sync_bot::engine::{AlphaRunner, TaskInput};
use signal_sync_bot::execution::PaperOrderSubsystem;
use signal_sync_bot::gateway::{ExecutionGateway, GatewayConfig};
use signal_sync_bot::metrics::SyncMetrics;
use signal_sync_bot::record::TargetRow;
use signal_sync_bot::scheduler::{Scheduler, SchedulerConfig};
use signal_sync_bot::state::StateStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "signal-sync",
    version,
    about = "Publishes alpha signals to a data bus and applies them through the execution gateway"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, global = true, default_value = "configs/signal-sync.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, global = true, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Override the bus directory defined in the config file.
    #[arg(long, global = true, env = "SIGNAL_SYNC_BUS")]
    bus_path: Option<PathBuf>,
    /// Override the gateway poll interval defined in the config file.
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C or SIGTERM.
    Run,
    /// Publish an externally computed payload as the next version.
    Publish {
        /// JSON array of `{"instrument": .., "target": ..}` rows.
        #[arg(long)]
        rows: PathBuf,
    },
    /// Print the bus head and the latest record.
    Inspect,
    /// Print a sample TOML configuration.
    SampleConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = load_config(&cli.config, cli.config_format)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(path) = &cli.bus_path {
        config.bus.path = path.clone();
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.gateway.poll_interval_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

fn open_bus(config: &Config) -> anyhow::Result<Arc<dyn DataBus>> {
    let bus = FileBus::open(&config.bus.path, config.bus.history_depth)
        .with_context(|| format!("opening bus at {}", config.bus.path.display()))?;
    Ok(Arc::new(bus))
}

fn open_audit(config: &Config) -> anyhow::Result<Arc<dyn AuditSink>> {
    match &config.audit.path {
        Some(path) => Ok(Arc::new(JsonlAuditSink::open(path)?)),
        None => Ok(Arc::new(NoopAuditSink)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Command::SampleConfig => {
            print!("{}", Config::sample().to_toml()?);
            Ok(())
        }
        Command::Run => run(load(&cli)?).await,
        Command::Publish { rows } => publish(load(&cli)?, rows).await,
        Command::Inspect => inspect(&load(&cli)?),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let bus = open_bus(&config)?;
    let audit = open_audit(&config)?;
    let metrics = Arc::new(SyncMetrics::new());

    let orders = Arc::new(PaperOrderSubsystem::new().with_latency(Duration::from_millis(20)));
    let mut gateway = ExecutionGateway::new(Arc::clone(&bus), orders, GatewayConfig::from(&config))
        .with_audit(Arc::clone(&audit))
        .with_metrics(Arc::clone(&metrics));
    if let Some(path) = &config.gateway.state_path {
        gateway = gateway
            .with_store(StateStore::new(path))
            .context("execution state is unusable")?;
    }

    let engine = DemoAlpha::new(config.alpha.universe.clone(), config.alpha.picks);
    let runner = AlphaRunner::new(Arc::new(engine), Arc::clone(&bus), Arc::clone(&audit), Arc::clone(&metrics));
    let scheduler = Scheduler::new(runner, Arc::new(gateway), bus, SchedulerConfig::from(&config)).with_audit(audit);
    scheduler.shutdown_handle().trigger_on_signals();
    scheduler.run().await?;

    for (key, value) in metrics.snapshot_kv() {
        println!("{key}={value}");
    }
    Ok(())
}

async fn publish(config: Config, rows_path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(rows_path)
        .with_context(|| format!("reading {}", rows_path.display()))?;
    let rows: Vec<TargetRow> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", rows_path.display()))?;

    let bus = open_bus(&config)?;
    let audit = open_audit(&config)?;
    let runner = AlphaRunner::new(Arc::new(StaticAlpha(rows)), bus, audit, Arc::new(SyncMetrics::new()));
    let record = runner.run(TaskInput::now()).await?;
    println!("published {} rows={}", record.version, record.payload.len());
    Ok(())
}

fn inspect(config: &Config) -> anyhow::Result<()> {
    let bus = open_bus(config)?;
    let Some(head) = bus.peek_head()? else {
        println!("bus at {} is empty", config.bus.path.display());
        return Ok(());
    };
    println!("head: {}", serde_json::to_string(&head)?);
    match bus.read_latest()? {
        Some(record) => {
            let verdict = match record.validate() {
                Ok(()) => "valid".to_string(),
                Err(err) => format!("INVALID: {err}"),
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            println!("validation: {verdict}");
        }
        None => println!("latest entry vanished after the head probe"),
    }
    Ok(())
}
