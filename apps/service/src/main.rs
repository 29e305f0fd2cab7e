use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use pagewatch::classify::{Protocol, ResourceType, StateType};
use pagewatch::config::Config;
use pagewatch::database::{DEFAULT_HISTORY_LIMIT, LibsqlStore, RequestFilter, ResultSink, TargetStore, open_pool};
use pagewatch::models::{AlertSettings, Target, TargetMode};
use pagewatch::monitoring::CheckReport;
use pagewatch::orchestrator::{NewTarget, Orchestrator, TargetChanges, TargetManager};

#[derive(Parser)]
#[command(name = "pagewatch")]
#[command(version, about = "Monitor URLs, classify the traffic each check triggers and alert on failures")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $XDG_CONFIG_HOME/pagewatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor every active target until Ctrl-C
    Run,

    /// Check a URL once without storing anything
    Check {
        url: String,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Target management
    #[command(subcommand)]
    Targets(TargetCommands),

    /// Recent check results for a target
    Results {
        id: Uuid,

        #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },

    /// Subsequent requests observed for a target
    Requests {
        id: Uuid,

        /// html, js, css, image or other
        #[arg(long)]
        resource_type: Option<ResourceType>,

        /// stateful or stateless
        #[arg(long)]
        state_type: Option<StateType>,

        /// http, https, quic, tcp or udp
        #[arg(long)]
        protocol: Option<Protocol>,

        #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },

    /// Return every target to healthy
    ResetAlerts,

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum TargetCommands {
    /// Start monitoring a URL
    Add {
        url: String,

        #[arg(short, long)]
        name: Option<String>,

        /// Seconds between checks
        #[arg(short, long, default_value_t = 60)]
        interval: u64,

        /// Send down/recovery notifications for this target
        #[arg(long)]
        alerts: bool,

        /// Do not notify when the target comes back up
        #[arg(long)]
        no_recovery_notice: bool,
    },

    /// List all targets
    List,

    /// Change a target
    Update {
        id: Uuid,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        interval: Option<u64>,

        #[arg(long)]
        active: Option<bool>,

        #[arg(long)]
        alerts: Option<bool>,

        #[arg(long)]
        notify_on_recovery: Option<bool>,
    },

    /// Stop monitoring a target and delete its history
    Remove { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logger::init_tracing();

    let cli = Cli::parse();
    let config = Config::from_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            let mut orchestrator = Orchestrator::start(config).await?;
            orchestrator.run().await?;
        }

        Commands::Check { url, json } => {
            let report = Orchestrator::detached(config)?.check_once(&url).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }

        Commands::Targets(command) => {
            let manager = TargetManager::new(store(&config).await?, config.scheduler.min_check_interval_seconds);
            handle_target_command(command, &manager).await?;
        }

        Commands::Results { id, limit } => {
            let results = store(&config).await?.recent_results(id, limit).await?;
            if results.is_empty() {
                println!("No results for {id}");
            }
            for result in results {
                println!(
                    "{}  {:<4}  {:>3}  {:>6}ms  {}",
                    result.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    result.status,
                    result.status_code.map_or_else(|| "-".to_string(), |code| code.to_string()),
                    result.response_time_ms,
                    result.error_message.unwrap_or_default()
                );
            }
        }

        Commands::Requests { id, resource_type, state_type, protocol, limit } => {
            let filter = RequestFilter { resource_type, state_type, protocol, limit };
            let requests = store(&config).await?.subsequent_requests(id, &filter).await?;
            if requests.is_empty() {
                println!("No subsequent requests for {id}");
            }
            for request in requests {
                println!(
                    "{}  {:<5}  {:<9}  {:<5}  {:<15}  {}",
                    request.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    request.resource_type,
                    request.state_type,
                    request.protocol,
                    request.ip.map_or_else(|| "-".to_string(), |ip| ip.to_string()),
                    request.url
                );
            }
        }

        Commands::ResetAlerts => {
            let reset = store(&config).await?.reset_alert_states().await?;
            println!("Reset {reset} alerting target(s) to healthy");
        }

        Commands::Config => {
            println!("{config}");
        }
    }

    Ok(())
}

async fn store(config: &Config) -> Result<Arc<LibsqlStore>> {
    let pool = open_pool(&config.database.path).await?;
    Ok(Arc::new(LibsqlStore::new_from_pool(pool)))
}

async fn handle_target_command(command: TargetCommands, manager: &TargetManager) -> Result<()> {
    match command {
        TargetCommands::Add { url, name, interval, alerts, no_recovery_notice } => {
            let target = manager
                .add(NewTarget {
                    url,
                    name,
                    interval_seconds: interval,
                    alerts: AlertSettings { enabled: alerts, notify_on_recovery: !no_recovery_notice },
                })
                .await?;
            println!("Added {}", target.id);
            print_target(&target);
        }

        TargetCommands::List => {
            let targets = manager.list().await?;
            if targets.is_empty() {
                println!("No targets configured");
            }
            for target in &targets {
                print_target(target);
            }
        }

        TargetCommands::Update { id, name, interval, active, alerts, notify_on_recovery } => {
            let changes = TargetChanges {
                name,
                interval_seconds: interval,
                active,
                alerts_enabled: alerts,
                notify_on_recovery,
            };
            let target = manager.update(id, changes).await?;
            info!(target_id = %target.id, "Changes apply to the running service on its next reload");
            print_target(&target);
        }

        TargetCommands::Remove { id } => {
            if !manager.remove(id).await? {
                bail!("Target {id} not found");
            }
            println!("Removed {id}");
        }
    }
    Ok(())
}

fn print_target(target: &Target) {
    let schedule = match target.mode {
        TargetMode::Recurring { interval_seconds } => format!("every {interval_seconds}s"),
        TargetMode::OneTime => "once".to_string(),
    };
    println!(
        "{}  {:<8}  {:<12}  alerts={:<5}  {}  ({})",
        target.id,
        if target.active { "active" } else { "inactive" },
        schedule,
        target.alerts.enabled,
        target.url,
        target.name
    );
}

fn print_report(report: &CheckReport) {
    let result = &report.result;
    println!("{} is {}", result.target, result.status);
    if let Some(code) = result.status_code {
        println!("  status code:   {code}");
    }
    println!("  response time: {}ms", result.response_time_ms);
    if let Some(error) = &result.error_message {
        println!("  error:         {error}");
    }

    println!("  subsequent requests: {}", report.subsequent_requests.len());
    for request in &report.subsequent_requests {
        println!("    {:<5}  {:<9}  {:<5}  {}", request.resource_type, request.state_type, request.protocol, request.url);
    }
}
