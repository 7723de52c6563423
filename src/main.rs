use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use isx_pulse::broadcast::ChannelBroadcaster;
use isx_pulse::config::AppConfig;
use isx_pulse::license::{HttpIssuerClient, LicenseManager, LicenseStore};
use isx_pulse::operation::{OperationMode, OperationRequest};
use isx_pulse::orchestrator::{ExecutionMode, Orchestrator};
use isx_pulse::registry::StepRegistry;
use isx_pulse::server::{AppState, start_server};
use isx_pulse::steps;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "isx-pulse")]
#[command(version, about = "Iraq Stock Exchange data pipeline")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file (defaults to ./isx-pulse.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket control plane
    Serve {
        /// Listen address, overriding the configured one
        #[arg(long)]
        addr: Option<String>,
        /// Out-of-band license handoff blob honored for this process
        #[arg(long)]
        license_state: Option<PathBuf>,
    },
    /// Run one pipeline operation and exit
    Run {
        /// initial or accumulative
        #[arg(long, default_value = "initial")]
        mode: String,
        /// Range start, YYYY-MM-DD
        #[arg(long)]
        from: String,
        /// Range end, YYYY-MM-DD
        #[arg(long)]
        to: String,
        /// Run independent steps concurrently
        #[arg(long)]
        parallel: bool,
        /// Out-of-band license handoff blob honored for this process
        #[arg(long)]
        license_state: Option<PathBuf>,
    },
    /// List the step catalog in execution order
    Steps,
    /// License management
    License {
        #[command(subcommand)]
        command: LicenseCommands,
    },
}

#[derive(Subcommand)]
enum LicenseCommands {
    /// Activate a license key on this machine
    Activate {
        key: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Show the current license state
    Status,
    /// Stack a new key onto the current license
    Stack { key: String },
}

fn init_tracing(
    verbose: bool,
    log_dir: &std::path::Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if verbose { "isx_pulse=debug,info" } else { "info" })
        });
    let file_appender = tracing_appender::rolling::daily(log_dir, "isx-pulse.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}

fn build_license_manager(config: &AppConfig) -> Arc<LicenseManager> {
    let store = LicenseStore::new(config.license_file(), config.license_secret());
    let issuer = Arc::new(HttpIssuerClient::new(
        config.issuer_url.clone(),
        config.license_secret(),
    ));
    Arc::new(LicenseManager::with_policy(
        store,
        issuer,
        config.grace(),
        isx_pulse::license::DEFAULT_CACHE_TTL,
    ))
}

fn build_orchestrator(
    config: &AppConfig,
    license: Arc<LicenseManager>,
    broadcaster: ChannelBroadcaster,
) -> Result<Arc<Orchestrator>> {
    let orchestrator = Arc::new(Orchestrator::new(
        license,
        Arc::new(broadcaster),
        config.orchestrator.clone(),
    ));
    steps::register_catalog(
        &orchestrator,
        config.downloads_dir(),
        config.reports_dir(),
    )
    .context("failed to register step catalog")?;
    Ok(orchestrator)
}

fn parse_mode(mode: &str) -> Result<OperationMode> {
    match mode {
        "initial" => Ok(OperationMode::Initial),
        "accumulative" => Ok(OperationMode::Accumulative),
        other => bail!("unknown mode '{other}', expected initial or accumulative"),
    }
}

fn parse_date(value: &str, flag: &str) -> Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("--{flag} must be YYYY-MM-DD, got '{value}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    config.ensure_directories()?;
    let _log_guard = init_tracing(cli.verbose, &config.log_dir())?;

    match cli.command {
        Commands::Serve {
            addr,
            license_state,
        } => {
            let license = build_license_manager(&config);
            if let Some(path) = license_state {
                let info = license.validate_state_file(&path).await?;
                println!("license handoff accepted, expires {}", info.expiry_at);
            }
            let broadcaster = ChannelBroadcaster::new(256);
            let orchestrator =
                build_orchestrator(&config, license.clone(), broadcaster.clone())?;
            let state = Arc::new(AppState {
                orchestrator,
                license,
                broadcaster,
            });
            let addr = addr.unwrap_or_else(|| config.server_addr.clone());
            start_server(&addr, state).await
        }

        Commands::Run {
            mode,
            from,
            to,
            parallel,
            license_state,
        } => {
            let license = build_license_manager(&config);
            if let Some(path) = license_state {
                license.validate_state_file(&path).await?;
            }
            let mut app_config = config.clone();
            if parallel {
                app_config.orchestrator.execution_mode = ExecutionMode::ParallelByDependency;
            }
            let broadcaster = ChannelBroadcaster::new(256);
            let orchestrator = build_orchestrator(&app_config, license, broadcaster)?;

            let request = OperationRequest::new(
                parse_mode(&mode)?,
                parse_date(&from, "from")?,
                parse_date(&to, "to")?,
            );
            let response = orchestrator.execute(request).await?;
            println!("operation {} finished: {:?}", response.id, response.status);
            for step in &response.steps {
                println!(
                    "  {:<12} {:<10} {:>5.1}%  {}",
                    step.id,
                    step.status.as_str(),
                    step.progress,
                    step.error.as_deref().unwrap_or(&step.message),
                );
            }
            if response.summary.failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Steps => {
            let mut registry = StepRegistry::new();
            registry.register(Arc::new(steps::ScrapeStep::new(config.downloads_dir())))?;
            registry.register(Arc::new(steps::ProcessStep::new(
                config.downloads_dir(),
                config.reports_dir(),
            )))?;
            registry.register(Arc::new(steps::IndicesStep::new(config.reports_dir())))?;
            registry.register(Arc::new(steps::LiquidityStep::new(config.reports_dir())))?;

            for step in registry.dependency_order()? {
                let deps = step.dependencies();
                let deps = if deps.is_empty() {
                    "-".to_string()
                } else {
                    deps.join(", ")
                };
                println!("{:<12} {:<28} depends on: {}", step.id(), step.name(), deps);
            }
            Ok(())
        }

        Commands::License { command } => {
            let license = build_license_manager(&config);
            match command {
                LicenseCommands::Activate { key, email } => {
                    let info = license.activate(&key, email.as_deref()).await?;
                    println!(
                        "license activated: {} ({}), expires {}",
                        info.license_key_masked,
                        info.duration.as_str(),
                        info.expiry_at
                    );
                }
                LicenseCommands::Status => {
                    let validation = license.validate().await;
                    match validation.info {
                        Some(info) => {
                            println!(
                                "license {}: {:?}, expires {} ({} days remaining{})",
                                info.license_key_masked,
                                info.status,
                                info.expiry_at,
                                info.days_remaining,
                                if info.in_grace { ", in grace" } else { "" },
                            );
                        }
                        None => {
                            println!(
                                "no valid license: {}",
                                validation
                                    .reason
                                    .unwrap_or_else(|| "unknown reason".to_string())
                            );
                        }
                    }
                }
                LicenseCommands::Stack { key } => {
                    let info = license.stack(&key).await?;
                    println!(
                        "license stacked: {} now expires {}",
                        info.license_key_masked, info.expiry_at
                    );
                }
            }
            Ok(())
        }
    }
}
