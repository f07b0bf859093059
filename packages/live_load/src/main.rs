use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use live_channel::{Action, SessionDriver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

mod checks;
mod config;
mod runner;
mod session;

use crate::checks::RunMetrics;
use crate::config::{FileConfig, Overrides, Profile, Settings};

#[derive(Parser)]
#[command(name = "liveload")]
#[command(about = "Load generator that joins LiveView channels as simulated browsers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML)
    #[arg(long, global = true, default_value = "liveload.toml")]
    config: PathBuf,

    /// Target preset
    #[arg(long, global = true, value_enum)]
    profile: Option<Profile>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run virtual users against the target
    Run(RunArgs),

    /// Fetch the page once and show what a session would send
    Probe(ProbeArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Target host, e.g. localhost:4000
    #[arg(long)]
    host: Option<String>,

    /// Number of concurrent virtual users
    #[arg(long)]
    vus: Option<usize>,

    /// Run length in seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Event messages per session
    #[arg(long)]
    messages: Option<usize>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ProbeArgs {
    /// Target host, e.g. localhost:4000
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let file_config: FileConfig = config::load_config(&cli.config, cli.profile.as_ref())
        .extract()
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    match cli.command {
        Commands::Run(args) => run_command(file_config, args).await,
        Commands::Probe(args) => probe_command(file_config, args).await,
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "liveload=debug,live_channel=debug,info"
    } else {
        "liveload=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

async fn run_command(file_config: FileConfig, args: RunArgs) -> Result<()> {
    let overrides = Overrides {
        host: args.host,
        vus: args.vus,
        duration_secs: args.duration,
        max_messages: args.messages,
    };
    let settings = Settings::from_file(&file_config.with_overrides(&overrides))?;

    let summary = runner::run(Arc::new(settings)).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }

    if !summary.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

async fn probe_command(file_config: FileConfig, args: ProbeArgs) -> Result<()> {
    let overrides = Overrides {
        host: args.host,
        ..Default::default()
    };
    let settings = Settings::from_file(&file_config.with_overrides(&overrides))?;
    let client = runner::http_client()?;
    let metrics = RunMetrics::new();

    let bootstrap = session::fetch_bootstrap(&client, &settings.endpoint, &metrics)
        .await
        .with_context(|| format!("Bootstrap from {} failed", settings.endpoint.http_url()))?;

    let mut driver = SessionDriver::new(
        &bootstrap,
        settings.endpoint.http_url(),
        settings.plan.clone(),
    );
    let join = driver.opened().into_iter().find_map(|action| match action {
        Action::Send(frame) => Some(frame),
        _ => None,
    });

    println!("csrf token:    {}", bootstrap.credentials.csrf_token);
    println!("session token: {}", bootstrap.credentials.session_token);
    println!("static token:  {}", bootstrap.credentials.static_token);
    println!("topic:         {}", bootstrap.topic());
    println!(
        "socket url:    {}",
        settings.endpoint.socket_url(&bootstrap.credentials.csrf_token)
    );
    if let Some(join) = join {
        println!("join frame:    {}", join.encode());
    }
    Ok(())
}
