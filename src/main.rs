use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::{Env, Target};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn, LevelFilter};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image_analyzer::config::{Config, LogConfig};
use image_analyzer::progress::RelayDisplay;
use image_analyzer::server::{self, AppState};
use image_analyzer::sources::{RegistrySource, TrustPolicy};
use image_analyzer::{AnySource, CancelSource, ImagePuller, OutputFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        short = 'f',
        long = "config",
        global = true,
        default_value = "config.yaml",
        help = "Configuration file (YAML); defaults apply when it does not exist"
    )]
    config: PathBuf,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull an image, inspect its filesystem and write a report
    Analyze(AnalyzeArgs),
    /// Serve analyses over HTTP
    Server(ServerArgs),
}

#[derive(Args)]
struct AnalyzeArgs {
    #[arg(help = "Image reference (e.g., ubuntu:latest, or oci:<dir> for an OCI layout)")]
    image: String,

    #[arg(short, long, default_value = "report.json", help = "Report file path")]
    output: PathBuf,

    #[arg(long, value_enum, default_value = "json", help = "Report format")]
    format: OutputFormat,

    #[arg(long, help = "Read os-release [default: from config]")]
    check_os: Option<bool>,

    #[arg(long, help = "List Python packages [default: from config]")]
    check_python: Option<bool>,

    #[arg(long, help = "Look for common tools [default: from config]")]
    check_tools: Option<bool>,

    #[arg(long, value_delimiter = ',', help = "Extra commands to look for (comma separated)")]
    commands: Vec<String>,

    #[arg(long, help = "Pull deadline in seconds, 0 for none [default: from config]")]
    timeout: Option<u64>,

    #[arg(long, help = "Directory that holds temporary workspaces [default: from config]")]
    unpack_dir: Option<PathBuf>,

    #[arg(long, help = "Create symlinks and hardlinks found in layers")]
    materialize_links: bool,

    #[arg(long, help = "Skip digest checks and accept invalid registry certificates")]
    insecure: bool,
}

#[derive(Args)]
struct ServerArgs {
    #[arg(long, help = "Listen host [default: from config]")]
    host: Option<String>,

    #[arg(long, help = "Listen port [default: from config]")]
    port: Option<u16>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let interactive = matches!(cli.command, Command::Analyze(_)) && cli.verbose == 0;
    let fallback = if interactive {
        LevelFilter::Warn
    } else {
        config.log.level_filter()
    };
    init_logging(cli.verbose, fallback, &config.log)?;
    debug!("Loaded configuration from {}", cli.config.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    match cli.command {
        Command::Analyze(args) => runtime.block_on(run_analyze(args, config, interactive)),
        Command::Server(args) => runtime.block_on(run_server(args, config)),
    }
}

/// `RUST_LOG` beats `-v`, which beats the configured level.
fn init_logging(verbose: u8, fallback: LevelFilter, config: &LogConfig) -> Result<()> {
    let log_level = match verbose {
        0 => fallback,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level);
    builder.parse_env(Env::default());

    if let Some(path) = &config.file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn spinner() -> Result<ProgressBar> {
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .context("Invalid spinner template")?;
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(style);
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

async fn run_analyze(args: AnalyzeArgs, config: Config, interactive: bool) -> Result<()> {
    let mut analyze = config.analyze;
    if let Some(check) = args.check_os {
        analyze.check_os_info = check;
    }
    if let Some(check) = args.check_python {
        analyze.check_python_packages = check;
    }
    if let Some(check) = args.check_tools {
        analyze.check_common_tools = check;
    }
    if !args.commands.is_empty() {
        analyze.specific_commands = args.commands.clone();
    }
    if let Some(secs) = args.timeout {
        analyze.timeout_secs = secs;
    }
    if args.unpack_dir.is_some() {
        analyze.unpack_dir = args.unpack_dir.clone();
    }
    analyze.materialize_links |= args.materialize_links;

    let mut registry = config.registry;
    if args.insecure {
        registry.trust = TrustPolicy::AcceptAnything;
    }

    let bar = if interactive { Some(spinner()?) } else { None };
    let mut settings = analyze.puller_settings();
    if let Some(bar) = &bar {
        bar.set_message(format!("Pulling {}", args.image));
        settings.relay.display = RelayDisplay::Spinner(bar.clone());
    }

    info!("Starting analysis of image: {}", args.image);
    let puller = ImagePuller::new(
        AnySource::new(registry.options()),
        analyze.workspace_manager(),
        settings,
    );
    let options = analyze.options();
    let interrupt = CancelSource::new();
    let token = interrupt.token();

    let analysis = puller.analyze(&args.image, &options, &token);
    tokio::pin!(analysis);
    let outcome = tokio::select! {
        outcome = &mut analysis => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cleaning up");
            interrupt.cancel();
            analysis.await
        }
    };

    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }
    let report = outcome.with_context(|| format!("Failed to analyze image '{}'", args.image))?;

    let rendered = report.render(args.format)?;
    write_report(&args.output, &rendered)?;
    info!("Analysis report saved file={}", args.output.display());
    if interactive {
        println!("Report written to {}", args.output.display());
    }
    Ok(())
}

fn write_report(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(path, contents)
        .with_context(|| format!("Failed to write report: {}", path.display()))
}

async fn run_server(args: ServerArgs, config: Config) -> Result<()> {
    let mut server_config = config.server;
    if let Some(host) = args.host {
        server_config.host = host;
    }
    if let Some(port) = args.port {
        server_config.port = port;
    }

    let shutdown_source = CancelSource::new();
    let state = Arc::new(AppState {
        puller: ImagePuller::new(
            RegistrySource::new(config.registry.options()),
            config.analyze.workspace_manager(),
            config.analyze.puller_settings(),
        ),
        defaults: config.analyze.options(),
        max_request_size: server_config.max_request_size,
        cancel: shutdown_source.token(),
    });

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested, cancelling in-flight pulls");
        shutdown_source.cancel();
    };

    server::serve(server_config.address(), state, shutdown).await
}
