/// ntables - run, inspect and debug replicated tables from the command line
///
/// Usage:
///   ntables run --config <file>        - Run the role described by a config file
///   ntables serve [--port N]           - Run a server with persistence
///   ntables connect <host>             - Run a client and report link changes
///   ntables watch <host> [-p /prefix]  - Print value updates from a server
///   ntables dump <file>                - Print a persistence file
///   ntables check-config <file>        - Validate a config file
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use nettables::config::team_address;
use nettables::persistence;
use nettables::{
    AppConfig, DEFAULT_PORT, Event, EventData, EventKind, EventMask, Instance, ListenerSource,
    NetworkConfig, PublisherHandle, Role, TopicSeed,
};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// ntables - replicated key-value tables
///
/// Typed topics shared between one server and any number of clients.
#[derive(Parser)]
#[command(name = "ntables")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the role described by a config file until Ctrl-C
    ///
    /// Example:
    ///   ntables run --config robot.json
    Run {
        /// Path to the JSON config file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run a server, saving persistent topics to a file
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Persistence file (default: <data dir>/nettables/networktables.json)
        #[arg(long)]
        persist: Option<PathBuf>,

        /// Seconds between autosaves
        #[arg(long, default_value_t = 1)]
        autosave: u64,
    },

    /// Connect to a server and report connection changes
    Connect {
        /// Server host name or address
        #[arg(conflicts_with = "team")]
        host: Option<String>,

        /// Team number, resolved to 10.TE.AM.2
        #[arg(short, long)]
        team: Option<u16>,

        /// Server port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },

    /// Connect to a server and print value updates
    ///
    /// Example:
    ///   ntables watch 10.2.54.2 -p /SmartDashboard/
    Watch {
        /// Server host name or address
        #[arg(conflicts_with = "team")]
        host: Option<String>,

        /// Team number, resolved to 10.TE.AM.2
        #[arg(short, long)]
        team: Option<u16>,

        /// Server port
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Topic name prefixes to watch (repeatable; default: everything)
        #[arg(short = 'p', long = "prefix")]
        prefixes: Vec<String>,
    },

    /// Print the topics stored in a persistence file
    Dump {
        /// Persistence file to read
        file: PathBuf,
    },

    /// Validate a config file without running it
    #[command(name = "check-config")]
    CheckConfig {
        /// Config file to validate
        file: PathBuf,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "nettables=info,ntables=info",
        1 => "nettables=debug,ntables=debug",
        _ => "nettables=trace,ntables=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default persistence file path.
fn default_persist_path() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nettables")
        .join("networktables.json")
}

fn resolve_server(host: Option<String>, team: Option<u16>, port: u16) -> Result<SocketAddr> {
    let host = match (host, team) {
        (Some(host), _) => host,
        (None, Some(team)) => team_address(team),
        (None, None) => "127.0.0.1".to_string(),
    };
    (host.as_str(), port)
        .to_socket_addrs()
        .with_context(|| format!("Cannot resolve server address: {}", host))?
        .next()
        .with_context(|| format!("No address for {}", host))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run { config } => run_config(&config).await,
        Commands::Serve {
            port,
            bind,
            persist,
            autosave,
        } => {
            let persist = persist.unwrap_or_else(default_persist_path);
            let network = NetworkConfig::new().listen_addr(SocketAddr::new(bind, port));
            run_server(network, persist, Duration::from_secs(autosave.max(1)), &[]).await
        }
        Commands::Connect { host, team, port } => {
            let server = resolve_server(host, team, port)?;
            let network = NetworkConfig::new().server_addr(server).identity("ntables-connect");
            run_client(network, &[], Some(Vec::new())).await
        }
        Commands::Watch {
            host,
            team,
            port,
            prefixes,
        } => {
            let server = resolve_server(host, team, port)?;
            let network = NetworkConfig::new().server_addr(server).identity("ntables-watch");
            let prefixes = if prefixes.is_empty() {
                vec!["/".to_string()]
            } else {
                prefixes
            };
            run_client(network, &[], Some(prefixes)).await
        }
        Commands::Dump { file } => dump(&file),
        Commands::CheckConfig { file } => check_config(&file),
    }
}

// ============================================================================
// Running
// ============================================================================

async fn run_config(path: &Path) -> Result<()> {
    let config = AppConfig::load(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    let network = config.network_config();
    match config.role {
        Role::Server => {
            let persist = config
                .persist_file
                .clone()
                .unwrap_or_else(default_persist_path);
            let period = config
                .autosave_interval()
                .unwrap_or(Duration::from_secs(1));
            run_server(network, persist, period, &config.topics).await
        }
        Role::Client => {
            let server = config.server_addr().context("Failed to resolve server")?;
            run_client(network.server_addr(server), &config.topics, None).await
        }
    }
}

/// Publish the configured topics. Restored values are not overwritten.
fn publish_seeds(nt: &Instance, seeds: &[TopicSeed]) -> Result<Vec<PublisherHandle>> {
    let mut publishers = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let topic = nt.topic(&seed.name);
        let publisher = nt
            .publish(topic, seed.kind, seed.properties.clone())
            .with_context(|| format!("Failed to publish {}", seed.name))?;
        if let Some(value) = seed.initial_value()? {
            if nt.value(topic)?.is_empty() {
                nt.set(publisher, value)
                    .with_context(|| format!("Failed to set {}", seed.name))?;
            }
        }
        publishers.push(publisher);
    }
    Ok(publishers)
}

async fn run_server(
    network: NetworkConfig,
    persist: PathBuf,
    autosave: Duration,
    seeds: &[TopicSeed],
) -> Result<()> {
    let nt = Instance::create().context("Failed to create instance")?;

    if persist.exists() {
        let report = nt
            .load_persistent(&persist)
            .await
            .with_context(|| format!("Failed to load {}", persist.display()))?;
        println!(
            "{} {} persistent topics from {}",
            "Loaded".green().bold(),
            report.loaded,
            persist.display().to_string().cyan()
        );
        for error in &report.errors {
            eprintln!("  {} {}", "skipped".yellow(), error);
        }
    }

    let _publishers = publish_seeds(&nt, seeds)?;

    let addr = nt
        .start_server(network)
        .await
        .context("Failed to start server")?;
    nt.start_autosave(persist.clone(), autosave)?;

    println!("{}", "Server started".green().bold());
    println!("  Listening: {}", addr.to_string().cyan());
    println!("  Persisting: {}", persist.display().to_string().bright_black());
    println!();
    println!("{}", "Press Ctrl-C to stop".bright_black());

    print_connection_events(&nt)?;
    signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    println!();
    println!("{}", "Shutting down...".yellow());
    nt.stop_network().await;
    nt.stop_autosave().await;
    let saved = nt
        .save_persistent(&persist)
        .await
        .context("Failed to save persistent topics")?;
    println!("  Saved {} persistent topics", saved);
    nt.destroy();
    Ok(())
}

/// Run a client. With `watch` set, value updates under those prefixes are
/// printed; an empty list only reports connection changes.
async fn run_client(
    network: NetworkConfig,
    seeds: &[TopicSeed],
    watch: Option<Vec<String>>,
) -> Result<()> {
    let nt = Instance::create().context("Failed to create instance")?;
    let server = network.server_addr;
    let _publishers = publish_seeds(&nt, seeds)?;

    print_connection_events(&nt)?;
    if let Some(prefixes) = watch.filter(|p| !p.is_empty()) {
        nt.add_listener(
            ListenerSource::Prefixes(prefixes),
            EventMask::VALUE_ALL | EventMask::PUBLISH | EventMask::UNPUBLISH | EventMask::IMMEDIATE,
            print_topic_event,
        )?;
    }

    nt.start_client(network)
        .await
        .context("Failed to start client")?;
    println!(
        "{} {}",
        "Connecting to".green().bold(),
        server.to_string().cyan()
    );
    println!("{}", "Press Ctrl-C to stop".bright_black());

    signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    nt.stop_network().await;
    nt.destroy();
    Ok(())
}

fn print_connection_events(nt: &Instance) -> Result<()> {
    nt.add_listener(ListenerSource::Connections, EventMask::CONNECTION, |event| {
        let Some(info) = event.connection() else {
            return;
        };
        let peer = info
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "?".to_string());
        match event.kind {
            EventKind::Connected => {
                println!("{} {} ({})", "connected".green(), info.remote_id.cyan(), peer)
            }
            _ => println!(
                "{} {} ({})",
                "disconnected".red(),
                info.remote_id.cyan(),
                peer
            ),
        }
    })?;
    Ok(())
}

fn print_topic_event(event: &Event) {
    match &event.data {
        EventData::Value(update) => println!(
            "{} = {} {}",
            update.name.cyan(),
            update.value.to_json(),
            format!("@{}", update.value.time()).bright_black()
        ),
        EventData::Topic(topic) => {
            let label = if event.kind == EventKind::Publish {
                "announced".green()
            } else {
                "unannounced".yellow()
            };
            println!(
                "{} {} {}",
                label,
                topic.name.cyan(),
                topic.kind.to_string().bright_black()
            );
        }
        EventData::Connection(_) => {}
    }
}

// ============================================================================
// Inspection
// ============================================================================

fn dump(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let (records, errors) = persistence::parse(&text);

    for (_, record) in &records {
        println!(
            "{} {} = {}",
            record.name.cyan(),
            format!("({})", record.kind).bright_black(),
            record.value
        );
        if !record.properties.is_empty() {
            println!(
                "    {}",
                serde_json::Value::Object(record.properties.clone())
                    .to_string()
                    .bright_black()
            );
        }
    }
    println!();
    println!("  {} topics", records.len());

    if !errors.is_empty() {
        for error in &errors {
            eprintln!("  {} {}", "invalid".red(), error);
        }
        anyhow::bail!("{} invalid lines in {}", errors.len(), file.display());
    }
    Ok(())
}

fn check_config(file: &Path) -> Result<()> {
    let config = AppConfig::load(file)
        .with_context(|| format!("Invalid config {}", file.display()))?;

    println!("{}", "OK".green().bold());
    println!("  Role: {}", config.role.to_string().cyan());
    match config.role {
        Role::Server => {
            let network = config.network_config();
            println!("  Listen: {}", network.listen_addr);
        }
        Role::Client => {
            if let Some(host) = config.server_host() {
                println!("  Server: {}:{}", host, config.port);
            }
        }
    }
    println!("  Identity: {}", config.identity);
    println!("  Topics: {}", config.topics.len());
    Ok(())
}
