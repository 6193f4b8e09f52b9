//! hearth-acquire: command-line entry point.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;

use hearth_acquire::orchestrator::progress::ProgressEventKind;
use hearth_acquire::{
    resolve_config_path, AcquireConfig, AssetKey, AssetOrchestrator, Catalog, Identity,
    SessionGateway, Variant,
};

#[derive(Parser)]
#[command(
    name = "hearth-acquire",
    about = "Resilient acquisition of challenge-protected data and card art",
    version
)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the prioritized art sweep over a catalog file.
    Sweep {
        /// Catalog JSON ({"cards": [{"id", "revision", "variants", "owned"}]}).
        #[arg(long)]
        catalog: PathBuf,
    },

    /// Fetch one asset into the cache.
    Fetch {
        /// Card id, e.g. EX1_001.
        id: String,
        /// Variant (normal, golden, diamond, signature).
        variant: Variant,
    },

    /// Clear miss markers for catalog entries that changed between two files.
    Invalidate {
        #[arg(long)]
        old: PathBuf,
        #[arg(long)]
        new: PathBuf,
    },

    /// Count hits and misses in the cache directory.
    CacheStats,

    /// Solve the challenge once and print the clearance status.
    GatewayStatus,

    /// Fetch a protected URL as the identity described in a JSON file.
    GatewayFetch {
        /// Identity JSON ({"name", "cookies": [...]}).
        #[arg(long)]
        identity: PathBuf,
        url: String,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   hearth-acquire completions bash > ~/.local/share/bash-completion/completions/hearth-acquire
    ///   hearth-acquire completions zsh > ~/.zfunc/_hearth-acquire
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = resolve_config_path(cli.config.as_deref());
    let load_config = || -> anyhow::Result<AcquireConfig> {
        tracing::debug!("Config: {}", config_path.display());
        AcquireConfig::load(&config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))
    };

    match cli.command {
        Commands::Sweep { catalog } => {
            let catalog = read_json::<Catalog>(&catalog)?;
            let orchestrator = AssetOrchestrator::new(load_config()?.orchestrator)?;

            let mut events = orchestrator.subscribe();
            let logger = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event.event {
                        ProgressEventKind::PhaseStarted { phase, pending } => {
                            eprintln!("[{phase}] {pending} assets pending");
                        }
                        ProgressEventKind::PhaseCompleted {
                            phase,
                            fetched,
                            not_found,
                            unresolved,
                            duration_ms,
                        } => {
                            eprintln!(
                                "[{phase}] fetched {fetched}, missing {not_found}, unresolved {unresolved} ({duration_ms} ms)"
                            );
                        }
                        ProgressEventKind::SweepComplete { .. } => break,
                        _ => {}
                    }
                }
            });

            let report = orchestrator.run_prioritized_sweep(&catalog).await;
            logger.abort();
            let report = report.context("sweep failed")?;

            if cli.json {
                print_json(&report)?;
            } else {
                for phase in &report.phases {
                    if phase.skipped {
                        println!("{:<16} skipped", phase.name);
                    } else {
                        println!(
                            "{:<16} fetched {:>5}  missing {:>5}  unresolved {:>5}  rounds {}",
                            phase.name, phase.fetched, phase.not_found, phase.unresolved, phase.rounds
                        );
                    }
                }
                println!(
                    "Total: fetched {}, missing {}, unresolved {} in {} ms",
                    report.fetched, report.not_found, report.unresolved, report.elapsed_ms
                );
            }
        }

        Commands::Fetch { id, variant } => {
            let orchestrator = AssetOrchestrator::new(load_config()?.orchestrator)?;
            let key = AssetKey::new(id, variant);
            let mut bytes = orchestrator.fetch_asset(&key).await?;
            if bytes.is_none() && orchestrator.background_retries() > 0 {
                eprintln!("Transient failure, retrying {} in the background...", key.cache_key());
                orchestrator.wait_for_background().await;
                bytes = orchestrator.cache().read(&key.cache_key()).await?;
            }
            let path = orchestrator.cache().hit_path(&key.cache_key())?;

            #[derive(Serialize)]
            struct FetchOutput {
                key: String,
                path: Option<PathBuf>,
                bytes: Option<usize>,
            }
            let output = FetchOutput {
                key: key.cache_key(),
                path: bytes.as_ref().map(|_| path.clone()),
                bytes: bytes.as_ref().map(|b| b.len()),
            };

            if cli.json {
                print_json(&output)?;
            } else {
                match bytes {
                    Some(b) => println!("{} ({} bytes)", path.display(), b.len()),
                    None => println!("absent"),
                }
            }
            orchestrator.shutdown();
        }

        Commands::Invalidate { old, new } => {
            let old = read_json::<Catalog>(&old)?;
            let new = read_json::<Catalog>(&new)?;
            let orchestrator = AssetOrchestrator::new(load_config()?.orchestrator)?;
            let cleared = orchestrator.invalidate_changed(&old, &new).await?;

            if cli.json {
                print_json(&cleared.iter().map(AssetKey::cache_key).collect::<Vec<_>>())?;
            } else {
                println!("Cleared {} miss markers", cleared.len());
                for key in &cleared {
                    println!("  {}", key.cache_key());
                }
            }
        }

        Commands::CacheStats => {
            let orchestrator = AssetOrchestrator::new(load_config()?.orchestrator)?;
            let stats = orchestrator.cache().stats().await?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("Cache: {}", orchestrator.cache().dir().display());
                println!("  Hits:   {} ({} bytes)", stats.hits, stats.hit_bytes);
                println!("  Misses: {}", stats.misses);
            }
        }

        Commands::GatewayStatus => {
            let gateway = SessionGateway::chromium(load_config()?.gateway)?;
            let result = gateway.ensure_ready().await;
            let status = gateway.status();
            gateway.shutdown().await;
            result.context("challenge solve failed")?;

            if cli.json {
                print_json(&status)?;
            } else {
                println!("Clearance valid: {}", status.valid);
                println!("  Expires in: {}s", status.expires_in_seconds);
            }
        }

        Commands::GatewayFetch { identity, url } => {
            let identity = read_json::<Identity>(&identity)?;
            let gateway = SessionGateway::chromium(load_config()?.gateway)?;
            let result = gateway.fetch_as(&identity, &url).await;
            gateway.shutdown().await;
            let response = result.with_context(|| format!("fetching {url}"))?;

            if cli.json {
                print_json(&response)?;
            } else {
                if !response.is_success() {
                    eprintln!("Status: {}", response.status);
                }
                println!("{}", response.body);
            }
            if matches!(response.status, 401 | 403) {
                bail!("identity {} was rejected ({})", identity.name, response.status);
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "hearth-acquire", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
