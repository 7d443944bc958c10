//! mediaresolve CLI
//!
//! Manage learned filename patterns and inspect resolution settings.
//!
//! ```bash
//! mediaresolve learn "[Grp] Title - 01.mkv" tmdb:100
//! mediaresolve match "[Grp] Title - 27.mkv"
//! mediaresolve patterns --json
//! mediaresolve check-config mediaresolve.yaml
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mediaresolve_core::patterns::extract;
use mediaresolve_core::FilenameMapping;
use mediaresolve_runtime::{InMemoryPatternStore, PatternLearner, RuntimeConfig};

#[derive(Parser)]
#[command(name = "mediaresolve")]
#[command(about = "Media metadata resolution: learned patterns and resilience settings")]
#[command(version)]
struct Cli {
    /// Learned pattern file (JSON)
    #[arg(long, global = true, default_value = "patterns.json")]
    store: PathBuf,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the group, title and regex extracted from a filename
    Extract { filename: String },

    /// Learn that a filename belongs to a metadata id
    Learn { filename: String, metadata_id: String },

    /// Learn a title-only mapping from an edited title
    LearnTitle { title: String, metadata_id: String },

    /// Find the learned mapping for a filename
    Match { filename: String },

    /// Delete a learned mapping by id
    Forget { id: String },

    /// List learned mappings, most used first
    Patterns,

    /// Print the retry backoff schedule
    Backoff {
        /// Config file to read the policy from
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = 4)]
        attempts: u32,
    },

    /// Validate a config file and print the effective settings
    CheckConfig { path: PathBuf },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "mediaresolve=debug" } else { "mediaresolve=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mediaresolve error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Extract { filename } => {
            let extracted = extract(&filename);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&extracted)?);
            } else {
                println!("group: {}", extracted.group.as_deref().unwrap_or("-"));
                println!("title: {}", extracted.title);
                println!("regex: {}", extracted.regex.as_deref().unwrap_or("-"));
            }
        }

        Commands::Learn { filename, metadata_id } => {
            let (store, learner) = open_store(&cli.store).await?;
            let mapping = learner
                .learn_from_correction(&filename, &metadata_id)
                .await
                .context("Failed to learn pattern")?;
            save_store(&store, &cli.store).await?;
            print_mapping(&mapping, cli.json)?;
        }

        Commands::LearnTitle { title, metadata_id } => {
            let (store, learner) = open_store(&cli.store).await?;
            let mapping = learner
                .learn_title(&title, &metadata_id)
                .await
                .context("Failed to learn title")?;
            save_store(&store, &cli.store).await?;
            print_mapping(&mapping, cli.json)?;
        }

        Commands::Match { filename } => {
            let (_, learner) = open_store(&cli.store).await?;
            match learner.find_matching_pattern(&filename).await? {
                Some(hit) if cli.json => println!("{}", serde_json::to_string_pretty(&hit)?),
                Some(hit) => println!(
                    "{} -> {} ({}, confidence {:.2})",
                    filename, hit.mapping.metadata_id, hit.strategy, hit.confidence
                ),
                None if cli.json => println!("null"),
                None => println!("No learned pattern matches {filename}"),
            }
        }

        Commands::Forget { id } => {
            let (store, learner) = open_store(&cli.store).await?;
            let removed = learner.forget(&id).await?;
            save_store(&store, &cli.store).await?;
            tracing::info!(id = %removed.id, "Removed learned pattern");
            if !cli.json {
                println!("Forgot {} -> {}", removed.pattern, removed.metadata_id);
            } else {
                println!("{}", serde_json::to_string_pretty(&removed)?);
            }
        }

        Commands::Patterns => {
            let (_, learner) = open_store(&cli.store).await?;
            let mappings = learner.list().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
            } else if mappings.is_empty() {
                println!("No learned patterns in {}", cli.store.display());
            } else {
                for mapping in &mappings {
                    println!(
                        "{}  {:<11} {:>4} uses  {} -> {}",
                        mapping.id, mapping.kind, mapping.use_count, mapping.pattern, mapping.metadata_id
                    );
                }
            }
        }

        Commands::Backoff { config, attempts } => {
            let config = load_config(config.as_deref())?;
            let policy = &config.retry.backoff;
            let schedule = policy.schedule(attempts);
            if cli.json {
                let millis: Vec<u128> = schedule.iter().map(|d| d.as_millis()).collect();
                println!("{}", serde_json::to_string(&millis)?);
            } else {
                for (attempt, delay) in schedule.iter().enumerate() {
                    let spread = delay.mul_f64(policy.jitter);
                    println!(
                        "attempt {attempt}: {:?} (±{:?}, max {:?})",
                        delay, spread, policy.max_delay
                    );
                }
            }
        }

        Commands::CheckConfig { path } => {
            let config = load_config(Some(&path))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_yaml()?);
                eprintln!("{} is valid", path.display());
            }
        }
    }
    Ok(())
}

async fn open_store(path: &Path) -> Result<(Arc<InMemoryPatternStore>, PatternLearner)> {
    let store = Arc::new(
        InMemoryPatternStore::load(path)
            .await
            .with_context(|| format!("Failed to load patterns from {}", path.display()))?,
    );
    let learner = PatternLearner::new(store.clone());
    Ok((store, learner))
}

async fn save_store(store: &InMemoryPatternStore, path: &Path) -> Result<()> {
    store
        .save(path)
        .await
        .with_context(|| format!("Failed to save patterns to {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn print_mapping(mapping: &FilenameMapping, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(mapping)?);
    } else {
        println!(
            "Learned {} ({}) -> {} [id {}]",
            mapping.pattern, mapping.kind, mapping.metadata_id, mapping.id
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_learn() {
        let cli = Cli::parse_from(["mediaresolve", "--store", "p.json", "learn", "[Grp] Title - 01.mkv", "tmdb:1"]);
        assert_eq!(cli.store, PathBuf::from("p.json"));
        assert!(matches!(cli.command, Commands::Learn { ref metadata_id, .. } if metadata_id == "tmdb:1"));
    }
}
