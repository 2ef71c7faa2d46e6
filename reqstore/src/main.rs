//! `reqstore` command line.
//!
//! Operates on `<root>/.state/`. Mutating commands take the project lock for
//! their duration and fail fast with exit code `LOCKED` if another session
//! holds it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use reqstore::core::changelog::Changelog;
use reqstore::core::events::{ChangelogEvent, EVENT_TYPES};
use reqstore::error::format_age;
use reqstore::exit_codes;
use reqstore::io::codec::{decode_yaml, encode_yaml};
use reqstore::io::config::load_config;
use reqstore::io::init::{InitOptions, init_project};
use reqstore::io::lock::InterfaceTag;
use reqstore::io::paths::StatePaths;
use reqstore::{Delta, Repository, StoreError, logging};

#[derive(Parser)]
#[command(name = "reqstore", version, about = "Versioned requirement store")]
struct Cli {
    /// Project root containing `.state/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.state/` with an empty specification and changelog.
    Init {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Initial category (repeatable).
        #[arg(long = "category")]
        categories: Vec<String>,
        /// Overwrite existing state, discarding history.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the current specification as YAML.
    Show,
    /// List changelog events, optionally filtered.
    Log {
        #[arg(long, conflicts_with_all = ["event_type", "category"])]
        requirement: Option<String>,
        #[arg(long = "type", conflicts_with = "category")]
        event_type: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Commit a delta file (`specification` + `events`) under the project lock.
    Apply {
        delta: PathBuf,
        #[arg(long, default_value = "cli")]
        interface: InterfaceTag,
    },
    /// Inspect the project lock.
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
    /// Remove the project lock regardless of holder.
    Unlock {
        /// Required; confirms the override.
        #[arg(long)]
        force: bool,
    },
    /// Remove orphaned transaction directories.
    Cleanup,
}

#[derive(Subcommand)]
enum LockCommand {
    /// Print the recorded holder and whether it is stale.
    Status,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("error: {:#}", err);
            let store_err = err.downcast_ref::<StoreError>();
            if let Some(hint) = store_err.and_then(StoreError::hint) {
                eprintln!("hint: {}", hint);
            }
            if store_err.is_some_and(StoreError::is_lock_contention) {
                exit_codes::LOCKED
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init {
            name,
            description,
            categories,
            force,
        } => cmd_init(
            root,
            &InitOptions {
                name,
                description,
                categories,
                force,
            },
        ),
        Command::Show => cmd_show(root),
        Command::Log {
            requirement,
            event_type,
            category,
        } => cmd_log(root, requirement, event_type, category),
        Command::Apply { delta, interface } => cmd_apply(root, &delta, interface),
        Command::Lock {
            command: LockCommand::Status,
        } => cmd_lock_status(root),
        Command::Unlock { force } => cmd_unlock(root, force),
        Command::Cleanup => cmd_cleanup(root),
    }
}

fn open(root: &Path) -> Result<Repository> {
    let paths = StatePaths::new(root);
    let config = load_config(&paths.config_path)?;
    Ok(Repository::open(root, config)?)
}

fn cmd_init(root: &Path, options: &InitOptions) -> Result<()> {
    let paths = init_project(root, options)?;
    println!("initialized {}", paths.state_dir.display());
    Ok(())
}

fn cmd_show(root: &Path) -> Result<()> {
    let repo = open(root)?;
    let state = repo.read_state()?;
    print!("{}", encode_yaml(&state, "specification")?);
    Ok(())
}

fn cmd_log(
    root: &Path,
    requirement: Option<String>,
    event_type: Option<String>,
    category: Option<String>,
) -> Result<()> {
    let repo = open(root)?;
    let changelog = repo.read_changelog()?;
    let events = select_events(&changelog, requirement, event_type, category)?;
    for event in events {
        println!("{}", format_event(event));
    }
    Ok(())
}

fn select_events(
    changelog: &Changelog,
    requirement: Option<String>,
    event_type: Option<String>,
    category: Option<String>,
) -> Result<Vec<&ChangelogEvent>> {
    if let Some(id) = requirement {
        return Ok(changelog.events_for_requirement(&id));
    }
    if let Some(kind) = event_type {
        if !EVENT_TYPES.contains(&kind.as_str()) {
            bail!(
                "unknown event type '{}' (expected one of: {})",
                kind,
                EVENT_TYPES.join(", ")
            );
        }
        return Ok(changelog.events_of_type(&kind));
    }
    if let Some(category) = category {
        return Ok(changelog.events_in_category(&category));
    }
    Ok(changelog.events.iter().collect())
}

fn format_event(event: &ChangelogEvent) -> String {
    let subject = event.kind.requirement_id().unwrap_or("-");
    format!(
        "{}  {}  {:<30} {}",
        event.timestamp.to_rfc3339(),
        event.event_id,
        event.event_type(),
        subject
    )
}

fn cmd_apply(root: &Path, delta_path: &Path, interface: InterfaceTag) -> Result<()> {
    let bytes = fs::read(delta_path).with_context(|| format!("read {}", delta_path.display()))?;
    let delta: Delta = decode_yaml(&bytes, delta_path)?;

    let mut repo = open(root)?;
    repo.acquire_lock(interface)?;
    let result = repo.apply_delta(delta);
    repo.release_lock()?;
    let summary = result?;

    println!(
        "committed {} event(s); changelog now has {} (version {})",
        summary.positions.len(),
        summary.total_events,
        summary.version
    );
    for snapshot in &summary.snapshots {
        println!("snapshot {}", snapshot.display());
    }
    Ok(())
}

fn cmd_lock_status(root: &Path) -> Result<()> {
    let repo = open(root)?;
    match repo.lock_status()? {
        None => println!("unlocked"),
        Some(status) => {
            let staleness = match status.stale {
                Some(reason) => format!(" (stale: {:?})", reason),
                None => String::new(),
            };
            println!(
                "locked by {} for {}{}",
                status.holder,
                format_age(status.age),
                staleness
            );
        }
    }
    Ok(())
}

fn cmd_unlock(root: &Path, force: bool) -> Result<()> {
    if !force {
        bail!("unlock removes another session's lock; pass --force to confirm");
    }
    if Repository::force_unlock(root)? {
        println!("lock removed");
    } else {
        println!("no lock present");
    }
    Ok(())
}

fn cmd_cleanup(root: &Path) -> Result<()> {
    let mut repo = open(root)?;
    repo.acquire_lock(InterfaceTag::Cli)?;
    let report = repo.cleanup();
    repo.release_lock()?;
    let report = report?;

    if let Some(restored) = &report.restored {
        println!("restored {}", restored.display());
    }
    for removed in &report.removed {
        println!("removed {}", removed.display());
    }
    if report.restored.is_none() && report.removed.is_empty() {
        println!("nothing to clean up");
    }
    Ok(())
}
