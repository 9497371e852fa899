use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use rustmemodb_offline::{DisconnectedSnapshot, SnapshotFormat, SnapshotManager, StateRegistry};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "offline-tool")]
#[command(about = "Inspect saved disconnected-state snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summary counts of a snapshot
    Inspect { file: PathBuf },
    /// Keys visible in the local view, with their persistence state
    Keys {
        file: PathBuf,
        #[arg(long)]
        removed: bool,
    },
    /// Captured operations in replay order
    Ops {
        file: PathBuf,
        #[arg(long)]
        undo: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { file } => inspect(&file),
        Command::Keys { file, removed } => keys(&file, removed),
        Command::Ops { file, undo } => ops(&file, undo),
    }
}

fn load(path: &Path) -> Result<DisconnectedSnapshot> {
    SnapshotManager::new(path, SnapshotFormat::default())
        .load()
        .with_context(|| format!("Failed to read snapshot '{}'", path.display()))?
        .ok_or_else(|| anyhow!("Snapshot '{}' does not exist", path.display()))
}

fn registry(snapshot: &DisconnectedSnapshot) -> StateRegistry {
    StateRegistry::restore_layer(
        StateRegistry::from_records(snapshot.original.iter().cloned()),
        snapshot.local.iter().cloned(),
        snapshot.operations.clone(),
    )
}

fn inspect(path: &Path) -> Result<()> {
    let snapshot = load(path)?;
    let removed = snapshot.local.iter().filter(|record| record.is_removed()).count();

    println!("Snapshot: {}", path.display());
    println!("Format version: {}", snapshot.format_version);
    println!("Created at: {}", snapshot.created_at.to_rfc3339());
    println!("Original entities: {}", snapshot.original.len());
    println!("Local records: {} ({} removed)", snapshot.local.len(), removed);
    println!("Pending operations: {}", snapshot.operations.len());
    println!("Known versions: {}", snapshot.versions.len());
    Ok(())
}

fn keys(path: &Path, include_removed: bool) -> Result<()> {
    let snapshot = load(path)?;
    let registry = registry(&snapshot);

    let mut keys = registry.all_keys(include_removed);
    keys.sort_by_cached_key(|key| key.to_string());
    for key in keys {
        let state = registry
            .persistence_state(&key)
            .map(|state| state.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<13} {}", state, key);
    }
    Ok(())
}

fn ops(path: &Path, undo: bool) -> Result<()> {
    let snapshot = load(path)?;
    if undo {
        for (index, operation) in snapshot.operations.undo_operations().iter().enumerate() {
            println!("{:>4}  {}", index, operation);
        }
        return Ok(());
    }

    let mut index = 0;
    for operation in snapshot.operations.iter() {
        for node in operation.flatten() {
            println!("{:>4}  {}", index, node);
            index += 1;
        }
    }
    Ok(())
}
