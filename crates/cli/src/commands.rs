use std::io;
use std::io::IsTerminal;
use std::io::Write;

use anyhow::{bail, Result};

use npc_memory_core::{MemoryCoordinator, MemoryError};

use crate::Commands;

pub(crate) async fn dispatch(coordinator: &MemoryCoordinator, command: Commands) -> Result<()> {
    match command {
        Commands::Add { character, content, metadata } => run_add(coordinator, character, content, metadata).await,
        Commands::Recent { character } => run_recent(coordinator, character).await,
        Commands::Search { character, query, k } => run_search(coordinator, character, query, k).await,
        Commands::Context { character, query, k } => run_context(coordinator, character, query.as_deref(), k).await,
        Commands::Update { character, id, content, metadata } => run_update(coordinator, character, id, content, metadata).await,
        Commands::Delete { character, id } => run_delete(coordinator, character, id).await,
        Commands::Clear { character, yes } => run_clear(coordinator, character, yes).await,
        Commands::Characters => run_characters(coordinator).await,
        Commands::EmbedNow { character } => run_embed_now(coordinator, character).await,
        Commands::Export { character, path } => run_export(coordinator, character, path).await,
        Commands::Import { path } => run_import(coordinator, path).await,
        Commands::Health => run_health(coordinator).await,
    }
}

/// Parses `--metadata` as a JSON object. Schema mismatches here are the
/// CLI's one analogue of the wire protocol's `ValidationFailure` (422):
/// well-formed content that doesn't match the expected shape.
fn parse_metadata(raw: Option<String>) -> Result<serde_json::Map<String, serde_json::Value>> {
    match raw {
        None => Ok(serde_json::Map::new()),
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| MemoryError::ValidationFailure(format!("--metadata is not valid JSON: {e}")))?;
            match value {
                serde_json::Value::Object(map) => Ok(map),
                other => Err(MemoryError::ValidationFailure(format!("--metadata must be a JSON object, got: {other}")).into()),
            }
        }
    }
}

async fn run_add(coordinator: &MemoryCoordinator, character: String, content: String, metadata: Option<String>) -> Result<()> {
    let metadata = parse_metadata(metadata)?;
    let result = coordinator.add(&character, &content, metadata).await?;
    println!(
        "recorded {} for {character} (stored_in={}, evicted_to_buffer={}, buffer_auto_embedded={})",
        result.id, result.stored_in, result.evicted_to_buffer, result.buffer_auto_embedded
    );
    Ok(())
}

async fn run_recent(coordinator: &MemoryCoordinator, character: String) -> Result<()> {
    let entries = coordinator.get_recent(&character).await;
    if entries.is_empty() {
        println!("no recent memory for {character}");
        return Ok(());
    }
    for entry in entries {
        println!("[{}] {} — {}", entry.timestamp.to_rfc3339(), entry.id, entry.content);
    }
    Ok(())
}

async fn run_search(coordinator: &MemoryCoordinator, character: String, query: String, k: Option<usize>) -> Result<()> {
    let hits = coordinator.search(&character, &query, k).await?;
    if hits.is_empty() {
        println!("no relevant memory found for {character}");
        return Ok(());
    }
    for hit in hits {
        println!("{:.4}  [{}] {}", hit.score, hit.entry.id, hit.entry.content);
    }
    Ok(())
}

async fn run_context(coordinator: &MemoryCoordinator, character: String, query: Option<&str>, k: Option<usize>) -> Result<()> {
    let bundle = coordinator.get_context(&character, query, k).await?;
    println!("── recent ──");
    for entry in &bundle.recent {
        println!("[{}] {}", entry.id, entry.content);
    }
    if query.is_some() {
        println!("── relevant ──");
        for hit in &bundle.relevant {
            println!("{:.4}  [{}] {}", hit.score, hit.entry.id, hit.entry.content);
        }
    }
    Ok(())
}

async fn run_update(coordinator: &MemoryCoordinator, character: String, id: uuid::Uuid, content: String, metadata: Option<String>) -> Result<()> {
    let metadata = parse_metadata(metadata)?;
    let location = coordinator.update(&character, id, &content, metadata).await?;
    println!("updated {id} for {character} (found in {location})");
    Ok(())
}

async fn run_delete(coordinator: &MemoryCoordinator, character: String, id: uuid::Uuid) -> Result<()> {
    let location = coordinator.delete(&character, id).await?;
    println!("deleted {id} for {character} (was in {location})");
    Ok(())
}

async fn run_clear(coordinator: &MemoryCoordinator, character: String, yes: bool) -> Result<()> {
    println!("⚠️  destructive operation: clear all memory for {character}");
    if !yes {
        if !io::stdin().is_terminal() {
            bail!("refusing destructive clear in non-interactive mode without --yes");
        }
        let expected = format!("CLEAR {character}");
        print!("This permanently deletes every tier for this character. Type '{expected}' to continue: ");
        io::stdout().flush()?;
        let mut confirmation = String::new();
        io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim() != expected {
            println!("clear cancelled");
            return Ok(());
        }
    }
    let counts = coordinator.clear(&character).await?;
    println!(
        "cleared all memory for {character}: {} recent, {} buffered, {} longterm",
        counts.recent_deleted, counts.buffer_deleted, counts.longterm_deleted
    );
    Ok(())
}

async fn run_characters(coordinator: &MemoryCoordinator) -> Result<()> {
    let summaries = coordinator.list_characters().await?;
    if summaries.is_empty() {
        println!("no characters have recorded memory yet");
        return Ok(());
    }
    for summary in summaries {
        let last_insert = summary
            .last_insert
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  recent={} buffer={} longterm={}  last_insert={}",
            summary.character, summary.recent_count, summary.buffer_count, summary.longterm_count, last_insert
        );
    }
    Ok(())
}

async fn run_embed_now(coordinator: &MemoryCoordinator, character: String) -> Result<()> {
    let count = coordinator.force_embed(&character).await?;
    println!("embedded {count} buffered entries for {character}");
    Ok(())
}

async fn run_export(coordinator: &MemoryCoordinator, character: String, path: std::path::PathBuf) -> Result<()> {
    let export = coordinator.export(&character).await?;
    let rendered = serde_json::to_vec_pretty(&export)?;
    std::fs::write(&path, rendered)?;
    println!("exported {} recent, {} buffered, {} indexed entries to {}", export.recent.len(), export.buffered.len(), export.indexed.len(), path.display());
    Ok(())
}

async fn run_import(coordinator: &MemoryCoordinator, path: std::path::PathBuf) -> Result<()> {
    let raw = std::fs::read(&path)?;
    let export: npc_memory_core::CharacterExport = serde_json::from_slice(&raw)?;
    let character = export.character.clone();
    coordinator.import(export).await?;
    println!("imported memory for {character} from {}", path.display());
    Ok(())
}

async fn run_health(coordinator: &MemoryCoordinator) -> Result<()> {
    let status = coordinator.embedding_status().await;
    println!("embedding engine: {status:?}");
    Ok(())
}
