// ============================================================================
// studio — command-line client for an Image Studio server
// ============================================================================
// Usage:
//   studio generate "a red fox" --n 2       Generate images
//   studio edit "add a hat" --image cat.png Edit source images
//   studio edit "add a hat" --from-history 1700000000000
//   studio reedit <task-id> --prompt "..."   Repeat an edit on its sources
//   studio history                          List history entries
//   studio favorite toggle 1700000000000    Star or unstar an entry
//   studio stats                            Show local database statistics
//   studio prune --older-than 30            Prune old finished tasks
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use studio_core::storage::content_type_for;
use studio_core::{
    Background, HistoryEntry, HttpStudioApi, Moderation, OutputFormat, Quality, StudioApi, StudioConfig,
    StudioSession, SubmitForm, TaskStatus, UploadedImage,
};

/// Image Studio client
#[derive(Parser)]
#[command(name = "studio", version, about = "Generate, edit and manage images through an Image Studio server")]
struct Cli {
    /// Server base URL (default: STUDIO_SERVER_URL or http://127.0.0.1:3000)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Path to the database file (default: ~/.image-studio/studio.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate images from a prompt
    Generate {
        prompt: String,
        #[arg(long, default_value = "1")]
        n: u32,
        /// e.g. 1024x1024, 1536x1024, 1024x1536, auto
        #[arg(long)]
        size: Option<String>,
        /// auto, low, medium, high
        #[arg(long, default_value = "auto")]
        quality: String,
        /// png, jpeg, webp
        #[arg(long, default_value = "png")]
        format: String,
        /// 0-100, jpeg and webp only
        #[arg(long)]
        compression: Option<u8>,
        /// auto, transparent, opaque
        #[arg(long, default_value = "auto")]
        background: String,
        /// auto, low
        #[arg(long, default_value = "auto")]
        moderation: String,
    },

    /// Edit one or more source images
    Edit {
        prompt: String,
        /// Source image file (repeatable)
        #[arg(long = "image", required_unless_present = "from_history")]
        images: Vec<PathBuf>,
        /// Use the images of a history entry as sources
        #[arg(long)]
        from_history: Option<i64>,
        /// Optional mask image
        #[arg(long)]
        mask: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        n: u32,
        #[arg(long)]
        size: Option<String>,
        #[arg(long, default_value = "auto")]
        quality: String,
    },

    /// Run an earlier edit task again on its kept source images
    Reedit {
        task_id: String,
        /// Replace the original prompt
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Text completion, printed as raw JSON
    Complete {
        prompt: String,
        #[arg(long, default_value = "1")]
        n: u32,
    },

    /// Store the password hash used for every request
    Login { password: String },

    /// Show what the server requires and where it stores images
    Status,

    /// List history entries, newest first
    History,

    /// Resolve the images of one history entry
    Show { timestamp: i64 },

    /// Delete a history entry and its images
    Delete { timestamp: i64 },

    /// Remove a history entry but leave its images in storage
    Forget { timestamp: i64 },

    /// Remove all history, favorites and locally stored images
    ClearHistory {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },

    /// List tasks with optional status filter
    Tasks {
        /// pending, processing, completed, failed
        #[arg(long)]
        status: Option<String>,
    },

    /// Delete a task record and its kept source images
    DeleteTask { id: String },

    /// Manage favorites
    #[command(subcommand)]
    Favorite(FavoriteCommand),

    /// Show database statistics
    Stats,

    /// Export tasks, history and favorites as JSON
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Prune old finished tasks
    Prune {
        /// Delete finished tasks older than this many days
        #[arg(long, default_value = "30")]
        older_than: i64,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum FavoriteCommand {
    /// Favorite a history entry
    Add {
        timestamp: i64,
        #[arg(long)]
        note: Option<String>,
    },
    /// Remove a favorite by id
    Remove { id: String },
    /// Star or unstar a history entry
    Toggle { timestamp: i64 },
    /// Set or clear (empty string) a favorite's note
    Note { id: String, note: String },
    /// List favorites with their entries
    List,
}

fn parse_or_bail<T>(value: &str, parse: fn(&str) -> Option<T>, valid: &str) -> Result<T> {
    parse(value).with_context(|| format!("Unknown value '{}'. Valid values: {}", value, valid))
}

fn format_timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ms))
}

async fn read_image(path: &Path) -> Result<UploadedImage> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.png".to_string());
    Ok(UploadedImage {
        content_type: content_type_for(&filename).to_string(),
        filename,
        bytes,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = StudioConfig::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(path) = cli.db_path {
        config.db_path = Some(PathBuf::from(path));
    }

    let api = Arc::new(HttpStudioApi::new(&config.server_url));
    let mut session = StudioSession::open(&config, api.clone())?;

    match cli.command {
        Commands::Generate {
            prompt,
            n,
            size,
            quality,
            format,
            compression,
            background,
            moderation,
        } => {
            let mut form = SubmitForm::generate(prompt);
            form.n = n;
            form.size = size;
            form.quality = parse_or_bail(&quality, Quality::parse, "auto, low, medium, high, standard, hd")?;
            form.output_format = parse_or_bail(&format, OutputFormat::parse, "png, jpeg, webp")?;
            form.output_compression = compression;
            form.background = parse_or_bail(&background, Background::parse, "auto, transparent, opaque")?;
            form.moderation = parse_or_bail(&moderation, Moderation::parse, "auto, low")?;
            cmd_submit(&mut session, form).await
        }
        Commands::Edit {
            prompt,
            images,
            from_history,
            mask,
            n,
            size,
            quality,
        } => {
            let mut uploads = match from_history {
                Some(timestamp) => session.sources_from_history(timestamp).await?,
                None => Vec::with_capacity(images.len()),
            };
            if let Some(message) = session.error() {
                eprintln!("Warning: {}", message);
            }
            for path in &images {
                uploads.push(read_image(path).await?);
            }
            let mut form = SubmitForm::edit(prompt, uploads);
            form.n = n;
            form.size = size;
            form.quality = parse_or_bail(&quality, Quality::parse, "auto, low, medium, high, standard, hd")?;
            form.mask = match mask {
                Some(path) => Some(read_image(&path).await?),
                None => None,
            };
            cmd_submit(&mut session, form).await
        }
        Commands::Reedit { task_id, prompt } => {
            let form = session.reedit_form(&task_id, prompt)?;
            cmd_submit(&mut session, form).await
        }
        Commands::Complete { prompt, n } => {
            let value = session.complete(&prompt, n, None).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Commands::Login { password } => {
            session.set_password(&password)?;
            println!("Password stored.");
            Ok(())
        }
        Commands::Status => {
            let status = api.auth_status().await?;
            println!("Server:            {}", api.base_url());
            println!("Storage mode:      {}", status.storage_mode);
            println!("Password required: {}", status.password_required);
            println!(
                "Password stored:   {}",
                if session.password_hash().is_some() { "yes" } else { "no" }
            );
            Ok(())
        }
        Commands::History => cmd_history(&session),
        Commands::Show { timestamp } => cmd_show(&mut session, timestamp).await,
        Commands::Delete { timestamp } => {
            session.delete_history_entry(timestamp).await?;
            println!("Deleted history entry {}", timestamp);
            Ok(())
        }
        Commands::Forget { timestamp } => {
            if session.ledger().forget_history_entry(timestamp)? {
                println!("Removed history entry {} (images kept)", timestamp);
            } else {
                println!("No history entry {}", timestamp);
            }
            Ok(())
        }
        Commands::ClearHistory { yes } => {
            if !yes {
                anyhow::bail!("Refusing to clear history without --yes");
            }
            let removed = session.clear_history().await?;
            println!("Cleared {} history entries", removed);
            Ok(())
        }
        Commands::Tasks { status } => cmd_tasks(&session, status),
        Commands::DeleteTask { id } => {
            if session.ledger().delete_task(&id)? {
                println!("Deleted task {}", id);
            } else {
                println!("No task {}", id);
            }
            Ok(())
        }
        Commands::Favorite(command) => cmd_favorite(&session, command),
        Commands::Stats => cmd_stats(&session),
        Commands::Export { format } => cmd_export(&session, &format),
        Commands::Prune { older_than, dry_run } => cmd_prune(&session, older_than, dry_run),
    }
}

async fn cmd_submit(session: &mut StudioSession, form: SubmitForm) -> Result<()> {
    let outcome = session.submit(form).await?;

    println!("Task {} {}", outcome.task.id, outcome.task.status.as_str());
    println!(
        "History entry {} ({} mode, {} ms)",
        outcome.entry.timestamp, outcome.entry.storage_mode_used, outcome.entry.duration_ms
    );
    if let Some(cost) = &outcome.entry.cost_details {
        println!("Estimated cost: ${:.4}", cost.estimated_cost_usd);
    }
    for image in &outcome.images {
        println!("  {}  {}", image.filename, image.url.as_deref().unwrap_or("(unavailable)"));
    }
    if let Some(error) = session.error() {
        eprintln!("Warning: {}", error);
    }
    Ok(())
}

fn print_entry_line(entry: &HistoryEntry, favorite: bool) {
    let prompt: String = entry.prompt.chars().take(40).collect();
    println!(
        "{:<15}  {}  {:<22}  {:<8}  {:<9}  {:>3}  {}",
        entry.timestamp,
        if favorite { "*" } else { " " },
        format_timestamp(entry.timestamp),
        entry.mode.as_str(),
        entry.storage_mode_used.as_str(),
        entry.images.len(),
        prompt
    );
}

fn cmd_history(session: &StudioSession) -> Result<()> {
    let entries = session.ledger().history()?;
    if entries.is_empty() {
        println!("No history entries.");
        return Ok(());
    }

    println!(
        "{:<15}  {}  {:<22}  {:<8}  {:<9}  {:>3}  {}",
        "TIMESTAMP", "F", "CREATED", "MODE", "STORAGE", "IMG", "PROMPT"
    );
    println!("{}", "-".repeat(100));

    let favorites = session.favorites().favorites()?;
    let mut total_cost = 0.0;
    for entry in &entries {
        let favorite = favorites.iter().any(|f| f.history_item_timestamp == entry.timestamp);
        print_entry_line(entry, favorite);
        total_cost += entry.cost_details.map(|c| c.estimated_cost_usd).unwrap_or(0.0);
    }

    println!("\nTotal: {} entries, estimated cost ${:.4}", entries.len(), total_cost);
    Ok(())
}

async fn cmd_show(session: &mut StudioSession, timestamp: i64) -> Result<()> {
    let entry = session
        .ledger()
        .get_history_entry(timestamp)?
        .with_context(|| format!("No history entry {}", timestamp))?;

    println!("Prompt:   {}", entry.prompt);
    println!("Created:  {}", format_timestamp(entry.timestamp));
    println!("Mode:     {} (quality {})", entry.mode.as_str(), entry.quality.as_str());
    println!("Storage:  {}", entry.storage_mode_used);
    if let Some(task_id) = &entry.task_id {
        println!("Task:     {}", task_id);
    }

    let selection = session.select_history(&entry).await;
    for image in &selection.images {
        println!("  {}  {}", image.filename, image.url.as_deref().unwrap_or("(missing)"));
    }
    if let Some(error) = selection.error {
        eprintln!("Warning: {}", error);
    }
    Ok(())
}

fn cmd_tasks(session: &StudioSession, status_filter: Option<String>) -> Result<()> {
    let filter = status_filter
        .as_deref()
        .map(|s| parse_or_bail(s, TaskStatus::parse, "pending, processing, completed, failed"))
        .transpose()?;
    let tasks = session.ledger().list_tasks(filter)?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<22}  {}",
        "TASK ID", "STATUS", "SUBMITTED AT", "PROMPT / ERROR"
    );
    println!("{}", "-".repeat(100));

    for task in &tasks {
        let detail = match (&task.status, &task.error) {
            (TaskStatus::Failed, Some(error)) => error.chars().take(40).collect::<String>(),
            _ => task.prompt.chars().take(40).collect::<String>(),
        };
        println!(
            "{:<36}  {:<10}  {:<22}  {}",
            task.id,
            task.status.as_str(),
            format_timestamp(task.timestamp),
            detail
        );
    }

    println!("\nTotal: {} tasks", tasks.len());
    Ok(())
}

fn cmd_favorite(session: &StudioSession, command: FavoriteCommand) -> Result<()> {
    let favorites = session.favorites();
    match command {
        FavoriteCommand::Add { timestamp, note } => {
            let id = favorites.add_to_favorites(timestamp, note)?;
            println!("Favorite {}", id);
        }
        FavoriteCommand::Remove { id } => {
            if favorites.remove_from_favorites(&id)? {
                println!("Removed favorite {}", id);
            } else {
                println!("No favorite {}", id);
            }
        }
        FavoriteCommand::Toggle { timestamp } => {
            if favorites.toggle_favorite(timestamp)? {
                println!("History entry {} is now a favorite", timestamp);
            } else {
                println!("History entry {} is no longer a favorite", timestamp);
            }
        }
        FavoriteCommand::Note { id, note } => {
            let favorite = favorites.update_favorite_note(&id, Some(note))?;
            println!("Note: {}", favorite.note.as_deref().unwrap_or("(none)"));
        }
        FavoriteCommand::List => {
            let items = favorites.favorite_items()?;
            if items.is_empty() {
                println!("No favorites.");
                return Ok(());
            }
            for item in &items {
                println!(
                    "{}  added {}  {}",
                    item.favorite.id,
                    format_timestamp(item.favorite.added_at),
                    item.favorite.note.as_deref().unwrap_or("")
                );
                print_entry_line(&item.entry, true);
            }
            println!("\nTotal: {} favorites", items.len());
        }
    }
    Ok(())
}

fn cmd_stats(session: &StudioSession) -> Result<()> {
    let db = session.db();
    let stats = db.stats()?;

    println!("=== Image Studio Database Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Tasks:     {} total", stats.total_tasks);
    for (status, count) in &stats.task_counts {
        println!("  {:12} {}", status, count);
    }
    println!("History:   {}", stats.history_entries);
    println!("Favorites: {}", stats.favorites);
    println!("Images:    {} ({} bytes)", stats.images, stats.image_bytes);
    println!("Sources:   {}", stats.source_images);

    Ok(())
}

fn cmd_export(session: &StudioSession, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let db = session.db();
    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": db.stats()?,
        "tasks": db.list_tasks(None)?,
        "history": db.list_history()?,
        "favorites": db.list_favorites()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_prune(session: &StudioSession, older_than: i64, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("=== DRY RUN - no data will be deleted ===\n");

        let pruneable = session.db().finished_tasks_older_than(older_than)?;
        println!(
            "Would prune {} finished tasks older than {} days",
            pruneable.len(),
            older_than
        );
        for task in &pruneable {
            println!(
                "  - {} ({}, submitted: {})",
                task.id,
                task.status.as_str(),
                format_timestamp(task.timestamp)
            );
        }
    } else {
        let pruned = session.ledger().prune_tasks(older_than)?;
        println!("Pruned {} finished tasks (older than {} days)", pruned, older_than);
    }

    Ok(())
}
