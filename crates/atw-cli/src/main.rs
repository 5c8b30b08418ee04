use anyhow::{Context, Result};
use atw_routing::CommentRouter;
use atw_storage::WorkbenchStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "atw")]
#[command(about = "Agent thread workbench CLI", long_about = None)]
struct Cli {
    /// Path to the workbench database. Defaults to
    /// `<data-dir>/atw/workbench.db`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect threads
    Thread {
        #[command(subcommand)]
        action: ThreadCommands,
    },
    /// Inspect review comments
    Comment {
        #[command(subcommand)]
        action: CommentCommands,
    },
    /// Inspect the file ownership map
    Owner {
        #[command(subcommand)]
        action: OwnerCommands,
    },
    /// Show where pending comments would be delivered, without sending
    Route {
        /// Thread to fall back to for files no thread owns
        #[arg(long)]
        focused: Option<String>,
    },
}

#[derive(Subcommand)]
enum ThreadCommands {
    List,
    Show {
        thread_id: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CommentCommands {
    /// Unsubmitted comments, oldest first
    Pending,
}

#[derive(Subcommand)]
enum OwnerCommands {
    List,
    Lookup { file: String },
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    let store = open_store(cli.db)?;

    match cli.command {
        Commands::Thread { action } => match action {
            ThreadCommands::List => {
                let threads = store.all_threads()?;
                if threads.is_empty() {
                    println!("No threads");
                    return Ok(());
                }
                for thread in threads {
                    let isolation = match thread.branch() {
                        Some(branch) => format!("branch {branch}"),
                        None => "workspace".to_string(),
                    };
                    println!(
                        "- [{}] {} ({}, terminal {})",
                        thread.thread_id, thread.name, isolation, thread.terminal_id
                    );
                }
            }
            ThreadCommands::Show { thread_id, json } => {
                let Some(thread) = store.thread_by_id(&thread_id)? else {
                    println!("Thread {thread_id} not found");
                    return Ok(());
                };
                if json {
                    println!("{}", serde_json::to_string_pretty(&thread)?);
                } else {
                    println!("id:          {}", thread.thread_id);
                    println!("name:        {}", thread.name);
                    println!("terminal:    {}", thread.terminal_id);
                    println!("working dir: {}", thread.working_dir.display());
                    match thread.isolation.as_ref() {
                        Some(isolation) => {
                            println!("branch:      {}", isolation.branch);
                            println!("worktree:    {}", isolation.worktree_path.display());
                        }
                        None => println!("isolation:   none"),
                    }
                    if !thread.whitelist_patterns.is_empty() {
                        println!("whitelist:   {}", thread.whitelist_patterns.join(", "));
                    }
                    println!("created:     {}", thread.created_at.to_rfc3339());
                }
            }
        },
        Commands::Comment { action } => match action {
            CommentCommands::Pending => {
                let comments = store.active_comments()?;
                if comments.is_empty() {
                    println!("No pending comments");
                    return Ok(());
                }
                println!("{} pending comment(s):", comments.len());
                for comment in comments {
                    println!(
                        "- [{}] {}: {}",
                        comment.comment_id,
                        comment.location_label(),
                        comment.text
                    );
                }
            }
        },
        Commands::Owner { action } => match action {
            OwnerCommands::List => {
                let mappings = store.all_file_owners()?;
                if mappings.is_empty() {
                    println!("No file owners recorded");
                    return Ok(());
                }
                for mapping in mappings {
                    println!("- {} -> {}", mapping.file_path, mapping.thread_id);
                }
            }
            OwnerCommands::Lookup { file } => match store.owner_for_file(&file)? {
                Some(thread_id) => println!("{file} -> {thread_id}"),
                None => println!("{file} has no owner"),
            },
        },
        Commands::Route { focused } => {
            let plan = CommentRouter.plan(&store, focused.as_deref())?;
            if plan.is_empty() {
                println!("No pending comments");
                return Ok(());
            }
            for destination in &plan.destinations {
                println!(
                    "-> {} ({}, terminal {}): {} comment(s)",
                    destination.thread_name,
                    destination.thread_id,
                    destination.terminal_id,
                    destination.comments.len()
                );
                for comment in &destination.comments {
                    println!("   - {}: {}", comment.location_label(), comment.text);
                }
            }
            if !plan.unroutable_files.is_empty() {
                println!("Unroutable files: {}", plan.unroutable_files.join(", "));
            }
        }
    }

    Ok(())
}

fn open_store(db: Option<PathBuf>) -> Result<WorkbenchStore> {
    let path = match db {
        Some(path) => path,
        None => {
            let base = dirs::data_dir().context("Could not determine the data directory")?;
            let dir = base.join("atw");
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            dir.join("workbench.db")
        }
    };
    WorkbenchStore::open(&path).with_context(|| format!("Failed to open {}", path.display()))
}
