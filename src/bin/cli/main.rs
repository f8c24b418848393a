mod app;
mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "studyshelf-cli", about = "Inspect and sync the local study-shelf cache", version)]
struct Cli {
    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Signed-in user id (default: $STUDYSHELF_USER)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List books known to this device
    Books {
        /// Merge with the cloud listing first
        #[arg(long)]
        remote: bool,
    },

    /// List cache keys, optionally filtered by a glob pattern
    Keys {
        /// Glob pattern, e.g. "FLASHCARD_Physics_*"
        pattern: Option<String>,
    },

    /// Print one content entry, pulling it from the cloud when missing
    Get {
        /// Content type (FLASHCARD, MCQ, QA, NOTES, MINDMAP, VIDEOS)
        content_type: String,
        /// Book name
        book: String,
        /// Chapter name
        chapter: String,
        /// Tab id for tab-scoped content
        #[arg(long)]
        tab: Option<String>,
    },

    /// Show cache size by content type
    Stats,

    /// Fold legacy keys into their canonical form
    Cleanup,

    /// Push and pull every highlight, exam and custom tab
    Resync,

    /// Load one chapter, reporting progress as it goes
    Load {
        /// Book name
        book: String,
        /// Chapter name
        chapter: String,
        /// Drop local chapter data and reload it from the cloud
        #[arg(long)]
        refresh: bool,
    },

    /// Push every book to the cloud now
    Push,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let use_color = !cli.no_color && atty_check();
    let app = app::App::new(cli.config, cli.user)?;

    let result = match cli.command {
        Command::Books { remote } => commands::books::run(&app, remote, &cli.format, use_color).await,
        Command::Keys { pattern } => {
            commands::keys::run(&app, pattern.as_deref(), &cli.format, use_color)
        }
        Command::Get { content_type, book, chapter, tab } => {
            commands::get::run(&app, &content_type, &book, &chapter, tab.as_deref(), &cli.format)
                .await
        }
        Command::Stats => commands::stats::run(&app, &cli.format, use_color),
        Command::Cleanup => commands::cleanup::run(&app, &cli.format, use_color).await,
        Command::Resync => commands::resync::run(&app, &cli.format, use_color).await,
        Command::Load { book, chapter, refresh } => {
            commands::load::run(&app, &book, &chapter, refresh, &cli.format, use_color).await
        }
        Command::Push => commands::resync::run_push(&app, &cli.format, use_color).await,
    };

    app.engine.shutdown();
    result
}

/// Check if stdout is a terminal (for color support)
fn atty_check() -> bool {
    unsafe { libc_isatty(1) != 0 }
}

extern "C" {
    #[link_name = "isatty"]
    fn libc_isatty(fd: i32) -> i32;
}
