mod app;
mod input;
mod menu;
mod preview;
mod terminal;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use presence_core::{Config, RegisterOutcome, TrackMode};

#[derive(Parser)]
#[command(name = "presence", about = "Face recognition attendance tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the interactive menu (default)
    Menu,
    /// Capture and store a reference face
    Register {
        /// Name to register the face under
        name: String,
    },
    /// Mark attendance for recognized faces
    Track {
        /// Stop after the first person is marked
        #[arg(long)]
        once: bool,
    },
    /// Print the attendance log
    Log,
    /// Erase all attendance records
    Clear {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List video capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");
    let mut app = app::App::new(config, input::LineReader::stdin());

    match cli.command.unwrap_or(Commands::Menu) {
        Commands::Menu => menu::run(&mut app)?,
        Commands::Register { name } => {
            if !matches!(app.register(&name)?, RegisterOutcome::Saved(_)) {
                std::process::exit(1);
            }
        }
        Commands::Track { once } => {
            let mode = if once { TrackMode::SingleShot } else { TrackMode::Continuous };
            let summary = app.track(mode)?;
            if once && summary.marked.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Log => app.show_log()?,
        Commands::Clear { yes } => {
            let confirmed = yes || menu::confirm(app.input(), menu::CLEAR_QUESTION)?;
            app.clear_log(confirmed)?;
        }
        Commands::Devices => app.list_devices(),
    }

    Ok(())
}
