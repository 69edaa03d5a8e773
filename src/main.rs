use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use termq::card::{parse_session_name, CardId};
use termq::config::{default_base_dir, load_config};
use termq::logging::init_logging;
use termq::metadata::MetadataSync;
use termq::registry::SessionRegistry;
use termq::tmux::{Multiplexer, TmuxCli};

#[derive(Parser)]
#[command(name = "termq", version, about = "Terminal card session manager for tmux")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List running termq tmux sessions
    Ls,
    /// Print the tmux session name for a card
    Name {
        /// Card id (UUID)
        card: String,
    },
    /// Kill a card's tmux session
    Kill {
        /// Card id (UUID)
        card: String,
    },
    /// Show the card metadata stored in a session's environment
    Env {
        /// Card id (UUID)
        card: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Name { card } => cmd_name(&card),
        Commands::Ls => cmd_ls().await,
        Commands::Kill { card } => cmd_kill(&card).await,
        Commands::Env { card } => cmd_env(&card).await,
    }
}

async fn multiplexer() -> Arc<dyn Multiplexer> {
    let config = load_config(&default_base_dir()).await;
    Arc::new(TmuxCli::detect(&config))
}

fn cmd_name(card: &str) -> Result<()> {
    let id: CardId = card.parse()?;
    println!("{}", id.session_name());
    Ok(())
}

async fn cmd_ls() -> Result<()> {
    let mux = multiplexer().await;
    if !mux.is_available() {
        println!("tmux is not installed.");
        return Ok(());
    }
    let sync = MetadataSync::new(mux.clone());
    let sessions: Vec<_> = mux
        .list_sessions()
        .await?
        .into_iter()
        .filter(|s| parse_session_name(&s.name).is_some())
        .collect();
    if sessions.is_empty() {
        println!("No termq sessions.");
        return Ok(());
    }
    let synced = futures::future::join_all(sessions.iter().map(|s| sync.read(&s.name))).await;
    for (s, synced) in sessions.iter().zip(synced) {
        let title = match synced {
            Ok(synced) if !synced.metadata.title.is_empty() => synced.metadata.title,
            _ => "-".to_string(),
        };
        let attached = if s.attached { " (attached)" } else { "" };
        println!("{}  {}  [{} windows]{attached}", s.name, title, s.windows);
    }
    Ok(())
}

async fn cmd_kill(card: &str) -> Result<()> {
    let id: CardId = card.parse()?;
    let config = load_config(&default_base_dir()).await;
    let mux: Arc<dyn Multiplexer> = Arc::new(TmuxCli::detect(&config));
    let registry = SessionRegistry::new(mux, config);
    registry
        .kill(&id)
        .await
        .with_context(|| format!("Failed to kill {}", id.session_name()))?;
    println!("Killed session: {}", id.session_name());
    Ok(())
}

async fn cmd_env(card: &str) -> Result<()> {
    let id: CardId = card.parse()?;
    let mux = multiplexer().await;
    let name = id.session_name();
    let synced = MetadataSync::new(mux)
        .read(&name)
        .await
        .with_context(|| format!("Failed to read environment of {name}"))?;
    let meta = synced.metadata;
    let card = synced
        .card
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());
    let tags: Vec<String> = meta.tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
    println!("session      {name}");
    println!("card         {card}");
    println!("title        {}", meta.title);
    println!("description  {}", meta.description.replace('\n', "\n             "));
    println!("column       {}", meta.column);
    println!("tags         {}", tags.join(", "));
    println!("badges       {}", meta.badges.join(", "));
    println!("prompt       {}", meta.llm_prompt);
    println!("next action  {}", meta.llm_next_action);
    println!("favourite    {}", meta.favourite);
    Ok(())
}
