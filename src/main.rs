use anyhow::{Context, Result};
use askbase::config::Config;
use askbase::db::Metadata;
use askbase::mcp::McpServer;
use askbase::{AppState, server};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "askbase", version, about = "Retrieval-augmented Q&A over a local knowledge store")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, default_value = askbase::config::DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve {
        /// Address to bind, overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Serve MCP tools over stdio
    Mcp,
    /// Store one piece of knowledge
    Ingest {
        content: String,
        /// Metadata as a JSON object, e.g. '{"source":"doc1"}'
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Ask a one-shot question
    Ask {
        question: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stderr keeps stdout free for the MCP transport
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    config.validate().context("Invalid configuration")?;

    let state = AppState::from_config(config).context("Failed to initialise services")?;

    match cli.command {
        Command::Serve { bind: override_bind } => {
            let bind = override_bind.unwrap_or_else(|| state.config.server.bind.clone());
            server::serve(state, &bind).await?;
        }
        Command::Mcp => {
            McpServer::new(state).start().await?;
        }
        Command::Ingest { content, metadata } => {
            let metadata: Option<Metadata> = metadata
                .map(|raw| serde_json::from_str(&raw).context("--metadata must be a JSON object"))
                .transpose()?;
            let outcome = state.ingest.ingest(&content, metadata.as_ref()).await?;
            info!("Stored chunk {}", outcome.id);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Ask { question, top_k } => {
            let answer = state.query.ask(&question, top_k).await?;
            println!("{}", serde_json::to_string_pretty(&answer)?);
        }
    }

    Ok(())
}
