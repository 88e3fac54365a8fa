//! poliqarp - command-line client for poliqarpd.
//!
//! Connects to a running server, opens a corpus and prints query results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use poliqarp::{Client, ClientSettings, FindOptions, GroupFlags};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server host (overrides POLIQARP_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides POLIQARP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Session name (overrides POLIQARP_SESSION)
    #[arg(short, long)]
    session: Option<String>,

    /// Give up waiting for a query after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the server answers
    Ping,
    /// Print the server version
    Version,
    /// Print corpus statistics
    Stats {
        /// Corpus path, or :default
        corpus: String,
    },
    /// Print the number of results of a query
    Count { corpus: String, query: String },
    /// Print one page of results
    Find {
        corpus: String,
        query: String,
        /// Results per page (0 = all)
        #[arg(long, default_value_t = 0)]
        page_size: u64,
        /// Page to print, starting at 1
        #[arg(long, default_value_t = 1)]
        page: u64,
        /// Print only the result with this index
        #[arg(long)]
        index: Option<u64>,
        /// Retrieve grammatical tags for all groups
        #[arg(long)]
        tags: bool,
        /// Retrieve base forms for all groups
        #[arg(long)]
        lemmata: bool,
        /// Width of both short contexts
        #[arg(long)]
        context_width: Option<String>,
    },
    /// Print the long context of one result
    Context {
        corpus: String,
        query: String,
        index: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "poliqarp=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let mut settings = ClientSettings::from_env();
    if let Some(host) = cli.host.clone() {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(session) = cli.session.clone() {
        settings.session_name = session;
    }
    settings.wait_timeout = cli.timeout.map(std::time::Duration::from_secs);

    let mut client = Client::connect(settings.clone()).await.with_context(|| {
        format!(
            "Failed to connect to poliqarpd at {}:{}",
            settings.host, settings.port
        )
    })?;

    let result = run(&mut client, &cli).await;

    // Always release the session, even when the command failed.
    if let Err(e) = client.close().await {
        tracing::warn!("Failed to close session: {}", e);
    }
    result
}

async fn run(client: &mut Client, cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Ping => {
            let alive = client.ping().await?;
            println!("{}", if alive { "pong" } else { "no answer" });
        }
        Commands::Version => {
            println!("{}", client.version().await?);
        }
        Commands::Stats { corpus } => {
            open(client, corpus).await?;
            let stats = client.stats().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("segment tokens: {}", stats.segment_tokens);
                println!("segment types:  {}", stats.segment_types);
                println!("lemmata:        {}", stats.lemmata);
                println!("tags:           {}", stats.tags);
            }
        }
        Commands::Count { corpus, query } => {
            open(client, corpus).await?;
            println!("{}", client.count(query).await?);
        }
        Commands::Find {
            corpus,
            query,
            page_size,
            page,
            index,
            tags,
            lemmata,
            context_width,
        } => {
            if let Some(width) = context_width {
                let width: poliqarp::ContextWidth = width.parse()?;
                client.set_left_context_width(width.get().into()).await?;
                client.set_right_context_width(width.get().into()).await?;
            }
            if *tags {
                client.set_retrieve_tags(GroupFlags::ALL).await?;
            }
            if *lemmata {
                client.set_retrieve_lemmata(GroupFlags::ALL).await?;
            }
            open(client, corpus).await?;

            if let Some(index) = index {
                let excerpt = client.find_one(query, *index).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&excerpt)?);
                } else {
                    println!("{:>6}  {}", excerpt.index, excerpt);
                }
                return Ok(());
            }

            let result = client
                .find(query, &FindOptions::page(*page_size, *page))
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                for excerpt in &result {
                    println!("{:>6}  {}", excerpt.index, excerpt);
                }
                println!(
                    "-- page {} of {}{}",
                    result.page,
                    result.page_count,
                    if result.complete { "" } else { " (query still running)" }
                );
            }
        }
        Commands::Context {
            corpus,
            query,
            index,
        } => {
            open(client, corpus).await?;
            let context = client.context(query, *index).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&context)?);
            } else {
                println!("{}", context);
            }
        }
    }
    Ok(())
}

async fn open(client: &mut Client, corpus: &str) -> Result<()> {
    client
        .open_corpus(corpus)
        .await
        .with_context(|| format!("Failed to open corpus {}", corpus))
}
