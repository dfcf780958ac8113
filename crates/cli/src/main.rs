use clap::{Parser, Subcommand};

use sitekb_cli::api_client::ApiClient;

#[derive(Parser)]
#[command(name = "sitekb")]
#[command(about = "Operational CLI for the knowledge base engine")]
struct Cli {
    /// Base URL of a running sitekb-server.
    #[arg(long, global = true, default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server in the foreground
    Serve {
        /// Path to a TOML config file; falls back to SITEKB_CONFIG, then
        /// defaults plus environment overrides
        #[arg(long)]
        config: Option<String>,
    },
    /// Trigger a crawl session for a site
    Crawl {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        site: String,
        #[arg(long)]
        base_url: String,
        /// Full recrawl instead of delta
        #[arg(long)]
        full: bool,
    },
    /// Show a crawl session's state and counters
    Status {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        site: String,
        #[arg(long)]
        session: String,
    },
    /// One-shot hybrid search
    Search {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        site: String,
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Rebuild the ANN index
    Reindex {
        /// ann (hnsw), ivfflat, or exact
        #[arg(long, default_value = "ann")]
        kind: String,
        #[arg(long)]
        concurrent: bool,
    },
    /// Budget operations
    Budget {
        #[command(subcommand)]
        command: BudgetCommands,
    },
    /// Corpus statistics for a site
    Stats {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        site: String,
    },
}

#[derive(Subcommand)]
enum BudgetCommands {
    /// Show current budget and usage
    Show {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        site: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Serve { config } = &cli.command {
        return serve(config.as_deref()).await;
    }

    let client = ApiClient::new(cli.api_url.clone());

    let output = match cli.command {
        Commands::Serve { .. } => unreachable!("handled above"),
        Commands::Crawl {
            tenant,
            site,
            base_url,
            full,
        } => client.start_crawl(&tenant, &site, &base_url, full).await?,
        Commands::Status {
            tenant,
            site,
            session,
        } => client.session_status(&tenant, &site, &session).await?,
        Commands::Search {
            tenant,
            site,
            query,
            top_k,
        } => client.search(&tenant, &site, &query, top_k).await?,
        Commands::Reindex { kind, concurrent } => client.reindex(&kind, concurrent).await?,
        Commands::Budget {
            command: BudgetCommands::Show { tenant, site },
        } => client.budget(&tenant, &site).await?,
        Commands::Stats { tenant, site } => client.stats(&tenant, &site).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Same wiring as the `sitekb-server` binary, reachable from the CLI.
async fn serve(config_path: Option<&str>) -> anyhow::Result<()> {
    use sitekb_common::SystemConfig;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match config_path {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::from_env()?,
    };
    let (state, background_cancel) = sitekb_api::build_state(&config).await?;

    tracing::info!(addr = %config.server.bind_addr, "serving via CLI");
    let result = sitekb_api::run(state, &config.server.bind_addr).await;
    background_cancel.cancel();
    result
}
