mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memgate::config::GatewayConfig;
use memgate::server;

#[derive(Parser)]
#[command(name = "memgate", version, about = "Identity and device binding gateway for AI agent memory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API and the WebSocket gateway
    Serve,
    /// Serve the memory tools over MCP stdio for one API key
    Stdio {
        /// API key to authenticate with (sk-memgate-...)
        #[arg(long)]
        api_key: String,
        /// Client application name to attribute memories to
        #[arg(long)]
        app: Option<String>,
        /// Bound device (MAC address or endpoint URL) to attribute memories to
        #[arg(long)]
        device: Option<String>,
    },
    /// Show an account's usage for the last 30 days and the current cycle
    Stats {
        #[arg(long)]
        user: String,
    },
    /// Manage API keys
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
    /// Manage billing plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
    /// Manage accounts
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Check database health
    Doctor,
}

#[derive(Subcommand)]
enum AccountAction {
    /// Soft-delete an account and revoke its credentials
    Delete {
        #[arg(long)]
        user: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Create an API key
    Create {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// List API keys
    List {
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Assign a plan to an account
    Set {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "custom")]
        plan: String,
        /// Requests per cycle; omit for unlimited
        #[arg(long)]
        quota: Option<u64>,
        /// monthly, yearly, days:N or months:N
        #[arg(long, default_value = "monthly")]
        cycle: String,
        /// Cycle anchor (RFC 3339 or YYYY-MM-DD); defaults to now
        #[arg(long)]
        anchor: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load()?;

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => server::serve(config).await?,
        Command::Stdio {
            api_key,
            app,
            device,
        } => server::serve_stdio(config, api_key, app, device).await?,
        Command::Stats { user } => cli::stats::stats(&config, &user)?,
        Command::Keys { action } => match action {
            KeysAction::Create { user, name } => cli::keys::create(&config, &user, name.as_deref())?,
            KeysAction::List { user } => cli::keys::list(&config, &user)?,
        },
        Command::Plan { action } => match action {
            PlanAction::Set {
                user,
                plan,
                quota,
                cycle,
                anchor,
            } => cli::plan::set(&config, &user, &plan, quota, &cycle, anchor.as_deref())?,
        },
        Command::Account { action } => match action {
            AccountAction::Delete { user, yes } => cli::account::delete(&config, &user, yes)?,
        },
        Command::Doctor => cli::doctor::doctor(&config)?,
    }

    Ok(())
}
