use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    fleetgate_auth::{ApiKey, keys::generate_secret},
    fleetgate_gateway::store::{MemoryStore, NoopSink},
};

#[derive(Parser)]
#[command(name = "fleetgate", about = "Fleetgate — control-plane gateway for fleet agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Override the configured bind address.
        #[arg(long)]
        bind: Option<String>,
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Mint credentials for a new agent (printed once; store them in the
    /// panel's database and on the agent).
    Keygen {
        /// Agent identifier the credentials belong to.
        #[arg(long)]
        agent_id: String,
        /// Permission scopes, e.g. `docker:*` (repeatable).
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command {
        Commands::Gateway { bind, port } => {
            let mut config = fleetgate_config::discover_and_load();
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            info!(bind = %config.gateway.bind, port = config.gateway.port, "starting gateway");
            // Standalone mode runs on the in-memory store; a panel
            // deployment passes its own FleetStore/EventSink instead.
            fleetgate_gateway::start_gateway(config, MemoryStore::new(), std::sync::Arc::new(NoopSink))
                .await
        },
        Commands::Keygen { agent_id, scopes } => {
            let key = ApiKey::generate();
            let secret = generate_secret();
            let out = serde_json::json!({
                "agent_id": agent_id,
                "api_key": key.plaintext,
                "api_key_prefix": key.prefix,
                "secret": secret,
                "scopes": scopes,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        },
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
