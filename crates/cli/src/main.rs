mod client_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use client_commands::{ApiClient, ClientAction, handle_client};

#[derive(Parser)]
#[command(name = "linkgate", about = "linkgate: chat-gateway session manager", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (otherwise `linkgate.{toml,yaml,json}` is discovered).
    #[arg(long, global = true, env = "LINKGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Talk to a running gateway.
    #[command(flatten)]
    Client(ClientAction),
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        let location = panic
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(%location, "panic: {panic}");
        default_hook(panic);
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);
    install_panic_hook();

    let mut config = linkgate_config::load_or_discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Gateway { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "linkgate starting");
            let factory = linkgate_gateway::driver_factory(&config)?;
            linkgate_gateway::start_gateway(config, factory).await
        },
        Commands::Client(action) => {
            let url = std::env::var("LINKGATE_URL").unwrap_or_else(|_| {
                let host = match config.server.bind.as_str() {
                    "0.0.0.0" | "::" => "127.0.0.1",
                    other => other,
                };
                format!("http://{host}:{}", config.server.port)
            });
            let client = ApiClient::new(&url, config.server.api_token.clone());
            handle_client(&client, action).await
        },
    }
}
