use clap::Parser;
use peerlink_lib::config::DiscoveryConfig;
use peerlink_lib::NodeOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about = "Discover nearby peers and connect to them")]
struct Cli {
    /// JSON config file. Defaults apply when it doesn't exist.
    #[arg(long, default_value = "peerlink.json")]
    config: PathBuf,

    /// Name advertised to peers. Defaults to the hostname.
    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    /// Peer to dial directly, as ip:port. Repeatable.
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Where the resolved own address is persisted.
    #[arg(long, default_value = "peerlink-settings.json")]
    settings: PathBuf,

    /// Overrides `connection.max_retries` from the config file.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Also write logs to a daily rolling file in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| names::Generator::default().next())
        .unwrap_or_else(|| "peerlink".to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _log_guard = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "peerlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    let mut config = DiscoveryConfig::load(&cli.config)?;
    if let Some(max_retries) = cli.max_retries {
        config.connection.max_retries = max_retries;
    }

    let name = cli.name.unwrap_or_else(default_name);
    tracing::info!("Starting peerlink as {}", name);

    peerlink_lib::run(NodeOptions {
        config,
        name,
        listen: cli.listen,
        settings_path: cli.settings,
        connect: cli.connect,
    })
    .await
}
