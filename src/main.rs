use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trust_node::node::TrustNode;
use trust_node::storage::SqliteStorage;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 8080)]
    api_port: u16,

    #[arg(short, long, default_value_t = 9015)]
    p2p_port: u16,

    #[arg(short, long)]
    user: String,

    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    #[arg(long, value_delimiter = ',')]
    bootstrap_peers: Vec<String>,
}

/// 0 on clean shutdown, 1 on fatal init error, 2 on invalid arguments
/// (clap's own default for parse failures) — spec §4.6.
#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trust_node=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting trust node for user: {}", args.user);
    info!("API port: {}, P2P port: {}", args.api_port, args.p2p_port);

    let db_path = args.data_dir.join(format!("{}.db", args.user));
    let storage = match SqliteStorage::new(&db_path).await {
        Ok(storage) => storage,
        Err(e) => {
            error!("Failed to open store at {}: {e:?}", db_path.display());
            return std::process::ExitCode::FAILURE;
        }
    };

    let identity_path = args.data_dir.join(format!("{}.key", args.user));
    let (node, api_handle) = match TrustNode::new(
        args.p2p_port,
        args.api_port,
        storage,
        args.bootstrap_peers,
        &identity_path,
    )
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to initialize node: {e:?}");
            return std::process::ExitCode::FAILURE;
        }
    };

    tokio::select! {
        res = node.run() => {
            if let Err(e) = res {
                error!("Node error: {e:?}");
                return std::process::ExitCode::FAILURE;
            }
        }
        res = api_handle => {
            match res {
                Ok(Err(e)) => {
                    error!("API server error: {e:?}");
                    return std::process::ExitCode::FAILURE;
                }
                Err(e) => {
                    error!("API server task panicked: {e:?}");
                    return std::process::ExitCode::FAILURE;
                }
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Shutdown complete");
    std::process::ExitCode::SUCCESS
}
