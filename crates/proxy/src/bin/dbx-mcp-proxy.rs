use clap::Parser;
use dbx_mcp_proxy::{orchestrator, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Logs must stay off stdout; it belongs to the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("dbx-mcp-proxy: {err:#}");
            std::process::exit(orchestrator::EXIT_USAGE);
        }
    };

    match orchestrator::run(config).await {
        Ok(reason) => std::process::exit(reason.code()),
        Err(err) => {
            eprintln!("dbx-mcp-proxy: {err:#}");
            std::process::exit(orchestrator::EXIT_STARTUP);
        }
    }
}
