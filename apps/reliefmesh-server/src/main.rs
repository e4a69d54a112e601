use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// ReliefMesh pipeline server.
#[derive(Debug, Parser)]
#[command(name = "reliefmesh-server")]
struct Cli {
    /// Path to the unified configuration file.
    #[arg(long, default_value = "reliefmesh.yaml")]
    config: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    reliefmesh_server::run_server(cli.config, cli.listen).await
}
