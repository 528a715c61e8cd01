use appforge_cli::{init_logging, run_server, Config};
use clap::Parser;
use std::net::IpAddr;
use std::process;

#[derive(Parser)]
#[command(name = "appforge")]
#[command(about = "AppForge sandbox control server")]
#[command(version)]
struct Cli {
    /// Control server port (overrides APPFORGE_API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Control server bind address (overrides APPFORGE_API_HOST)
    #[arg(long)]
    host: Option<IpAddr>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(port) = cli.port.filter(|p| *p != 0) {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }

    run_server(config).await
}
