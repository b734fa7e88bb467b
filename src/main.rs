// vigil: Service entry point

use clap::Parser;

use vigil::Config;

#[derive(Parser)]
#[command(name = "vigil", version, about = "Self-hosted monitoring and alerting service")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<String>,

    /// Override the listen address
    #[arg(long, env = "VIGIL_BIND_ADDRESS")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).map_err(|e| anyhow::anyhow!(e.to_string()))?,
        None => Config::from_env(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    vigil::run(config)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}
