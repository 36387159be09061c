use clap::Parser;
use sluice_server::SluiceServer;

#[derive(Parser)]
#[command(name = "sluice-server", about = "Adaptive query orchestration server")]
struct Args {
    #[arg(long, default_value = "config/sluice.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    SluiceServer::new().with_config(&args.config).run().await
}
