#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use mirrorgate::server::bootstrap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mirrorgate", about = "Registry-aware reverse proxy for container image mirrors")]
struct Cli {
    /// Path to proxy config file
    #[arg(short, long, default_value = "mirrorgate.toml")]
    config: PathBuf,

    /// Listen address (overrides config and LISTEN_ADDR)
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
    }))
}
