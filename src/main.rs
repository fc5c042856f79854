#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use relaykeep::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relaykeepd", about = "Dynamic reverse proxy with a live service-registration control plane")]
struct Cli {
    /// Path to the process config file (.toml or .json)
    #[arg(short, long, default_value = "relaykeep.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
    }))
}
