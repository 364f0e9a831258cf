#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use buffy::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "buffy", about = "Configurable HTTP reverse proxy with admission and availability control")]
struct Cli {
    /// Path to the configuration file (YAML or JSON).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Print the build version and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("buffy {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some(config_path) = cli.config else {
        eprintln!("buffy: fatal: -c <config path> is required");
        std::process::exit(1);
    };

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs { config_path }))
}
