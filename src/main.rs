use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use carousel_cache::config;
use carousel_cache::host;
use carousel_cache::input;
use carousel_cache::tables::{DirectoryTables, ScreenRole};

#[derive(Parser)]
#[command(
    name = "carousel-cache",
    about = "Browse table images through an out-of-process preload cache"
)]
struct Cli {
    /// Directory with one subdirectory per table
    tables_dir: PathBuf,

    /// Which screen's image to load (table, backglass, dmd)
    #[arg(long)]
    role: Option<ScreenRole>,

    /// Maximum number of cached table images
    #[arg(long)]
    max_cache: Option<usize>,

    /// Tables preloaded on each side of the current one
    #[arg(long)]
    preload_radius: Option<usize>,

    /// Run a comma-separated command sequence (e.g. "0,n,n,p") instead of reading stdin
    #[arg(long)]
    script: Option<String>,

    /// Config file path (defaults to $XDG_CONFIG_HOME/carousel-cache/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output file path (logs go to stderr via RUST_LOG otherwise)
    #[arg(long)]
    log: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log.as_deref()) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(path: Option<&std::path::Path>) -> anyhow::Result<()> {
    match path {
        Some(log_path) => {
            let file = std::fs::File::create(log_path)
                .with_context(|| format!("failed to open log file {}", log_path.display()))?;
            env_logger::Builder::from_default_env()
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
        None => env_logger::init(),
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    // Load config file and merge CLI overrides
    let mut cfg = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    cfg.merge_cli(cli.role, cli.max_cache, cli.preload_radius);
    let config = cfg.resolve();

    let script = cli
        .script
        .as_deref()
        .map(input::parse_script)
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid --script: {e}"))?;

    let tables = DirectoryTables::scan(&cli.tables_dir)?;
    host::run(tables, config, script)
}
