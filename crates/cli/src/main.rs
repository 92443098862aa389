use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "talkbridge")]
#[command(about = "Relay messages between a WhatsApp chat and a Nextcloud Talk conversation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: TALKBRIDGE_CONFIG_PATH or ~/.talkbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Validate the configuration and test the Nextcloud Talk connection.
    Check {
        /// Config file path (default: TALKBRIDGE_CONFIG_PATH or ~/.talkbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bridge until interrupted. Requires the WhatsApp sidecar to be running.
    Run {
        /// Config file path (default: TALKBRIDGE_CONFIG_PATH or ~/.talkbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Delay between Nextcloud poll cycles in milliseconds (default from config or 5000)
        #[arg(long, value_name = "MS")]
        poll_interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("talkbridge {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config).await {
                log::error!("check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            config,
            poll_interval_ms,
        }) => {
            if let Err(e) = run_bridge(config, poll_interval_ms).await {
                log::error!("failed to start bridge: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(talkbridge::config::default_config_path);
    let dir = talkbridge::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_check(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = talkbridge::config::load_config(config_path)?;
    config.validate()?;
    println!("configuration ok ({})", path.display());
    let cursor = talkbridge::bridge::check_nextcloud(&config).await?;
    println!("nextcloud talk reachable; polling would start after message {}", cursor);
    Ok(())
}

async fn run_bridge(
    config_path: Option<std::path::PathBuf>,
    poll_interval_ms: Option<u64>,
) -> anyhow::Result<()> {
    let (mut config, path) = talkbridge::config::load_config(config_path)?;
    if let Some(ms) = poll_interval_ms {
        config.nextcloud.poll_interval_ms = ms;
    }
    log::info!("starting whatsapp / nextcloud bridge (config {})", path.display());
    talkbridge::bridge::run_bridge(config).await
}
