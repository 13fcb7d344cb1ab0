use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use polygate_core::config::Config;

#[derive(Parser)]
#[command(
    name = "polygate",
    about = "Multi-provider LLM API gateway — one endpoint, many upstreams",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (overrides the config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate the config file and exit
    Check,
}

fn init_logging(verbose: bool, to_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    if to_file {
        let appender = tracing_appender::rolling::daily("logs", "polygate.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = PathBuf::from(&cli.config);

    match cli.command {
        Commands::Check => match Config::load(&config_path) {
            Ok(config) => {
                println!(
                    "config ok: port {}, {} client key(s), {} credential section(s)",
                    config.port(),
                    config.api_keys.len(),
                    config.gemini_api_key.len()
                        + config.claude_api_key.len()
                        + config.codex_api_key.len()
                        + config.openai_compatibility.len(),
                );
            }
            Err(e) => {
                eprintln!("config invalid: {e}");
                std::process::exit(1);
            }
        },
        Commands::Serve { port } => {
            let (to_file, debug) = Config::load(&config_path)
                .map(|c| (c.logging_to_file, c.debug))
                .unwrap_or((false, false));
            let _guard = init_logging(cli.verbose || debug, to_file);

            if let Err(e) = polygate_gateway::server::serve(config_path, port).await {
                error!(%e, "startup failed");
                std::process::exit(e.exit_code());
            }
        }
    }
}
