use clap::Parser;
use mockingdb::{config::Config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Attempt to load config before initializing logs to pick up log_level from file
    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Log filter precedence: CLI (--log-level / MOCKINGDB_LOG_LEVEL)
    // > RUST_LOG (env) > config.toml log_level > default("info")
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    let cfg = cfg_file.with_overrides(
        cli.listen_addr.clone(),
        cli.log_level.clone(),
        cli.max_connections,
    );
    cfg.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(listen_addr = %cfg.listen_addr, "starting mockingdb");

    if let Err(e) = server::run(cfg).await {
        tracing::error!(error = %format!("{e:?}"), "server terminated with error");
    }

    Ok(())
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "mockingdb",
    version,
    about = "Mongo wire server over generative collection models"
)]
struct Cli {
    /// Path to config TOML file
    #[arg(short = 'c', long = "config", env = "MOCKINGDB_CONFIG")]
    config: Option<String>,

    /// Listen address for the server (e.g., 127.0.0.1:27017)
    #[arg(long = "listen-addr", env = "MOCKINGDB_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Log level or filter spec (e.g., info or info,mockingdb=debug)
    #[arg(long = "log-level", env = "MOCKINGDB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Maximum number of concurrent client connections
    #[arg(long = "max-connections", env = "MOCKINGDB_MAX_CONNECTIONS")]
    max_connections: Option<usize>,
}
