mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use tm_core::config::Config;
use tm_core::ToolId;
use tm_engine::ToolRegistry;

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path);

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!(
        "Starting toolmatrix on {}:{}",
        config.server.host,
        config.server.port
    );

    tm_server::start(config).await?;
    Ok(())
}

fn load_strict(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Config::from_json(&contents)?)
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            load_strict(p)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        println!("Configuration loaded with {} warning(s):", warnings.len());
        for warning in &warnings {
            println!("  ! {warning}");
        }
    }
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Database: {}", config.server.db_path.display());
    println!("  Storage: {}", config.storage.root.display());
    println!(
        "  Workers: {} (max {} attempts, {} claims per {}s)",
        config.workers.concurrency,
        config.workers.max_attempts,
        config.workers.rate_limit.max_jobs,
        config.workers.rate_limit.window_secs
    );
    println!("  Tool commands: {}", config.tools.commands.len());

    Ok(())
}

fn list_tools(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path);
    let registry = ToolRegistry::from_config(&config.tools);

    for tool in ToolId::ALL {
        let status = if registry.contains(*tool) { "✓" } else { "✗" };
        println!("{status} {:<20} {}", tool.as_str(), tool.category());
    }

    println!();
    println!(
        "{} of {} tools have a handler configured",
        registry.len(),
        ToolId::ALL.len()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise pick defaults from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "toolmatrix=trace,tm_server=trace,tm_engine=trace,tm_db=debug,tm_core=debug,tower_http=debug".to_string()
        } else {
            "toolmatrix=info,tm_server=info,tm_engine=info,tm_db=info,tm_core=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Tools => list_tools(cli.config.as_deref()),
        Commands::Version => {
            println!("toolmatrix {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
