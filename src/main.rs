//! Reef CLI - A personal project, task and time tracker.

use clap::Parser;
use reef::cli::{Cli, Commands, read_password};
use reef::config::resolve_config;
use reef::{Error, Result, logging, web};
use std::io;
use std::process;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> Result<()> {
    let overrides = cli.overrides();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            // Dropping the guard flushes any buffered log lines.
            let _guard = logging::init(&cli.log_level, cli.log_file.as_deref())?;
            let resolved = resolve_config(&overrides)?;
            tracing::info!(source = %resolved.source, "loaded configuration");

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Other(format!("Failed to create runtime: {}", e)))?
                .block_on(web::start_server(&resolved.config))
        }
        Commands::Config => {
            let resolved = resolve_config(&overrides)?;
            let mut doc = resolved.config.to_kdl();
            doc.autoformat();
            println!("// Resolved from {}", resolved.source);
            print!("{}", doc);
            Ok(())
        }
        Commands::HashPassword => {
            let password = read_password(io::stdin().lock())?;
            println!("{}", web::hash_password(&password)?);
            Ok(())
        }
    }
}
