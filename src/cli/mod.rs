//! CLI argument definitions for Reef.

use crate::config::{BindAddress, ConfigOverrides};
use crate::{Error, Result};
use crate::logging::DEFAULT_LOG_LEVEL;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("REEF_GIT_COMMIT"),
    " built ",
    env!("REEF_BUILD_TIMESTAMP"),
    ")"
);

/// Reef - A personal project, task and time tracker.
///
/// Runs a small web server; every open browser tab sees changes made in any
/// other tab as they happen.
#[derive(Parser, Debug)]
#[command(name = "reef")]
#[command(author, version, long_version = LONG_VERSION)]
#[command(about = "A personal project, task and time tracker", long_about = None)]
pub struct Cli {
    /// Config file to read instead of the system one. The file must exist.
    #[arg(short = 'c', long = "config", global = true, env = "REEF_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Directory holding reef.db (overrides `database-directory`)
    #[arg(short = 'd', long = "data-dir", global = true, env = "REEF_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Address to listen on as HOST:PORT. Repeat to listen on several;
    /// replaces every `bind` in the config file.
    #[arg(short = 'b', long = "bind", global = true, value_name = "HOST:PORT")]
    pub bind: Vec<BindAddress>,

    /// Log filter (e.g. `debug`, `reef=trace`). RUST_LOG takes precedence.
    #[arg(long = "log-level", global = true, default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Write JSON log lines to this file instead of stderr
    #[arg(long = "log-file", global = true, env = "REEF_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Runtime values that take precedence over the config file.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_file: self.config_file.clone(),
            database_directory: self.data_dir.clone(),
            bind_addresses: self.bind.clone(),
        }
    }
}

/// Top-level commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the server (default when no command is given)
    Serve,

    /// Print the effective configuration as KDL
    ///
    /// The output can be saved as config.kdl and edited.
    Config,

    /// Print a bcrypt hash for an `auth` user entry or an htpasswd line
    ///
    /// The password is read from the first line of standard input so it
    /// never shows up in the process list or shell history.
    HashPassword,
}

/// First line of `input` without its line ending.
pub fn read_password(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err(Error::InvalidArgument(
            "No password given on standard input".to_string(),
        ));
    }
    Ok(password.to_string())
}
