//! Precedence resolution for the server configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (`--data-dir`, `--bind`) and their environment variables
//! 2. The file named by `--config` / `REEF_CONFIG` (must exist)
//! 3. The system config (`<config_dir>/reef/config.kdl`), if present
//! 4. Built-in defaults

use super::schema::{BindAddress, ReefConfig};
use crate::{Error, Result};
use kdl::KdlDocument;
use std::fmt;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.kdl";

/// Where the base configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Given explicitly on the command line or in the environment
    Explicit(PathBuf),
    /// Found at the system location
    System(PathBuf),
    /// Built-in default values
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Explicit(path) => write!(f, "{}", path.display()),
            ConfigSource::System(path) => write!(f, "{} (system)", path.display()),
            ConfigSource::Default => write!(f, "defaults"),
        }
    }
}

/// Values given at runtime that take precedence over any file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub database_directory: Option<PathBuf>,
    /// Replaces every configured bind address when non-empty
    pub bind_addresses: Vec<BindAddress>,
}

/// A validated configuration together with its origin.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: ReefConfig,
    pub source: ConfigSource,
}

/// Location of the system config file.
pub fn system_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("reef").join(CONFIG_FILE_NAME))
}

/// Read and parse a config file.
pub fn load_config_file(path: &Path) -> Result<ReefConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Unable to read {}: {}", path.display(), e))
    })?;
    let doc: KdlDocument = content
        .parse()
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    ReefConfig::from_kdl(&doc).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Resolve the configuration with full precedence.
pub fn resolve_config(overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    resolve_config_with(overrides, system_config_path())
}

fn resolve_config_with(
    overrides: &ConfigOverrides,
    system_path: Option<PathBuf>,
) -> Result<ResolvedConfig> {
    let (mut config, source) = match (&overrides.config_file, system_path) {
        (Some(path), _) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            (load_config_file(path)?, ConfigSource::Explicit(path.clone()))
        }
        (None, Some(path)) if path.exists() => {
            (load_config_file(&path)?, ConfigSource::System(path))
        }
        (None, _) => (ReefConfig::default(), ConfigSource::Default),
    };

    if let Some(ref dir) = overrides.database_directory {
        config.database_directory = dir.clone();
    }
    if !overrides.bind_addresses.is_empty() {
        config.bind_addresses = overrides.bind_addresses.clone();
    }

    config.validate().map_err(Error::Config)?;

    Ok(ResolvedConfig { config, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_any_file() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.kdl");

        let resolved = resolve_config_with(&ConfigOverrides::default(), Some(missing)).unwrap();
        assert_eq!(resolved.source, ConfigSource::Default);
        assert_eq!(resolved.config, ReefConfig::default());
    }

    #[test]
    fn test_system_file_is_used() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, r#"database-directory "/srv/reef""#);

        let resolved =
            resolve_config_with(&ConfigOverrides::default(), Some(path.clone())).unwrap();
        assert_eq!(resolved.source, ConfigSource::System(path));
        assert_eq!(resolved.config.database_directory, PathBuf::from("/srv/reef"));
    }

    #[test]
    fn test_explicit_file_wins_over_system() {
        let temp = TempDir::new().unwrap();
        let system = write_config(&temp, r#"database-directory "/system""#);
        let explicit = temp.path().join("explicit.kdl");
        std::fs::write(&explicit, r#"database-directory "/explicit""#).unwrap();

        let overrides = ConfigOverrides {
            config_file: Some(explicit.clone()),
            ..Default::default()
        };
        let resolved = resolve_config_with(&overrides, Some(system)).unwrap();
        assert_eq!(resolved.source, ConfigSource::Explicit(explicit));
        assert_eq!(resolved.config.database_directory, PathBuf::from("/explicit"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let overrides = ConfigOverrides {
            config_file: Some(temp.path().join("missing.kdl")),
            ..Default::default()
        };
        let err = resolve_config_with(&overrides, None).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
            database-directory "/from-file"
            bind "0.0.0.0" port=8080
        "#,
        );

        let overrides = ConfigOverrides {
            config_file: Some(path),
            database_directory: Some(PathBuf::from("/from-cli")),
            bind_addresses: vec![BindAddress::new("127.0.0.1", 9999)],
        };
        let resolved = resolve_config_with(&overrides, None).unwrap();
        assert_eq!(resolved.config.database_directory, PathBuf::from("/from-cli"));
        assert_eq!(
            resolved.config.bind_addresses,
            vec![BindAddress::new("127.0.0.1", 9999)]
        );
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, "bind \"localhost\" port=0");

        let overrides = ConfigOverrides {
            config_file: Some(path),
            ..Default::default()
        };
        let err = resolve_config_with(&overrides, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unparseable_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, "bind {{{");

        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
