//! Configuration for the Reef server.
//!
//! Settings live in a single KDL file, `config.kdl`:
//!
//! - `database-directory` - Directory holding `reef.db` (default `data`)
//! - `ui-directory` - Static web UI to serve (optional)
//! - `bind` - Address to listen on, repeatable (default `localhost:7651`),
//!   `https=#true` to serve TLS
//! - `tls` block - Certificate and key for HTTPS bind addresses
//! - `auth` block - Users allowed through HTTP basic auth, inline
//!   (`password-bcrypt`) or from an `htpasswd` file
//!
//! ## Precedence
//!
//! CLI flag > config file > defaults
//!
//! Use the [`resolver`] module for precedence resolution.

pub mod resolver;
pub mod schema;

pub use resolver::{
    CONFIG_FILE_NAME, ConfigOverrides, ConfigSource, ResolvedConfig, load_config_file,
    resolve_config, system_config_path,
};
pub use schema::{
    AuthConfig, BindAddress, DEFAULT_DATABASE_DIRECTORY, DEFAULT_HOST, DEFAULT_PORT, ReefConfig,
    TlsConfig, UserEntry, is_bcrypt_hash,
};
