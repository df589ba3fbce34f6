//! KDL schema for config.kdl.
//!
//! This module provides:
//! - Rust structs representing the KDL schema
//! - Serialization/deserialization to/from KDL format
//! - Validation
//! - Default values

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 7651;
pub const DEFAULT_DATABASE_DIRECTORY: &str = "data";

/// A `host:port` pair the server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindAddress {
    pub host: String,
    pub port: u16,
    /// Serve HTTPS using the `tls` certificate
    pub https: bool,
}

impl BindAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            https: false,
        }
    }

    pub fn new_https(host: impl Into<String>, port: u16) -> Self {
        Self {
            https: true,
            ..Self::new(host, port)
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }
}

impl Default for BindAddress {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BindAddress {
    type Err = String;

    /// Parse `host:port`; IPv6 hosts are written in brackets (`[::1]:7651`).
    /// An `https://` prefix selects HTTPS, `http://` is accepted and ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (https, rest) = match s.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("https") => (true, rest),
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => (false, rest),
            Some((scheme, _)) => return Err(format!("Unknown scheme '{}' in '{}'", scheme, s)),
            None => (false, s),
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| format!("Expected HOST:PORT, got '{}'", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("Missing host in '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("Invalid port in '{}': {}", s, e))?;
        Ok(Self {
            https,
            ..Self::new(host, port)
        })
    }
}

/// Certificate and key used by every HTTPS bind address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

/// A user allowed through basic auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    /// bcrypt hash of the password (`$2b$...`)
    pub password_bcrypt: String,
}

/// Basic auth settings.
///
/// Auth is enabled when a user is listed or an htpasswd file is given. Users
/// from both sources are merged; an inline entry wins over a file entry with
/// the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub users: Vec<UserEntry>,
    /// Apache-style `user:bcrypt-hash` file
    pub htpasswd: Option<PathBuf>,
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !self.users.is_empty() || self.htpasswd.is_some()
    }
}

/// Whether `hash` looks like a bcrypt hash (`$2a$`, `$2b$`, `$2x$` or `$2y$`
/// followed by cost, salt and digest).
pub fn is_bcrypt_hash(hash: &str) -> bool {
    let bytes = hash.as_bytes();
    hash.len() == 60
        && bytes[0] == b'$'
        && bytes[1] == b'2'
        && matches!(bytes[2], b'a' | b'b' | b'x' | b'y')
        && bytes[3] == b'$'
        && bytes[4..6].iter().all(u8::is_ascii_digit)
        && bytes[6] == b'$'
}

/// Server settings stored in config.kdl.
///
/// # KDL Schema
///
/// ```kdl
/// database-directory "data"
/// ui-directory "ui/build"
/// bind "localhost" port=7651
/// bind "0.0.0.0" port=8443 https=#true
/// tls {
///     cert "/etc/reef/cert.pem"
///     key "/etc/reef/key.pem"
/// }
/// auth {
///     htpasswd "/etc/reef/htpasswd"
///     user "alice" password-bcrypt="<bcrypt hash of password>"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReefConfig {
    /// Directory holding `reef.db`
    pub database_directory: PathBuf,

    /// Static web UI to serve, if any
    pub ui_directory: Option<PathBuf>,

    /// Addresses to listen on
    pub bind_addresses: Vec<BindAddress>,

    /// Required when any bind address serves HTTPS
    pub tls: Option<TlsConfig>,

    pub auth: AuthConfig,
}

impl Default for ReefConfig {
    fn default() -> Self {
        Self {
            database_directory: PathBuf::from(DEFAULT_DATABASE_DIRECTORY),
            ui_directory: None,
            bind_addresses: vec![BindAddress::default()],
            tls: None,
            auth: AuthConfig::default(),
        }
    }
}

impl ReefConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config values.
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_addresses.is_empty() {
            return Err("At least one bind address is required".to_string());
        }
        for address in &self.bind_addresses {
            if address.host.is_empty() {
                return Err("Bind address host cannot be empty".to_string());
            }
            if address.port == 0 {
                return Err(format!("Bind address {} must have a non-zero port", address));
            }
            if address.https && self.tls.is_none() {
                return Err(format!(
                    "Bind address {} serves HTTPS but no tls block is configured",
                    address
                ));
            }
        }
        for user in &self.auth.users {
            if user.name.is_empty() || user.name.contains(':') {
                return Err(format!("Invalid auth user name '{}'", user.name));
            }
            if !is_bcrypt_hash(&user.password_bcrypt) {
                return Err(format!(
                    "password-bcrypt for user '{}' is not a bcrypt hash",
                    user.name
                ));
            }
        }
        Ok(())
    }

    /// Parse config from a KDL document.
    ///
    /// Keys that are absent keep their defaults. `bind` nodes, when present,
    /// replace the default bind address.
    pub fn from_kdl(doc: &KdlDocument) -> Result<Self, String> {
        let mut config = Self::new();

        if let Some(node) = doc.get("database-directory") {
            config.database_directory = PathBuf::from(first_string(node)?);
        }

        if let Some(node) = doc.get("ui-directory") {
            config.ui_directory = Some(PathBuf::from(first_string(node)?));
        }

        let binds: Vec<&KdlNode> = doc
            .nodes()
            .iter()
            .filter(|n| n.name().value() == "bind")
            .collect();
        if !binds.is_empty() {
            config.bind_addresses = binds
                .into_iter()
                .map(parse_bind)
                .collect::<Result<_, _>>()?;
        }

        if let Some(node) = doc.get("tls") {
            config.tls = Some(parse_tls(node)?);
        }

        if let Some(node) = doc.get("auth") {
            if let Some(children) = node.children() {
                for child in children.nodes() {
                    match child.name().value() {
                        "user" => config.auth.users.push(parse_user(child)?),
                        "htpasswd" => {
                            config.auth.htpasswd = Some(PathBuf::from(first_string(child)?))
                        }
                        other => return Err(format!("Unknown auth setting '{}'", other)),
                    }
                }
            }
        }

        Ok(config)
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        let mut node = KdlNode::new("database-directory");
        node.push(KdlEntry::new(KdlValue::String(
            self.database_directory.display().to_string(),
        )));
        doc.nodes_mut().push(node);

        if let Some(ref ui) = self.ui_directory {
            let mut node = KdlNode::new("ui-directory");
            node.push(KdlEntry::new(KdlValue::String(ui.display().to_string())));
            doc.nodes_mut().push(node);
        }

        for address in &self.bind_addresses {
            let mut node = KdlNode::new("bind");
            node.push(KdlEntry::new(KdlValue::String(address.host.clone())));
            node.push(KdlEntry::new_prop(
                "port",
                KdlValue::Integer(address.port as i128),
            ));
            if address.https {
                node.push(KdlEntry::new_prop("https", KdlValue::Bool(true)));
            }
            doc.nodes_mut().push(node);
        }

        if let Some(ref tls) = self.tls {
            let mut children = KdlDocument::new();
            for (name, path) in [("cert", &tls.cert), ("key", &tls.key)] {
                let mut node = KdlNode::new(name);
                node.push(KdlEntry::new(KdlValue::String(path.display().to_string())));
                children.nodes_mut().push(node);
            }
            let mut node = KdlNode::new("tls");
            node.set_children(children);
            doc.nodes_mut().push(node);
        }

        if self.auth.is_enabled() {
            let mut children = KdlDocument::new();
            if let Some(ref path) = self.auth.htpasswd {
                let mut node = KdlNode::new("htpasswd");
                node.push(KdlEntry::new(KdlValue::String(path.display().to_string())));
                children.nodes_mut().push(node);
            }
            for user in &self.auth.users {
                let mut node = KdlNode::new("user");
                node.push(KdlEntry::new(KdlValue::String(user.name.clone())));
                node.push(KdlEntry::new_prop(
                    "password-bcrypt",
                    KdlValue::String(user.password_bcrypt.clone()),
                ));
                children.nodes_mut().push(node);
            }
            let mut node = KdlNode::new("auth");
            node.set_children(children);
            doc.nodes_mut().push(node);
        }

        doc
    }
}

fn first_string(node: &KdlNode) -> Result<String, String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| format!("'{}' expects a string argument", node.name().value()))
}

fn property<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(name))
        .map(|e| e.value())
}

fn parse_bind(node: &KdlNode) -> Result<BindAddress, String> {
    let host = first_string(node)?;
    let port = match property(node, "port") {
        Some(value) => value
            .as_integer()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| format!("Invalid port for bind '{}'", host))?,
        None => DEFAULT_PORT,
    };
    let https = match property(node, "https") {
        Some(value) => value
            .as_bool()
            .ok_or_else(|| format!("'https' for bind '{}' must be #true or #false", host))?,
        None => false,
    };
    Ok(BindAddress { host, port, https })
}

fn parse_tls(node: &KdlNode) -> Result<TlsConfig, String> {
    let children = node
        .children()
        .ok_or_else(|| "'tls' expects a block with cert and key".to_string())?;
    let path = |name: &str| -> Result<PathBuf, String> {
        let child = children
            .get(name)
            .ok_or_else(|| format!("'tls' is missing '{}'", name))?;
        Ok(PathBuf::from(first_string(child)?))
    };
    Ok(TlsConfig {
        cert: path("cert")?,
        key: path("key")?,
    })
}

fn parse_user(node: &KdlNode) -> Result<UserEntry, String> {
    let name = first_string(node)?;
    let password_bcrypt = property(node, "password-bcrypt")
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| format!("User '{}' is missing password-bcrypt", name))?;
    Ok(UserEntry {
        name,
        password_bcrypt,
    })
}
