//! HTTP basic auth.
//!
//! Passwords are never stored; the config and htpasswd files hold bcrypt
//! hashes. User names are matched in constant time and a request for an
//! unknown user still pays for one bcrypt verification.

use crate::config::{AuthConfig, is_bcrypt_hash};
use crate::{Error, Result};
use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::path::Path;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

const REALM: &str = "Basic realm=\"Reef\"";

/// bcrypt hash of a password at the default cost, for `password-bcrypt` or an
/// htpasswd line.
pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| Error::Other(format!("Unable to hash password: {}", e)))
}

/// Read `user:hash` lines from an htpasswd file. Blank lines and `#` comments
/// are skipped; only bcrypt hashes are accepted.
pub fn load_htpasswd(path: &Path) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Unable to read htpasswd file {}: {}", path.display(), e))
    })?;
    parse_htpasswd(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

fn parse_htpasswd(content: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut users = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (user, hash) = line
            .split_once(':')
            .ok_or_else(|| format!("line {}: expected user:hash", number + 1))?;
        if !is_bcrypt_hash(hash) {
            return Err(format!(
                "line {}: hash for '{}' is not a bcrypt hash",
                number + 1,
                user
            ));
        }
        users.push((user.to_string(), hash.to_string()));
    }
    Ok(users)
}

/// Users allowed through.
#[derive(Debug, Clone)]
pub struct Credentials {
    users: Vec<(String, String)>,
    /// Verified against when the user is unknown
    decoy: String,
}

impl Credentials {
    /// `None` when auth is not configured.
    pub fn from_config(auth: &AuthConfig) -> Result<Option<Self>> {
        if !auth.is_enabled() {
            return Ok(None);
        }

        let mut users: Vec<(String, String)> = Vec::new();
        if let Some(ref path) = auth.htpasswd {
            let loaded = load_htpasswd(path)?;
            info!(path = %path.display(), users = loaded.len(), "loaded htpasswd file");
            users.extend(loaded);
        }
        for user in &auth.users {
            users.retain(|(name, _)| name != &user.name);
            users.push((user.name.clone(), user.password_bcrypt.clone()));
        }
        Self::new(users).map(Some)
    }

    /// Build from `(user, bcrypt hash)` pairs.
    pub fn new(users: Vec<(String, String)>) -> Result<Self> {
        // The decoy costs as much as a real entry.
        let cost = users
            .first()
            .and_then(|(_, hash)| hash.get(4..6))
            .and_then(|cost| cost.parse().ok())
            .unwrap_or(bcrypt::DEFAULT_COST);
        let decoy = bcrypt::hash("reef", cost)
            .map_err(|e| Error::Other(format!("Unable to hash password: {}", e)))?;
        Ok(Self { users, decoy })
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        let mut found: Option<&str> = None;
        for (name, hash) in &self.users {
            if bool::from(name.as_bytes().ct_eq(user.as_bytes())) {
                found = Some(hash.as_str());
            }
        }
        let hash = found.unwrap_or(self.decoy.as_str());
        let matches = bcrypt::verify(password, hash).unwrap_or(false);
        matches && found.is_some()
    }

    /// Check an `Authorization` header value.
    pub fn check_header(&self, value: &str) -> bool {
        let Some((scheme, encoded)) = value.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((user, password)) => self.verify(user, password),
            None => false,
        }
    }
}

/// Middleware rejecting requests without valid credentials.
pub async fn require_basic_auth(
    State(credentials): State<Arc<Credentials>>,
    request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    // bcrypt verification blocks for milliseconds.
    let authorized = match header_value {
        Some(value) => tokio::task::spawn_blocking(move || credentials.check_header(&value))
            .await
            .unwrap_or(false),
        None => false,
    };

    if authorized {
        return next.run(request).await;
    }

    debug!(path = %request.uri().path(), "rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, REALM)],
        "Unauthorized",
    )
        .into_response()
}
