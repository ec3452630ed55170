//! Registry credentials from the Docker client configuration.
//!
//! Reads `$DOCKER_CONFIG/config.json` (default `~/.docker/config.json`) and
//! returns basic-auth credentials for a registry host. Credential helpers are
//! not invoked; registries without an inline entry are accessed anonymously.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One `auths` entry of the Docker config.
#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Username/password pair for a registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Read-only view over a Docker client config file.
#[derive(Debug, Default)]
pub struct DockerConfig {
    auths: HashMap<String, Credentials>,
}

impl DockerConfig {
    /// Loads the config from the default location. A missing file yields an
    /// empty config.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
    }

    /// Loads the config from `path`. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no docker config, using anonymous registry access");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&data)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Parses the JSON contents of a Docker config.
    pub fn parse(data: &str) -> Result<Self> {
        let file: DockerConfigFile = serde_json::from_str(data)?;
        let mut auths = HashMap::new();

        for (server, entry) in file.auths {
            if let Some(creds) = decode_entry(&entry)? {
                auths.insert(normalize_registry(&server), creds);
            }
        }

        Ok(Self { auths })
    }

    /// Returns credentials for a registry host, if configured.
    pub fn get(&self, registry: &str) -> Option<&Credentials> {
        self.auths.get(&normalize_registry(registry))
    }
}

fn decode_entry(entry: &AuthEntry) -> Result<Option<Credentials>> {
    if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
        let decoded = STANDARD
            .decode(auth.trim())
            .map_err(|e| Error::Serialization(format!("invalid auth encoding: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| Error::Serialization(format!("invalid auth encoding: {}", e)))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::Serialization("auth must be user:password".to_string()))?;
        return Ok(Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }));
    }

    match (&entry.username, &entry.password) {
        (Some(username), Some(password)) => Ok(Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        })),
        _ => Ok(None),
    }
}

/// Normalizes registry keys so `docker.io`, `https://index.docker.io/v1/`
/// and `registry-1.docker.io` all refer to the same entry.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(&r);
    let host = r.split('/').next().unwrap_or(r);
    match host {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_base64_auth() {
        let auth = STANDARD.encode("user1:pass1");
        let config = DockerConfig::parse(&format!(
            r#"{{"auths": {{"https://index.docker.io/v1/": {{"auth": "{}"}}}}}}"#,
            auth
        ))
        .unwrap();

        let creds = config.get("docker.io").unwrap();
        assert_eq!(creds.username, "user1");
        assert_eq!(creds.password, "pass1");
    }

    #[test]
    fn test_parse_username_password() {
        let config = DockerConfig::parse(
            r#"{"auths": {"ghcr.io": {"username": "bot", "password": "token"}}}"#,
        )
        .unwrap();

        assert_eq!(config.get("GHCR.io").unwrap().password, "token");
        assert!(config.get("quay.io").is_none());
    }

    #[test]
    fn test_entries_without_credentials_are_skipped() {
        let config = DockerConfig::parse(r#"{"auths": {"quay.io": {}}, "credsStore": "desktop"}"#).unwrap();
        assert!(config.get("quay.io").is_none());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let config = DockerConfig::load(&dir.path().join("config.json")).unwrap();
        assert!(config.get("ghcr.io").is_none());
    }

    #[test]
    fn test_malformed_auth_rejected() {
        let auth = STANDARD.encode("no-colon");
        let result = DockerConfig::parse(&format!(r#"{{"auths": {{"ghcr.io": {{"auth": "{}"}}}}}}"#, auth));
        assert!(result.is_err());
    }
}
