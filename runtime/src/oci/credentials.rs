//! Registry credentials from a Docker `config.json`.
//!
//! Accepts the `auths` map written by `docker login` and `oc registry login`:
//! each entry carries either `auth` (base64 of `user:password`) or explicit
//! `username` and `password`. The file is read once at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ci_mirror_core::error::{MirrorError, Result};
use serde::Deserialize;

use super::registry::RegistryAuth;

#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Credentials keyed by registry host or repository prefix.
#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    path: Option<PathBuf>,
    credentials: HashMap<String, (String, String)>,
}

impl DockerConfig {
    /// Load a config file. A missing or unparseable file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::CredentialsError(format!(
                "failed to read registry config {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config = Self::parse(&data).map_err(|e| {
            MirrorError::CredentialsError(format!("{}: {}", path.display(), e))
        })?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse the JSON content of a config file.
    pub fn parse(data: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(data).map_err(|e| {
            MirrorError::CredentialsError(format!("failed to parse registry config: {}", e))
        })?;

        let mut credentials = HashMap::new();
        for (registry, entry) in file.auths {
            let pair = decode_entry(&entry).map_err(|message| {
                MirrorError::CredentialsError(format!("registry {}: {}", registry, message))
            })?;
            if let Some(pair) = pair {
                credentials.insert(normalize_registry(&registry), pair);
            }
        }

        Ok(Self {
            path: None,
            credentials,
        })
    }

    /// Credentials for a pull spec or repository path.
    ///
    /// The longest configured key that is the spec's registry host or a
    /// path prefix of its repository wins; otherwise anonymous.
    pub fn auth_for(&self, spec: &str) -> RegistryAuth {
        let normalized = normalize_registry(spec);
        let target = strip_tag(&normalized);

        self.credentials
            .iter()
            .filter(|(key, _)| {
                target == key.as_str()
                    || target
                        .strip_prefix(key.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(key, _)| key.len())
            .map_or_else(RegistryAuth::anonymous, |(_, (user, password))| {
                RegistryAuth::basic(user, password)
            })
    }

    /// Registries with configured credentials, sorted.
    pub fn registries(&self) -> Vec<String> {
        let mut registries: Vec<String> = self.credentials.keys().cloned().collect();
        registries.sort();
        registries
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn decode_entry(entry: &AuthEntry) -> std::result::Result<Option<(String, String)>, String> {
    if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
        let decoded = STANDARD
            .decode(auth.trim())
            .map_err(|e| format!("invalid base64 auth: {}", e))?;
        let decoded =
            String::from_utf8(decoded).map_err(|e| format!("auth is not UTF-8: {}", e))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| "auth must decode to user:password".to_string())?;
        return Ok(Some((user.to_string(), password.to_string())));
    }
    match (&entry.username, &entry.password) {
        (Some(user), Some(password)) => Ok(Some((user.clone(), password.clone()))),
        _ => Ok(None),
    }
}

/// Drop the tag or digest of a pull spec, keeping a port on the host.
fn strip_tag(spec: &str) -> &str {
    let spec = spec.split('@').next().unwrap_or(spec);
    let last_slash = spec.rfind('/').map_or(0, |i| i + 1);
    match spec[last_slash..].rfind(':') {
        Some(colon) if last_slash > 0 => &spec[..last_slash + colon],
        _ => spec,
    }
}

/// Normalize registry keys: drop the scheme and a bare `/v1/` or `/v2/` API
/// path, fold Docker Hub aliases, lowercase the host.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(r)
        .trim_end_matches('/');

    let (host, path) = match r.split_once('/') {
        Some((_, "v1" | "v2")) | None => (r.split('/').next().unwrap_or(r), None),
        Some((host, path)) => (host, Some(path)),
    };
    let host = match host.to_lowercase().as_str() {
        "docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    };
    match path {
        Some(path) => format!("{}/{}", host, path),
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn basic(auth: &RegistryAuth) -> Option<(String, String)> {
        auth.credentials()
            .map(|(u, p)| (u.to_string(), p.to_string()))
    }

    #[test]
    fn test_base64_auth() {
        let encoded = STANDARD.encode("robot:s3cret");
        let config =
            DockerConfig::parse(&format!(r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#, encoded))
                .unwrap();
        let auth = config.auth_for("quay.io/openshift/ci:ci_clonerefs_latest");
        assert_eq!(basic(&auth), Some(("robot".to_string(), "s3cret".to_string())));
    }

    #[test]
    fn test_explicit_username_password() {
        let config = DockerConfig::parse(
            r#"{"auths":{"https://registry.ci.openshift.org/":{"username":"u","password":"p:with:colons"}}}"#,
        )
        .unwrap();
        let auth = config.auth_for("registry.ci.openshift.org/ci/clonerefs:latest");
        assert_eq!(basic(&auth), Some(("u".to_string(), "p:with:colons".to_string())));
        assert_eq!(config.registries(), vec!["registry.ci.openshift.org"]);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let host = STANDARD.encode("host:h");
        let repo = STANDARD.encode("repo:r");
        let config = DockerConfig::parse(&format!(
            r#"{{"auths":{{"quay.io":{{"auth":"{}"}},"quay.io/openshift":{{"auth":"{}"}}}}}}"#,
            host, repo
        ))
        .unwrap();

        assert_eq!(
            basic(&config.auth_for("quay.io/openshift/ci:tag")).unwrap().0,
            "repo"
        );
        assert_eq!(basic(&config.auth_for("quay.io/other/img:tag")).unwrap().0, "host");
        // "quay.io/openshiftx" must not match the "quay.io/openshift" prefix
        assert_eq!(basic(&config.auth_for("quay.io/openshiftx/img")).unwrap().0, "host");
    }

    #[test]
    fn test_unknown_registry_is_anonymous() {
        let config = DockerConfig::parse(r#"{"auths":{}}"#).unwrap();
        assert!(config.auth_for("ghcr.io/org/img:v1").credentials().is_none());
    }

    #[test]
    fn test_registry_with_port() {
        let config = DockerConfig::parse(
            r#"{"auths":{"localhost:5000":{"username":"u","password":"p"}}}"#,
        )
        .unwrap();
        assert!(config.auth_for("localhost:5000/mirror:tag").credentials().is_some());
    }

    #[test]
    fn test_invalid_auth_is_an_error() {
        let err = DockerConfig::parse(r#"{"auths":{"quay.io":{"auth":"!!notbase64"}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("quay.io"));

        let no_colon = STANDARD.encode("nocolon");
        let err = DockerConfig::parse(&format!(
            r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#,
            no_colon
        ))
        .unwrap_err();
        assert!(err.to_string().contains("user:password"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = DockerConfig::load(dir.path().join("config.json")).unwrap_err();
        assert!(matches!(err, MirrorError::CredentialsError(_)));
    }

    #[test]
    fn test_load_unparseable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            DockerConfig::load(&path).unwrap_err(),
            MirrorError::CredentialsError(_)
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auths":{"docker.io":{"username":"user","password":"pass"}}}"#,
        )
        .unwrap();
        let config = DockerConfig::load(&path).unwrap();
        assert_eq!(config.path(), Some(path.as_path()));
        // Docker Hub aliases resolve to the same entry
        assert!(config.auth_for("registry-1.docker.io/library/nginx").credentials().is_some());
    }
}
