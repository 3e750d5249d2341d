use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use neutree_common::ImageRegistryAuth;

/// Credentials presented to a registry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    /// OAuth2 refresh token exchanged at the token realm.
    IdentityToken {
        username: String,
        token: String,
    },
    /// Bearer token sent as-is.
    RegistryToken(String),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }
}

impl From<&ImageRegistryAuth> for Credentials {
    fn from(a: &ImageRegistryAuth) -> Self {
        if !a.registry_token.is_empty() {
            Credentials::RegistryToken(a.registry_token.clone())
        } else if !a.identity_token.is_empty() {
            Credentials::IdentityToken {
                username: a.username.clone(),
                token: a.identity_token.clone(),
            }
        } else if !a.username.is_empty() || !a.password.is_empty() {
            Credentials::basic(a.username.clone(), a.password.clone())
        } else {
            Credentials::Anonymous
        }
    }
}

/// Parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    /// Parses `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (k, v) in split_params(params) {
            match k.as_str() {
                "realm" => realm = Some(v),
                "service" => service = Some(v),
                "scope" => scope = Some(v),
                _ => {}
            }
        }
        Some(Challenge::Bearer {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Splits `k="v",k2="v,2"` honouring quotes.
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        out.push((key, value.to_string()));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    out
}

#[derive(Debug, Deserialize, Default)]
struct DockerConfigFile {
    #[serde(default)]
    auths: std::collections::HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    identitytoken: String,
    #[serde(default)]
    registrytoken: String,
}

fn docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

/// Normalises a docker config `auths` key or a registry host for comparison.
fn normalize_host(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = key.split('/').next().unwrap_or(key);
    match host {
        "index.docker.io" | "registry-1.docker.io" | "docker.io" => "docker.io",
        h => h,
    }
}

/// Credentials for `host` from a docker `config.json` body.
pub fn credentials_from_docker_config(config: &str, host: &str) -> Credentials {
    let Ok(cfg) = serde_json::from_str::<DockerConfigFile>(config) else {
        return Credentials::Anonymous;
    };
    let wanted = normalize_host(host);
    let Some(entry) = cfg
        .auths
        .iter()
        .find(|(k, _)| normalize_host(k) == wanted)
        .map(|(_, v)| v)
    else {
        return Credentials::Anonymous;
    };

    if !entry.registrytoken.is_empty() {
        return Credentials::RegistryToken(entry.registrytoken.clone());
    }
    let (mut username, mut password) = (entry.username.clone(), entry.password.clone());
    if !entry.auth.is_empty() {
        if let Ok(decoded) = BASE64.decode(entry.auth.trim()) {
            if let Some((u, p)) = String::from_utf8_lossy(&decoded).split_once(':') {
                username = u.to_string();
                password = p.to_string();
            }
        }
    }
    if !entry.identitytoken.is_empty() {
        return Credentials::IdentityToken {
            username,
            token: entry.identitytoken.clone(),
        };
    }
    if username.is_empty() && password.is_empty() {
        Credentials::Anonymous
    } else {
        Credentials::Basic { username, password }
    }
}

/// Default keychain: the local docker client configuration.
pub fn default_keychain(host: &str) -> Credentials {
    let Some(path) = docker_config_path() else {
        return Credentials::Anonymous;
    };
    match std::fs::read_to_string(&path) {
        Ok(body) => credentials_from_docker_config(&body, host),
        Err(_) => Credentials::Anonymous,
    }
}
