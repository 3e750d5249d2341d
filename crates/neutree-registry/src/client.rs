use std::collections::HashMap;
use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;

use neutree_common::ImageRegistry;

use crate::auth::{Challenge, Credentials};
use crate::error::{RegistryError, Result};
use crate::reference::{Reference, DOCKER_HUB};

pub(crate) const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json";

const CONNECT_TIMEOUT_SECS: u64 = 30;

fn token_key(host: &str, repository: &str, actions: &str) -> String {
    format!("{host}/{repository}:{actions}")
}

/// Speaks the registry v2 HTTP API.
///
/// Holds nothing but a connection pool and a cache of bearer tokens, so a
/// fresh client per operation is cheap.
pub struct RegistryClient {
    pub(crate) http: Client,
    plain_http: bool,
    pub(crate) retry_backoff: Duration,
    tokens: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Client trusting `ca_pem` in addition to the system roots.
    pub fn with_ca(ca_pem: &str) -> Result<Self> {
        Self::build(Some(ca_pem))
    }

    /// Client configured from an ImageRegistry record (CA bundle, scheme).
    pub fn for_registry(registry: &ImageRegistry) -> Result<Self> {
        let ca = Some(registry.spec.ca.as_str()).filter(|c| !c.is_empty());
        Ok(Self::build(ca)?.plain_http(registry.insecure()))
    }

    fn build(ca_pem: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .pool_idle_timeout(Duration::from_secs(90));
        if let Some(pem) = ca_pem {
            for cert in reqwest::Certificate::from_pem_bundle(pem.as_bytes())? {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(Self {
            http: builder.build()?,
            plain_http: false,
            retry_backoff: Duration::from_secs(1),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Talk HTTP instead of HTTPS to every host.
    pub fn plain_http(mut self, on: bool) -> Self {
        self.plain_http = on;
        self
    }

    /// Unit of the linear push back-off (attempt n waits n × unit).
    pub fn retry_backoff(mut self, unit: Duration) -> Self {
        self.retry_backoff = unit;
        self
    }

    pub(crate) fn base_url(&self, host: &str) -> String {
        let host = if host == DOCKER_HUB { "registry-1.docker.io" } else { host };
        let local = host.starts_with("localhost") || host.starts_with("127.");
        let scheme = if self.plain_http || local { "http" } else { "https" };
        format!("{scheme}://{host}")
    }

    /// Sends a request built by `build`, answering one auth challenge.
    ///
    /// `actions` is the scope requested when the challenge carries none,
    /// e.g. `pull` or `pull,push`.
    pub(crate) async fn send<F>(
        &self,
        host: &str,
        repository: &str,
        actions: &str,
        creds: &Credentials,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let cache_key = token_key(host, repository, actions);
        let mut req = build(&self.http);
        match creds {
            Credentials::RegistryToken(token) => req = req.bearer_auth(token),
            _ => {
                if let Some(token) = self.tokens.lock().await.get(&cache_key) {
                    req = req.bearer_auth(token);
                }
            }
        }

        let resp = req.send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED || matches!(creds, Credentials::RegistryToken(_)) {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .and_then(Challenge::parse);
        let Some(challenge) = challenge else {
            return Ok(resp);
        };

        let retry = build(&self.http);
        let retry = match challenge {
            Challenge::Basic => match creds {
                Credentials::Basic { username, password } => {
                    retry.basic_auth(username, Some(password))
                }
                _ => return Ok(resp),
            },
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let scope = scope.unwrap_or_else(|| format!("repository:{repository}:{actions}"));
                let token = self
                    .fetch_token(&realm, service.as_deref(), &scope, creds)
                    .await?;
                self.tokens
                    .lock()
                    .await
                    .insert(cache_key, token.clone());
                retry.bearer_auth(token)
            }
        };
        Ok(retry.send().await?)
    }

    /// Sends a request whose body cannot be replayed, such as a streamed
    /// blob. Uses the bearer token an earlier [`Self::send`] cached for the
    /// same scope, or basic credentials up front.
    pub(crate) async fn send_once(
        &self,
        host: &str,
        repository: &str,
        actions: &str,
        creds: &Credentials,
        req: RequestBuilder,
    ) -> Result<Response> {
        let cached = self
            .tokens
            .lock()
            .await
            .get(&token_key(host, repository, actions))
            .cloned();
        let req = match (creds, cached) {
            (Credentials::RegistryToken(token), _) => req.bearer_auth(token),
            (_, Some(token)) => req.bearer_auth(token),
            (Credentials::Basic { username, password }, None) => {
                req.basic_auth(username, Some(password))
            }
            (_, None) => req,
        };
        Ok(req.send().await?)
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        creds: &Credentials,
    ) -> Result<String> {
        let mut query: Vec<(&str, &str)> = vec![("scope", scope)];
        if let Some(s) = service {
            query.push(("service", s));
        }

        let req = match creds {
            Credentials::IdentityToken { token, .. } => {
                let mut form = query.clone();
                form.push(("grant_type", "refresh_token"));
                form.push(("refresh_token", token.as_str()));
                form.push(("client_id", "neutree"));
                self.http.post(realm).form(&form)
            }
            Credentials::Basic { username, password } => self
                .http
                .get(realm)
                .query(&query)
                .basic_auth(username, Some(password)),
            _ => self.http.get(realm).query(&query),
        };

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(RegistryError::Auth(format!(
                "token endpoint {realm} returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp.json().await?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| RegistryError::Auth(format!("no token in response from {realm}")))
    }

    /// HEAD the manifest of `image`. 404 means absent; any other non-2xx
    /// status is an error.
    pub async fn check_image_exists(&self, image: &str, creds: &Credentials) -> Result<bool> {
        let r = Reference::parse(image)?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&r.registry),
            r.repository,
            r.identifier()
        );
        let resp = self
            .send(&r.registry, &r.repository, "pull", creds, |c| {
                c.head(&url).header(header::ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(RegistryError::Status {
                status: s.as_u16(),
                url,
            }),
        }
    }

    /// All tags of `repository` (a reference without tag). 404 yields an
    /// empty list.
    pub async fn list_tags(&self, repository: &str, creds: &Credentials) -> Result<Vec<String>> {
        let r = Reference::parse(repository)?;
        let base = self.base_url(&r.registry);
        let mut url = format!("{base}/v2/{}/tags/list?n=1000", r.repository);
        let mut tags = Vec::new();

        loop {
            let resp = self
                .send(&r.registry, &r.repository, "pull", creds, |c| c.get(&url))
                .await?;
            match resp.status() {
                StatusCode::NOT_FOUND => return Ok(tags),
                s if !s.is_success() => {
                    return Err(RegistryError::Status {
                        status: s.as_u16(),
                        url,
                    })
                }
                _ => {}
            }

            let next = resp
                .headers()
                .get(header::LINK)
                .and_then(|h| h.to_str().ok())
                .and_then(next_link);
            let page: TagList = resp.json().await?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(link) if link.starts_with("http") => url = link,
                Some(link) => url = format!("{base}{link}"),
                None => return Ok(tags),
            }
        }
    }
}

/// Target of a `Link: <...>; rel="next"` header.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        Some(
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string(),
        )
    })
}
