use std::path::Path;

use reqwest::{header, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::auth::{default_keychain, Credentials};
use crate::client::RegistryClient;
use crate::error::{RegistryError, Result};
use crate::reference::{short_repo, Reference};
use crate::tarball::{read_repo_tags, Blob, ImageTarball, MANIFEST_MEDIA_TYPE};

fn status_error(status: StatusCode, url: &str) -> RegistryError {
    RegistryError::Status {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

impl RegistryClient {
    /// Pushes every repo tag of a `docker save` archive to `target_registry`
    /// (a host optionally followed by a path prefix). Anonymous credentials
    /// fall back to the docker keychain. Returns the pushed references.
    pub async fn push_tar(
        &self,
        tar_path: &Path,
        target_registry: &str,
        creds: &Credentials,
        retries: u32,
    ) -> Result<Vec<String>> {
        let path = tar_path.to_path_buf();
        let tags = tokio::task::spawn_blocking(move || read_repo_tags(&path))
            .await
            .map_err(|e| RegistryError::Tarball(e.to_string()))??;
        if tags.is_empty() {
            info!(tar = %tar_path.display(), "archive carries no repo tags, nothing to push");
            return Ok(Vec::new());
        }

        let path = tar_path.to_path_buf();
        let image = tokio::task::spawn_blocking(move || ImageTarball::extract(&path))
            .await
            .map_err(|e| RegistryError::Tarball(e.to_string()))??;

        let host = target_registry
            .split('/')
            .next()
            .unwrap_or(target_registry);
        let creds = if creds.is_anonymous() {
            default_keychain(host)
        } else {
            creds.clone()
        };

        let mut pushed = Vec::with_capacity(tags.len());
        for repo_tag in &tags {
            let (repo, tag) = short_repo(repo_tag);
            let target = format!("{}/{repo}:{tag}", target_registry.trim_end_matches('/'));
            let reference = Reference::parse(&target)?;
            self.push_with_retry(&image, &reference, &creds, retries)
                .await?;
            info!(source = %repo_tag, target = %target, "pushed image");
            pushed.push(target);
        }
        Ok(pushed)
    }

    async fn push_with_retry(
        &self,
        image: &ImageTarball,
        reference: &Reference,
        creds: &Credentials,
        retries: u32,
    ) -> Result<()> {
        let attempts = retries.max(1);
        let mut attempt = 1;
        loop {
            match self.push_image(image, reference, creds).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let wait = self.retry_backoff * attempt;
                    warn!(
                        image = %reference,
                        attempt,
                        error = %e,
                        "push failed, retrying in {:?}",
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn push_image(
        &self,
        image: &ImageTarball,
        reference: &Reference,
        creds: &Credentials,
    ) -> Result<()> {
        for blob in image.layers.iter().chain(std::iter::once(&image.config)) {
            self.ensure_blob(reference, blob, creds).await?;
        }

        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&reference.registry),
            reference.repository,
            reference.identifier()
        );
        let body = serde_json::to_vec(&image.manifest())?;
        let resp = self
            .send(
                &reference.registry,
                &reference.repository,
                "pull,push",
                creds,
                |c| {
                    c.put(&url)
                        .header(header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
                        .body(body.clone())
                },
            )
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &url));
        }
        Ok(())
    }

    /// Uploads `blob` unless the registry already has it.
    async fn ensure_blob(&self, reference: &Reference, blob: &Blob, creds: &Credentials) -> Result<()> {
        let base = self.base_url(&reference.registry);
        let (host, repo) = (&reference.registry, &reference.repository);

        let head_url = format!("{base}/v2/{repo}/blobs/{}", blob.digest);
        let resp = self
            .send(host, repo, "pull,push", creds, |c| c.head(&head_url))
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }

        let start_url = format!("{base}/v2/{repo}/blobs/uploads/");
        let resp = self
            .send(host, repo, "pull,push", creds, |c| c.post(&start_url))
            .await?;
        if resp.status() != StatusCode::ACCEPTED {
            return Err(status_error(resp.status(), &start_url));
        }
        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| RegistryError::Tarball(format!("no upload location from {start_url}")))?;
        let location = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{base}{location}")
        };
        let sep = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{sep}digest={}", blob.digest);

        let file = tokio::fs::File::open(&blob.path).await?;
        let size = file.metadata().await?.len();
        let req = self
            .http
            .put(&put_url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        let resp = self.send_once(host, repo, "pull,push", creds, req).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &put_url));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::{Path as AxumPath, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{head, post, put};
    use axum::Router;
    use sha2::{Digest, Sha256};

    use crate::client::tests::serve;
    use crate::tarball::tests::write_save_archive;

    #[derive(Default)]
    struct Fake {
        blobs: Mutex<HashSet<String>>,
        manifests: Mutex<Vec<String>>,
        manifest_failures: AtomicUsize,
        upload_auth: Mutex<Vec<String>>,
    }

    type Shared = State<Arc<Fake>>;

    async fn head_blob(State(f): Shared, AxumPath((_ns, _n, digest)): AxumPath<(String, String, String)>) -> AxumStatus {
        if f.blobs.lock().unwrap().contains(&digest) {
            AxumStatus::OK
        } else {
            AxumStatus::NOT_FOUND
        }
    }

    async fn start_upload(AxumPath((ns, n)): AxumPath<(String, String)>) -> impl IntoResponse {
        (
            AxumStatus::ACCEPTED,
            [("location", format!("/v2/{ns}/{n}/blobs/uploads/session-1"))],
        )
    }

    async fn finish_upload(
        State(f): Shared,
        axum::extract::Query(q): axum::extract::Query<std::collections::HashMap<String, String>>,
        headers: axum::http::HeaderMap,
        body: axum::body::Bytes,
    ) -> AxumStatus {
        let digest = format!("sha256:{:x}", Sha256::digest(&body));
        if digest != q["digest"] {
            return AxumStatus::BAD_REQUEST;
        }
        let auth = headers
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        f.upload_auth.lock().unwrap().push(auth.to_string());
        f.blobs.lock().unwrap().insert(digest);
        AxumStatus::CREATED
    }

    async fn put_manifest(
        State(f): Shared,
        AxumPath((ns, n, tag)): AxumPath<(String, String, String)>,
    ) -> AxumStatus {
        if f.manifest_failures.load(Ordering::SeqCst) > 0 {
            f.manifest_failures.fetch_sub(1, Ordering::SeqCst);
            return AxumStatus::SERVICE_UNAVAILABLE;
        }
        f.manifests.lock().unwrap().push(format!("{ns}/{n}:{tag}"));
        AxumStatus::CREATED
    }

    async fn fake_registry(fake: Arc<Fake>) -> String {
        let app = Router::new()
            .route("/v2/:ns/:name/blobs/:digest", head(head_blob))
            .route("/v2/:ns/:name/blobs/uploads/", post(start_upload))
            .route("/v2/:ns/:name/blobs/uploads/session-1", put(finish_upload))
            .route("/v2/:ns/:name/manifests/:tag", put(put_manifest))
            .with_state(fake);
        serve(app).await
    }

    #[tokio::test]
    async fn test_push_tar_retags_and_retries() {
        let fake = Arc::new(Fake::default());
        fake.manifest_failures.store(1, Ordering::SeqCst);
        let host = fake_registry(fake.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let tar = write_save_archive(dir.path(), "", &["quay.io/ray/ray:2.9"]);
        let client = RegistryClient::new()
            .unwrap()
            .retry_backoff(Duration::from_millis(10));

        let pushed = client
            .push_tar(&tar, &host, &Credentials::basic("u", "p"), 3)
            .await
            .unwrap();
        assert_eq!(pushed, vec![format!("{host}/ray/ray:2.9")]);
        assert_eq!(fake.blobs.lock().unwrap().len(), 2);
        assert_eq!(fake.manifests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_push_tar_streams_blobs_with_registry_token() {
        let fake = Arc::new(Fake::default());
        let host = fake_registry(fake.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let tar = write_save_archive(dir.path(), "", &["ns/app:v1"]);
        let client = RegistryClient::new().unwrap();

        let creds = Credentials::RegistryToken("tok".into());
        client.push_tar(&tar, &host, &creds, 1).await.unwrap();
        let auth = fake.upload_auth.lock().unwrap().clone();
        assert_eq!(auth, ["Bearer tok", "Bearer tok"]);
        assert_eq!(fake.manifests.lock().unwrap().as_slice(), ["ns/app:v1"]);
    }

    #[tokio::test]
    async fn test_push_tar_gives_up_after_retries() {
        let fake = Arc::new(Fake::default());
        fake.manifest_failures.store(10, Ordering::SeqCst);
        let host = fake_registry(fake.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let tar = write_save_archive(dir.path(), "", &["ns/app:v1"]);
        let client = RegistryClient::new()
            .unwrap()
            .retry_backoff(Duration::from_millis(1));

        let err = client
            .push_tar(&tar, &host, &Credentials::basic("u", "p"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Status { status: 503, .. }));
        assert_eq!(fake.manifest_failures.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_push_tar_without_tags_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let tar = write_save_archive(dir.path(), "", &[]);
        let client = RegistryClient::new().unwrap();
        let pushed = client
            .push_tar(&tar, "127.0.0.1:1", &Credentials::Anonymous, 3)
            .await
            .unwrap();
        assert!(pushed.is_empty());
    }
}
