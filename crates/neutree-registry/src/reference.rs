//! Docker image reference parsing and rewriting.

use std::fmt;

use crate::error::{RegistryError, Result};

pub const DOCKER_HUB: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// A normalised image reference. Hub short names are expanded, so
/// `nginx` becomes `docker.io/library/nginx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

/// Whether the leading path segment names a registry host.
fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Splits `name[:tag]` where the tag separator must come after the last `/`.
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[slash..].rfind(':') {
        Some(i) => (&name[..slash + i], Some(&name[slash + i + 1..])),
        None => (name, None),
    }
}

impl Reference {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RegistryError::invalid(input, "empty reference"));
        }

        let (name, digest) = match input.split_once('@') {
            Some((n, d)) => {
                if !d.contains(':') {
                    return Err(RegistryError::invalid(input, "malformed digest"));
                }
                (n, Some(d.to_string()))
            }
            None => (input, None),
        };

        let (name, tag) = split_tag(name);
        if let Some(t) = tag {
            if t.is_empty() {
                return Err(RegistryError::invalid(input, "empty tag"));
            }
        }

        let (registry, mut repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            _ => (DOCKER_HUB.to_string(), name.to_string()),
        };
        if registry == "index.docker.io" || registry == DOCKER_HUB {
            if !repository.contains('/') {
                repository = format!("library/{repository}");
            }
        }

        if repository.is_empty() || repository.split('/').any(|s| s.is_empty()) {
            return Err(RegistryError::invalid(input, "empty repository path"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(RegistryError::invalid(input, "repository must be lowercase"));
        }

        Ok(Self {
            registry: if registry == "index.docker.io" {
                DOCKER_HUB.to_string()
            } else {
                registry
            },
            repository,
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// The identifier used in `/v2/<repo>/manifests/<identifier>`.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// `:tag` or `@digest`; a digest wins over a tag.
    fn suffix(&self) -> String {
        match &self.digest {
            Some(d) => format!("@{d}"),
            None => format!(":{}", self.tag.as_deref().unwrap_or(DEFAULT_TAG)),
        }
    }

    /// The same image addressed under `mirror`.
    pub fn with_registry(&self, mirror: &str) -> String {
        format!(
            "{}/{}{}",
            mirror.trim_end_matches('/'),
            self.repository,
            self.suffix()
        )
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.registry, self.repository, self.suffix())
    }
}

/// Rewrite `image` to be pulled from `mirror`. An empty mirror leaves the
/// input untouched.
pub fn rewrite_image(image: &str, mirror: &str) -> Result<String> {
    if mirror.is_empty() {
        return Ok(image.to_string());
    }
    Ok(Reference::parse(image)?.with_registry(mirror))
}

/// Repository path of a `repo:tag` string with the registry host removed,
/// plus the tag (`latest` when absent). The leading segment is dropped only
/// when it contains `.` or `:`.
pub fn short_repo(repo_tag: &str) -> (String, String) {
    let (name, tag) = split_tag(repo_tag);
    let repo = match name.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') => rest,
        _ => name,
    };
    (
        repo.to_string(),
        tag.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TAG).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:11522ec7e5f1b6e4b0f3dcd3b0e9ea7ffc5e8e3f1e5c3e4d6c2d0c8f7a7b6a5c";

    #[test]
    fn test_rewrite_image() {
        assert_eq!(
            rewrite_image("docker.io/library/nginx:latest", "mirror.example.com").unwrap(),
            "mirror.example.com/library/nginx:latest"
        );
        assert_eq!(
            rewrite_image("nginx:latest", "mirror.example.com").unwrap(),
            "mirror.example.com/library/nginx:latest"
        );
        assert_eq!(
            rewrite_image(&format!("docker.io/library/nginx@{DIGEST}"), "mirror.example.com")
                .unwrap(),
            format!("mirror.example.com/library/nginx@{DIGEST}")
        );
        assert_eq!(
            rewrite_image("nginx:latest", "").unwrap(),
            "nginx:latest"
        );
    }

    #[test]
    fn test_parse_private_registry() {
        let r = Reference::parse("registry.local:5000/team/app").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.identifier(), "latest");
        assert_eq!(r.to_string(), "registry.local:5000/team/app:latest");

        let r = Reference::parse("localhost/app:v2").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("Nginx").is_err());
        assert!(Reference::parse("nginx:").is_err());
        assert!(Reference::parse("nginx@nodigest").is_err());
    }

    #[test]
    fn test_short_repo() {
        assert_eq!(
            short_repo("registry.local:5000/ns/app:v1"),
            ("ns/app".to_string(), "v1".to_string())
        );
        assert_eq!(
            short_repo("quay.io/ray/ray"),
            ("ray/ray".to_string(), "latest".to_string())
        );
        assert_eq!(
            short_repo("neutree/neutree-serve:v1.0.0"),
            ("neutree/neutree-serve".to_string(), "v1.0.0".to_string())
        );
        assert_eq!(
            short_repo("localhost/app:v1"),
            ("localhost/app".to_string(), "v1".to_string())
        );
        assert_eq!(short_repo("busybox"), ("busybox".to_string(), "latest".to_string()));
    }
}
