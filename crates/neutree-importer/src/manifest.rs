//! The package manifest and its validation.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use neutree_common::EngineVersion;

use crate::error::{ImportError, Result};
use crate::extract::sanitize;

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const LEGACY_MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PackageMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ImageSpec {
    pub image_name: String,
    pub tag: String,
    /// Relative to the package root.
    pub image_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineMetadata {
    pub name: String,
    #[serde(default)]
    pub engine_versions: Vec<EngineVersion>,
    #[serde(default)]
    pub supported_tasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PackageManifest {
    pub manifest_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PackageMetadata>,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
    #[serde(default)]
    pub engines: Vec<EngineMetadata>,
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    file: String,
    #[serde(rename = "repoTags", default)]
    repo_tags: Vec<String>,
}

/// `repo:tag` split at the last colon after the last slash.
fn split_repo_tag(repo_tag: &str) -> (&str, &str) {
    let name_start = repo_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match repo_tag[name_start..].rfind(':') {
        Some(i) => (&repo_tag[..name_start + i], &repo_tag[name_start + i + 1..]),
        None => (repo_tag, "latest"),
    }
}

impl PackageManifest {
    /// Reads `manifest.yaml`, falling back to the legacy `manifest.json`.
    pub fn load(package_dir: &Path) -> Result<Self> {
        let path = package_dir.join(MANIFEST_FILE);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            return serde_yaml::from_str(&raw)
                .map_err(|e| ImportError::Manifest(format!("parse {MANIFEST_FILE}: {e}")));
        }
        let legacy = package_dir.join(LEGACY_MANIFEST_FILE);
        if legacy.exists() {
            let raw = fs::read(&legacy)?;
            let entries: Vec<LegacyEntry> = serde_json::from_slice(&raw)
                .map_err(|e| ImportError::Manifest(format!("parse {LEGACY_MANIFEST_FILE}: {e}")))?;
            return Ok(Self::from_legacy(entries));
        }
        Err(ImportError::Manifest(format!(
            "{MANIFEST_FILE} not found in package"
        )))
    }

    fn from_legacy(entries: Vec<LegacyEntry>) -> Self {
        let images = entries
            .iter()
            .flat_map(|e| {
                e.repo_tags.iter().map(|rt| {
                    let (name, tag) = split_repo_tag(rt);
                    ImageSpec {
                        image_name: name.to_string(),
                        tag: tag.to_string(),
                        image_file: e.file.clone(),
                        ..Default::default()
                    }
                })
            })
            .collect();
        Self {
            manifest_version: "legacy".to_string(),
            images,
            ..Default::default()
        }
    }

    /// Checks the manifest against the extracted package.
    pub fn validate(&self, package_dir: &Path) -> Result<()> {
        let fail = |msg: String| Err(ImportError::Manifest(msg));
        if self.images.is_empty() {
            return fail("no images in manifest".into());
        }
        for (i, image) in self.images.iter().enumerate() {
            if image.image_name.is_empty() {
                return fail(format!("image {i}: image name is empty"));
            }
            if image.tag.is_empty() {
                return fail(format!("image {i}: tag is empty"));
            }
            if image.image_file.is_empty() {
                return fail(format!("image {i}: image file is empty"));
            }
            let Ok(path) = sanitize(package_dir, Path::new(&image.image_file)) else {
                return fail(format!("image {i}: image file outside the package: {}", image.image_file));
            };
            if !path.is_file() {
                return fail(format!("image {i}: image file not found: {}", image.image_file));
            }
        }
        for (i, engine) in self.engines.iter().enumerate() {
            if engine.name.is_empty() {
                return fail(format!("engine {i}: name is empty"));
            }
            if engine.engine_versions.is_empty() {
                return fail(format!("engine {}: no engine versions", engine.name));
            }
        }
        Ok(())
    }

    /// Distinct image files in declaration order.
    pub fn image_files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = Vec::new();
        for image in &self.images {
            if !files.contains(&image.image_file.as_str()) {
                files.push(&image.image_file);
            }
        }
        files
    }
}
