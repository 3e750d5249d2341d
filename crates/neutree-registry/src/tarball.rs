//! Reading `docker save` archives.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::error::{RegistryError, Result};

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SaveEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    layers: Vec<String>,
}

/// A blob ready for upload.
#[derive(Debug, Clone)]
pub struct Blob {
    pub path: PathBuf,
    pub digest: String,
    pub size: u64,
    pub media_type: &'static str,
}

/// An extracted `docker save` archive with its blobs prepared for push.
pub struct ImageTarball {
    _dir: TempDir,
    pub repo_tags: Vec<String>,
    pub config: Blob,
    pub layers: Vec<Blob>,
}

fn is_manifest(path: &Path) -> bool {
    path.file_name().map(|n| n == MANIFEST_FILE).unwrap_or(false)
}

fn parse_manifest(body: &[u8]) -> Result<SaveEntry> {
    let entries: Vec<SaveEntry> = serde_json::from_slice(body)?;
    entries
        .into_iter()
        .next()
        .ok_or_else(|| RegistryError::Tarball("manifest.json has no entries".into()))
}

/// Repo tags of the first image in the archive, read without extracting.
pub fn read_repo_tags(tar_path: &Path) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(BufReader::new(File::open(tar_path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !is_manifest(&entry.path()?) {
            continue;
        }
        let mut body = Vec::new();
        entry.read_to_end(&mut body)?;
        return Ok(parse_manifest(&body)?.repo_tags.unwrap_or_default());
    }
    Err(RegistryError::Tarball(format!(
        "{MANIFEST_FILE} not found in {}",
        tar_path.display()
    )))
}

/// Writer that hashes and counts everything passing through.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut f = File::open(path)?;
    match f.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn digest_file(path: &Path, media_type: &'static str) -> Result<Blob> {
    let mut sink = HashingWriter {
        inner: io::sink(),
        hasher: Sha256::new(),
        written: 0,
    };
    io::copy(&mut BufReader::new(File::open(path)?), &mut sink)?;
    Ok(Blob {
        path: path.to_path_buf(),
        digest: format!("sha256:{:x}", sink.hasher.finalize()),
        size: sink.written,
        media_type,
    })
}

/// Gzips an uncompressed layer next to itself, unless it already is gzip.
fn prepare_layer(path: &Path) -> Result<Blob> {
    if is_gzip(path)? {
        return digest_file(path, LAYER_MEDIA_TYPE);
    }
    let out_path = path.with_extension("tar.gz");
    let out = HashingWriter {
        inner: File::create(&out_path)?,
        hasher: Sha256::new(),
        written: 0,
    };
    let mut encoder = GzEncoder::new(out, Compression::default());
    io::copy(&mut BufReader::new(File::open(path)?), &mut encoder)?;
    let mut out = encoder.finish()?;
    out.flush()?;
    Ok(Blob {
        path: out_path,
        digest: format!("sha256:{:x}", out.hasher.finalize()),
        size: out.written,
        media_type: LAYER_MEDIA_TYPE,
    })
}

fn find_manifest(root: &Path) -> Result<Option<PathBuf>> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if is_manifest(&path) {
                return Ok(Some(path));
            }
        }
    }
    Ok(None)
}

impl ImageTarball {
    /// Extracts `tar_path` into a private temp dir and digests every blob.
    /// Blocking; call from `spawn_blocking`.
    pub fn extract(tar_path: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("neutree-image-").tempdir()?;
        tar::Archive::new(BufReader::new(File::open(tar_path)?)).unpack(dir.path())?;

        let manifest_path = find_manifest(dir.path())?.ok_or_else(|| {
            RegistryError::Tarball(format!("{MANIFEST_FILE} not found in {}", tar_path.display()))
        })?;
        let root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.path().to_path_buf());
        let entry = parse_manifest(&std::fs::read(&manifest_path)?)?;

        let config = digest_file(&root.join(&entry.config), CONFIG_MEDIA_TYPE)?;
        let layers = entry
            .layers
            .iter()
            .map(|l| prepare_layer(&root.join(l)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            _dir: dir,
            repo_tags: entry.repo_tags.unwrap_or_default(),
            config,
            layers,
        })
    }

    /// Schema 2 image manifest referencing the prepared blobs.
    pub fn manifest(&self) -> serde_json::Value {
        let descriptor = |b: &Blob| {
            serde_json::json!({
                "mediaType": b.media_type,
                "size": b.size,
                "digest": b.digest,
            })
        };
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": descriptor(&self.config),
            "layers": self.layers.iter().map(descriptor).collect::<Vec<_>>(),
        })
    }
}
