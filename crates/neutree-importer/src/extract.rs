//! Unpacking of offline packages.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::EntryType;

use crate::error::{ImportError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether the file starts with the gzip magic bytes.
fn is_gzip(file: &mut File) -> Result<bool> {
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(n == 2 && magic == GZIP_MAGIC)
}

/// `dest` joined with an archive path, refusing anything that escapes it.
pub(crate) fn sanitize(dest: &Path, entry: &Path) -> Result<PathBuf> {
    let mut out = dest.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ImportError::Archive(format!(
                    "illegal path in archive: {}",
                    entry.display()
                )))
            }
        }
    }
    Ok(out)
}

/// Extracts a tar or tar.gz archive into `dest`. Only directories and
/// regular files are accepted.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let mut file = File::open(archive)?;
    let reader: Box<dyn Read> = if is_gzip(&mut file)? {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    fs::create_dir_all(dest)?;

    let mut tar = tar::Archive::new(reader);
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let target = sanitize(dest, &path)?;
        match entry.header().entry_type() {
            EntryType::Directory => fs::create_dir_all(&target)?,
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&target)?;
            }
            other => {
                return Err(ImportError::Archive(format!(
                    "unsupported type flag {} for {}",
                    other.as_byte(),
                    path.display()
                )))
            }
        }
    }
    tracing::debug!(archive = %archive.display(), dest = %dest.display(), "package extracted");
    Ok(())
}
