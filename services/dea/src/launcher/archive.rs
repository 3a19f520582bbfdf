//! Droplet archive extraction.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, warn};

/// Unpacks a staged droplet into an instance directory.
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, archive: &Path, dest: &Path) -> io::Result<()>;
}

/// Extracts tar archives, gzipped or not.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzExtractor;

impl ArchiveExtractor for TarGzExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> io::Result<()> {
        fs::create_dir_all(dest)?;
        let reader = BufReader::new(File::open(archive)?);
        let count = if is_gzip(archive)? {
            unpack_entries(&mut Archive::new(GzDecoder::new(reader)), dest)?
        } else {
            unpack_entries(&mut Archive::new(reader), dest)?
        };
        debug!(archive = %archive.display(), dest = %dest.display(), entries = count, "Extracted droplet");
        Ok(())
    }
}

fn unpack_entries<R: Read>(archive: &mut Archive<R>, dest: &Path) -> io::Result<usize> {
    archive.set_preserve_permissions(true);
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            warn!(path = %path.display(), "Skipping archive entry outside the destination");
            continue;
        }

        entry.unpack_in(dest)?;
        count += 1;
    }
    Ok(count)
}

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}
