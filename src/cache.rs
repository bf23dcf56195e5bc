//! Verified-metadata cache: one `<hex info-hash>.torrent` file per torrent
//! in a flat directory. The directory is process-wide, set once at startup
//! and read thereafter; when nobody sets it, a subdirectory of the system
//! temp dir is used.

use std::io;
use std::path::{Path, PathBuf};
use std::{env, fs};

use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::assembler;
use crate::info_hash::InfoHash;

static CACHE_DIR: OnceCell<PathBuf> = OnceCell::new();

const DEFAULT_SUBDIR: &str = "riptide-metadata";

/// Points the process-wide cache at `dir`. Call it once, before any
/// download starts; later calls lose and return false.
pub fn set_directory(dir: impl Into<PathBuf>) -> bool {
    CACHE_DIR.set(dir.into()).is_ok()
}

fn directory() -> &'static Path {
    CACHE_DIR.get_or_init(|| env::temp_dir().join(DEFAULT_SUBDIR))
}

/// Best-effort lookup of previously verified metadata. Bytes that no
/// longer hash to their key count as a miss.
pub fn read(info_hash: &InfoHash) -> Option<Vec<u8>> {
    read_from(directory(), info_hash)
}

/// Stores verified metadata under its info-hash, atomically enough that a
/// concurrent reader sees either nothing or the whole file.
pub fn write(info_hash: &InfoHash, bytes: &[u8]) -> crate::error::Result<()> {
    Ok(write_to(directory(), info_hash, bytes)?)
}

pub(crate) fn read_from(dir: &Path, info_hash: &InfoHash) -> Option<Vec<u8>> {
    let path = entry_path(dir, info_hash);

    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            debug!("cache read failed for {}: {}", path.display(), e);
            return None;
        }
    };

    if assembler::sha1(&bytes) != *info_hash {
        warn!("cache entry {} is corrupt, ignoring it", path.display());
        return None;
    }

    Some(bytes)
}

pub(crate) fn write_to(dir: &Path, info_hash: &InfoHash, bytes: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let path = entry_path(dir, info_hash);
    let staging = path.with_extension("torrent.tmp");

    fs::write(&staging, bytes)?;
    fs::rename(&staging, &path)?;

    debug!("cached {} metadata bytes at {}", bytes.len(), path.display());
    Ok(())
}

fn entry_path(dir: &Path, info_hash: &InfoHash) -> PathBuf {
    dir.join(format!("{}.torrent", info_hash.to_hex()))
}
