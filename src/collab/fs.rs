//! File/artifact store collaborator

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use walkdir::WalkDir;

/// Hex SHA-256 of file contents (or of a directory listing)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// SHA-256 of the RFC 8785 canonical JSON form of `value`
    pub fn of_canonical_json<T: Serialize>(value: &T) -> Result<Self, String> {
        let jcs_bytes = serde_json_canonicalizer::to_vec(value).map_err(|e| e.to_string())?;
        Ok(Self::of_bytes(&jcs_bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Filesystem operations the core needs. Paths are absolute.
pub trait FileStore: Send + Sync {
    fn digest(&self, path: &Path) -> io::Result<Digest>;
    fn create_directories(&self, path: &Path) -> io::Result<()>;
    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn read_bytes(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileStore;

impl FileStore for LocalFileStore {
    /// Directories digest their sorted relative paths and file contents
    fn digest(&self, path: &Path) -> io::Result<Digest> {
        if !path.is_dir() {
            return Ok(Digest::of_bytes(&fs::read(path)?));
        }
        let mut hasher = Sha256::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0]);
            if entry.file_type().is_file() {
                hasher.update(fs::read(entry.path())?);
            }
        }
        Ok(Digest(hex::encode(hasher.finalize())))
    }

    fn create_directories(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    /// Write-then-rename so readers never see a partial file
    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = temp_path(path);
        fs::write(&temp, bytes)?;
        fs::rename(&temp, path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Observed state of a source input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub path: PathBuf,
    pub digest: Digest,
    pub is_directory: bool,
}
