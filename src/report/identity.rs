use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Directory name under the per-user cache location.
pub const CACHE_DIR_NAME: &str = "lazy-milktea";

/// Stable fingerprint of a bugreport input, derived from its absolute
/// path, byte size, and modification time. The cache directory for a
/// report is named by this fingerprint, so editing or replacing the file
/// invalidates the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReportId(String);

impl ReportId {
    pub fn for_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs())
            .unwrap_or(0);
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        hasher.update(metadata.len().to_le_bytes());
        hasher.update(modified.to_le_bytes());
        let digest = format!("{:x}", hasher.finalize());

        Ok(Self(digest[..16].to_string()))
    }

    /// Reconstructs an id from its string form (e.g. read back from a
    /// summary artifact).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default cache root: `<user-cache>/lazy-milktea`.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CACHE_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn id_is_stable_for_unchanged_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "hello").unwrap();
        file.flush().unwrap();

        let a = ReportId::for_path(file.path()).unwrap();
        let b = ReportId::for_path(file.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn id_changes_when_size_changes() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "hello").unwrap();
        file.flush().unwrap();
        let before = ReportId::for_path(file.path()).unwrap();

        writeln!(file, "more bytes").unwrap();
        file.flush().unwrap();
        let after = ReportId::for_path(file.path()).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ReportId::for_path(Path::new("/no/such/bugreport.txt")).is_err());
    }
}
