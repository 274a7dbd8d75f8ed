//! Filesystem plumbing: existence predicates, CWD access, atomic writes,
//! and the two scope-owned resources (temp entries and the working
//! directory). Cleanup happens in Drop so every exit path -- including
//! panics -- releases them.

use crate::prelude::*;
use ring::rand::SecureRandom;
use std::fs;
use std::io::Write;

pub fn file_exists(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

pub fn dir_exists(path: &Path) -> bool {
    // A bare drive letter ("C:") is drive-relative and stats as whatever
    // the process CWD on that drive is; report it as the conventional
    // "yes, that's a directory".
    #[cfg(windows)]
    {
        if let Some(s) = path.to_str() {
            let b = s.as_bytes();
            if b.len() == 2 && b[0].is_ascii_alphabetic() && b[1] == b':' {
                return fs::metadata(format!("{}\\", s))
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
            }
        }
    }
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

pub fn current_dir() -> Result<PathBuf, WrapperError> {
    std::env::current_dir().map_err(|e| WrapperError::io("getcwd", "", e))
}

pub fn set_current_dir(path: &Path) -> Result<(), WrapperError> {
    std::env::set_current_dir(path).map_err(|e| WrapperError::io("chdir", path, e))
}

pub fn temp_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Write `data` to `path` such that readers observe either the old contents
/// or the new contents, never a torn mix: write to a temp file in the same
/// directory, then rename over the target.
pub fn atomic_write(data: &[u8], path: &Path) -> Result<(), WrapperError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| WrapperError::io("mkstemp", dir, e))?;
    tmp.write_all(data)
        .map_err(|e| WrapperError::io("write", path, e))?;
    tmp.as_file()
        .sync_data()
        .map_err(|e| WrapperError::io("fsync", path, e))?;
    tmp.persist(path)
        .map_err(|e| WrapperError::io("rename", path, e.error))?;
    Ok(())
}

static RNG: Lazy<ring::rand::SystemRandom> = Lazy::new(ring::rand::SystemRandom::new);

/// A fresh short id, unique across processes and hosts: 72 bits from the
/// system CSPRNG, url-safe base64 (12 chars).
pub fn unique_id() -> String {
    let mut buf = [0u8; 9];
    // unwrap rationale: SystemRandom only fails if the OS entropy source is
    // broken, at which point nothing else we do is trustworthy either.
    RNG.fill(&mut buf).unwrap();
    data_encoding::BASE64URL_NOPAD.encode(&buf)
}

/// A reserved-but-not-created temp path. Construction picks a unique name
/// under `base`; whatever the owner ends up putting there (a file, a whole
/// tree, or nothing) is removed when the value goes out of scope.
#[derive(Debug)]
pub struct TmpEntry {
    path: PathBuf,
}

impl TmpEntry {
    pub fn new(base: &Path, ext: &str) -> TmpEntry {
        TmpEntry {
            path: base.join(format!("{}{}", unique_id(), ext)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TmpEntry {
    fn drop(&mut self) {
        if let Ok(meta) = fs::symlink_metadata(&self.path) {
            let result = if meta.is_dir() {
                fs::remove_dir_all(&self.path)
            } else {
                fs::remove_file(&self.path)
            };
            if let Err(e) = result {
                warn!("failed to clean up temp entry {}: {e}", self.path.display());
            }
        }
    }
}

/// Chdir that undoes itself: remembers the CWD at construction and restores
/// it on drop, error paths included.
#[derive(Debug)]
pub struct ScopedWorkDir {
    saved: PathBuf,
}

impl ScopedWorkDir {
    pub fn new(dir: &Path) -> Result<ScopedWorkDir, WrapperError> {
        let saved = current_dir()?;
        set_current_dir(dir)?;
        Ok(ScopedWorkDir { saved })
    }
}

impl Drop for ScopedWorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.saved) {
            warn!("failed to restore CWD to {}: {e}", self.saved.display());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exists_predicates() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("f");
        assert!(!file_exists(&file));
        assert!(!dir_exists(&file));
        fs::write(&file, b"x")?;
        assert!(file_exists(&file));
        assert!(!dir_exists(&file));
        assert!(dir_exists(tmp.path()));
        assert!(!file_exists(tmp.path()));
        Ok(())
    }

    #[cfg(windows)]
    #[test]
    fn test_bare_drive_is_a_directory() {
        assert!(dir_exists(Path::new("c:")));
    }

    #[test]
    fn test_atomic_write() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let target = tmp.path().join("out.txt");
        atomic_write(b"first", &target)?;
        assert_eq!(fs::read(&target)?, b"first");
        atomic_write(b"second", &target)?;
        assert_eq!(fs::read(&target)?, b"second");
        // no stray temp files left behind
        assert_eq!(fs::read_dir(tmp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_unique_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| unique_id()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert!(id.len() >= 6);
        }
    }

    #[test]
    fn test_tmp_entry_cleanup() -> Result<()> {
        let tmp = tempfile::tempdir()?;

        // never-created: drop is a no-op
        let reserved;
        {
            let entry = TmpEntry::new(tmp.path(), ".i");
            reserved = entry.path().to_path_buf();
        }
        assert!(!file_exists(&reserved));

        // file: unlinked
        let file_path;
        {
            let entry = TmpEntry::new(tmp.path(), ".i");
            file_path = entry.path().to_path_buf();
            fs::write(&file_path, b"data")?;
        }
        assert!(!file_exists(&file_path));

        // directory with contents: removed recursively
        let dir_path;
        {
            let entry = TmpEntry::new(tmp.path(), "");
            dir_path = entry.path().to_path_buf();
            fs::create_dir(&dir_path)?;
            fs::write(dir_path.join("nested"), b"data")?;
        }
        assert!(!dir_exists(&dir_path));

        Ok(())
    }

    #[test]
    fn test_tmp_entries_are_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let a = TmpEntry::new(tmp.path(), ".o");
        let b = TmpEntry::new(tmp.path(), ".o");
        assert_ne!(a.path(), b.path());
    }

    // Both chdir assertions live in one test: the CWD is process-global and
    // the test runner is multi-threaded.
    #[test]
    fn test_scoped_work_dir() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let inside = tmp.path().canonicalize()?;
        let before = std::env::current_dir()?;

        {
            let _guard = ScopedWorkDir::new(&inside)?;
            assert_eq!(std::env::current_dir()?, inside);
        }
        assert_eq!(std::env::current_dir()?, before);

        let result = std::panic::catch_unwind(|| {
            let _guard = ScopedWorkDir::new(&inside).unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(std::env::current_dir()?, before);

        Ok(())
    }
}
