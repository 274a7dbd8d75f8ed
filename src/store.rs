//! The on-disk cache store: fingerprint -> artifact set. Each entry is a
//! directory holding a manifest, the recorded stdout/stderr, and one
//! payload file per output role.
//!
//! Entries are staged in a tempdir and renamed into place, so a killed
//! process never publishes a partial entry. A per-entry lock file manages
//! concurrent access; since entries are immutable once published, the
//! interesting race is only two processes inserting the same fingerprint,
//! and there the first writer wins.
//!
//! The lock file's mtime doubles as the LRU clock: lookups bump it, and
//! eviction removes the oldest entries first.

use crate::fingerprint::Fingerprint;
use crate::prelude::*;
use crate::util::retry_interrupted;
use crate::wrapper::OutputRole;
use auto_impl::auto_impl;
use fs2::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::time::{Duration, SystemTime};

// Some filesystems don't cope well with a single directory containing lots
// of files, so entries are dispersed over single-character fanout
// directories: ${BASE}/${CHAR}/${CHAR}/${CHAR}/${ENTRY}.
const DIR_NEST_DEPTH: usize = 3;

// Staged entries abandoned by a crashed process get swept once they are
// clearly not in use anymore.
const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

fn entry_suffix(fingerprint: &Fingerprint) -> PathBuf {
    let enc = data_encoding::BASE64URL_NOPAD.encode(fingerprint.as_bytes());
    let mut path = PathBuf::new();
    for i in 0..DIR_NEST_DEPTH {
        path.push(&enc[i..i + 1]);
    }
    path.push(&enc[DIR_NEST_DEPTH..]);
    path
}

/// What a finished real run produced: the artifact files still sitting at
/// their build paths, plus the captured streams and exit code.
#[derive(Debug)]
pub struct ArtifactSet {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub files: Vec<(OutputRole, PathBuf)>,
}

/// A cache hit: stream contents in memory, payload paths into the store.
#[derive(Debug)]
pub struct CachedEntry {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub files: Vec<(OutputRole, PathBuf)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    exit_code: i32,
    files: Vec<ManifestFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    role: OutputRole,
    name: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// The contract the orchestrator relies on: `lookup` is side-effect free
/// (apart from the LRU touch), `insert` is atomic per fingerprint.
#[auto_impl(&)]
pub trait ArtifactStore {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CachedEntry>>;
    fn insert(&self, fingerprint: &Fingerprint, set: &ArtifactSet) -> Result<()>;
}

enum LockMode {
    Lock,
    IfExists,
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.to_path_buf();
    // unwrap rationale: store paths always end in a real file name
    let mut basename = lock_path.file_name().unwrap().to_os_string();
    basename.push(".lock");
    lock_path.set_file_name(basename);
    lock_path
}

fn lock(path: &Path, mode: LockMode) -> Result<File> {
    let lock_path = lock_path_for(path);
    let mut open_options = fs::OpenOptions::new();
    // On Windows, the lock file must be opened in write mode -- append mode
    // isn't good enough.
    open_options.write(true);
    match mode {
        LockMode::Lock => {
            let dir = lock_path.parent().unwrap();
            fs::create_dir_all(dir)
                .wrap_err_with(|| format!("Failed to create directory {}", dir.display()))?;
            open_options.create(true);
        }
        LockMode::IfExists => {
            // don't create the directory or set create(); if the lock file
            // doesn't exist the open errors out and the probe misses
        }
    }
    let lock = open_options.open(&lock_path)?;
    // fs2::FileExt::lock_exclusive on Unix is a thin wrapper around
    // flock(2), and in particular doesn't handle EINTR.
    retry_interrupted(|| lock.lock_exclusive())?;
    Ok(lock)
}

#[derive(Debug)]
pub struct LocalStore {
    entries: PathBuf,
    tmp: PathBuf,
    stats_path: PathBuf,
    max_size: u64,
}

impl LocalStore {
    pub fn new(base: &Path, max_size: u64) -> Result<LocalStore> {
        let base = crate::fsutil::current_dir()?.join(base);
        let entries = base.join("entries");
        let tmp = base.join("tmp");
        fs::create_dir_all(&entries)?;
        fs::create_dir_all(&tmp)?;
        Ok(LocalStore {
            entries,
            tmp,
            stats_path: base.join("stats.json"),
            max_size,
        })
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.entries.join(entry_suffix(fingerprint))
    }

    /// Drop every cached entry (statistics survive; use `zero_stats` for
    /// those).
    pub fn clear(&self) -> Result<()> {
        fs::remove_dir_all(&self.entries)?;
        fs::create_dir_all(&self.entries)?;
        Ok(())
    }

    pub fn record_hit(&self) -> Result<()> {
        self.update_stats(|s| s.hits += 1)
    }

    pub fn record_miss(&self) -> Result<()> {
        self.update_stats(|s| s.misses += 1)
    }

    pub fn stats(&self) -> Result<Stats> {
        let _lock = lock(&self.stats_path, LockMode::Lock)?;
        Ok(self.read_stats())
    }

    pub fn zero_stats(&self) -> Result<()> {
        let _lock = lock(&self.stats_path, LockMode::Lock)?;
        crate::fsutil::atomic_write(&serde_json::to_vec(&Stats::default())?, &self.stats_path)?;
        Ok(())
    }

    fn read_stats(&self) -> Stats {
        // a missing or mangled stats file just reads as zero
        fs::read(&self.stats_path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default()
    }

    fn update_stats(&self, f: impl FnOnce(&mut Stats)) -> Result<()> {
        let _lock = lock(&self.stats_path, LockMode::Lock)?;
        let mut stats = self.read_stats();
        f(&mut stats);
        crate::fsutil::atomic_write(&serde_json::to_vec(&stats)?, &self.stats_path)?;
        Ok(())
    }

    /// Walk the entry tree: (entry dir, total payload bytes, LRU stamp).
    fn all_entries(&self) -> Result<Vec<(PathBuf, u64, SystemTime)>> {
        let mut found = Vec::new();
        let mut pending = vec![self.entries.clone()];
        while let Some(dir) = pending.pop() {
            for child in fs::read_dir(&dir)? {
                let child = child?;
                if !child.file_type()?.is_dir() {
                    continue;
                }
                let path = child.path();
                if path.join("manifest.json").is_file() {
                    let size = dir_size(&path)?;
                    let stamp = lock_stamp(&path);
                    found.push((path, size, stamp));
                } else {
                    pending.push(path);
                }
            }
        }
        Ok(found)
    }

    fn evict_to_budget(&self) -> Result<u64> {
        let mut entries = self.all_entries()?;
        let mut total: u64 = entries.iter().map(|(_, size, _)| size).sum();
        if total <= self.max_size {
            return Ok(0);
        }
        entries.sort_by_key(|(_, _, stamp)| *stamp);
        let mut evicted = 0;
        for (path, size, _) in entries {
            if total <= self.max_size {
                break;
            }
            let _lock = lock(&path, LockMode::Lock)?;
            fs::remove_dir_all(&path)?;
            // removing the lock file out from under a waiter is fine here:
            // the waiter re-checks for the manifest after acquiring
            let _ = fs::remove_file(lock_path_for(&path));
            total = total.saturating_sub(size);
            evicted += 1;
        }
        if evicted > 0 {
            self.update_stats(|s| s.evictions += evicted)?;
        }
        Ok(evicted)
    }

    fn sweep_stale_staging(&self) {
        let now = SystemTime::now();
        let children = match fs::read_dir(&self.tmp) {
            Ok(children) => children,
            Err(_) => return,
        };
        for child in children.flatten() {
            let old = child
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .map(|age| age > STALE_STAGING_AGE)
                .unwrap_or(false);
            if old {
                let path = child.path();
                let _ = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
            }
        }
    }
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for child in fs::read_dir(dir)? {
        let child = child?;
        let meta = child.metadata()?;
        if meta.is_dir() {
            total += dir_size(&child.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

fn lock_stamp(entry: &Path) -> SystemTime {
    fs::metadata(lock_path_for(entry))
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Bump the lock file's mtime so eviction sees this entry as recently
/// used.
fn touch_lock(lock: &File) {
    let _ = lock.set_len(1).and_then(|_| lock.set_len(0));
}

impl ArtifactStore for LocalStore {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CachedEntry>> {
        let path = self.entry_path(fingerprint);
        let lock = match lock(&path, LockMode::IfExists) {
            Ok(lock) => lock,
            Err(_) => return Ok(None),
        };
        let manifest_path = path.join("manifest.json");
        let raw = match fs::read(&manifest_path) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let manifest: Manifest = serde_json::from_slice(&raw)
            .wrap_err_with(|| format!("mangled manifest at {}", manifest_path.display()))?;
        touch_lock(&lock);

        Ok(Some(CachedEntry {
            exit_code: manifest.exit_code,
            stdout: fs::read(path.join("stdout"))?,
            stderr: fs::read(path.join("stderr"))?,
            files: manifest
                .files
                .into_iter()
                .map(|f| (f.role, path.join(f.name)))
                .collect(),
        }))
    }

    fn insert(&self, fingerprint: &Fingerprint, set: &ArtifactSet) -> Result<()> {
        let path = self.entry_path(fingerprint);
        {
            let _lock = lock(&path, LockMode::Lock)?;
            if path.join("manifest.json").is_file() {
                // someone else compiled the same thing concurrently
                return Ok(());
            }

            let staged = tempfile::tempdir_in(&self.tmp)?;
            let mut manifest = Manifest {
                exit_code: set.exit_code,
                files: Vec::with_capacity(set.files.len()),
            };
            for (role, source) in &set.files {
                let name = role.as_str().to_string();
                fs::copy(source, staged.path().join(&name)).wrap_err_with(|| {
                    format!("failed to capture {role} artifact from {}", source.display())
                })?;
                manifest.files.push(ManifestFile { role: *role, name });
            }
            fs::write(staged.path().join("stdout"), &set.stdout)?;
            fs::write(staged.path().join("stderr"), &set.stderr)?;
            let mut manifest_file = File::create(staged.path().join("manifest.json"))?;
            serde_json::to_writer(&manifest_file, &manifest)?;
            manifest_file.flush()?;
            drop(manifest_file);

            fs::rename(staged.into_path(), &path)?;
        }

        // the entry lock is released: eviction may take any entry's lock,
        // including the one just published
        self.sweep_stale_staging();
        self.evict_to_budget()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fingerprint(n: u8) -> Fingerprint {
        let mut hasher = crate::fingerprint::FingerprintHasher::new();
        hasher.segment("test", &[n]);
        hasher.finish()
    }

    fn artifact_set(dir: &Path, object_bytes: &[u8]) -> Result<ArtifactSet> {
        let object = dir.join("a.o");
        fs::write(&object, object_bytes)?;
        Ok(ArtifactSet {
            exit_code: 0,
            stdout: b"".to_vec(),
            stderr: b"warning: something minor\n".to_vec(),
            files: vec![(OutputRole::Object, object)],
        })
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = LocalStore::new(&tmp.path().join("cache"), u64::MAX)?;
        let fp = fingerprint(1);

        assert!(store.lookup(&fp)?.is_none());

        let set = artifact_set(tmp.path(), b"ELF object bytes")?;
        store.insert(&fp, &set)?;

        let entry = store.lookup(&fp)?.unwrap();
        assert_eq!(entry.exit_code, 0);
        assert_eq!(entry.stderr, b"warning: something minor\n");
        assert_eq!(entry.files.len(), 1);
        let (role, stored) = &entry.files[0];
        assert_eq!(*role, OutputRole::Object);
        assert_eq!(fs::read(stored)?, b"ELF object bytes");
        Ok(())
    }

    #[test]
    fn test_probe_miss_leaves_no_litter() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = LocalStore::new(&tmp.path().join("cache"), u64::MAX)?;
        assert!(store.lookup(&fingerprint(2))?.is_none());
        // probing must not scatter lock files or fanout directories around
        assert_eq!(fs::read_dir(&store.entries)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_first_writer_wins() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = LocalStore::new(&tmp.path().join("cache"), u64::MAX)?;
        let fp = fingerprint(3);

        store.insert(&fp, &artifact_set(tmp.path(), b"first")?)?;
        store.insert(&fp, &artifact_set(tmp.path(), b"second")?)?;

        let entry = store.lookup(&fp)?.unwrap();
        assert_eq!(fs::read(&entry.files[0].1)?, b"first");
        Ok(())
    }

    #[test]
    fn test_eviction_oldest_first() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        // budget fits roughly two of the three entries
        let store = LocalStore::new(&tmp.path().join("cache"), 2 * 1024 + 512)?;

        for n in 0..3 {
            let set = artifact_set(tmp.path(), &vec![n; 1024])?;
            store.insert(&fingerprint(n), &set)?;
            // the lock mtime is the LRU clock; space the entries out so the
            // ordering is unambiguous
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        assert!(store.lookup(&fingerprint(0))?.is_none());
        assert!(store.lookup(&fingerprint(1))?.is_some());
        assert!(store.lookup(&fingerprint(2))?.is_some());
        assert!(store.stats()?.evictions >= 1);
        Ok(())
    }

    #[test]
    fn test_lookup_refreshes_lru_stamp() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = LocalStore::new(&tmp.path().join("cache"), 2 * 1024 + 512)?;

        store.insert(&fingerprint(0), &artifact_set(tmp.path(), &vec![0; 1024])?)?;
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.insert(&fingerprint(1), &artifact_set(tmp.path(), &vec![1; 1024])?)?;
        std::thread::sleep(std::time::Duration::from_millis(20));

        // touch entry 0 so entry 1 becomes the eviction candidate
        assert!(store.lookup(&fingerprint(0))?.is_some());
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.insert(&fingerprint(2), &artifact_set(tmp.path(), &vec![2; 1024])?)?;

        assert!(store.lookup(&fingerprint(0))?.is_some());
        assert!(store.lookup(&fingerprint(1))?.is_none());
        Ok(())
    }

    #[test]
    fn test_clear() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = LocalStore::new(&tmp.path().join("cache"), u64::MAX)?;
        let fp = fingerprint(7);
        store.insert(&fp, &artifact_set(tmp.path(), b"bytes")?)?;
        store.clear()?;
        assert!(store.lookup(&fp)?.is_none());
        Ok(())
    }

    #[test]
    fn test_manifest_format() {
        let manifest = Manifest {
            exit_code: 0,
            files: vec![
                ManifestFile {
                    role: OutputRole::Object,
                    name: "object".into(),
                },
                ManifestFile {
                    role: OutputRole::CoverageNotes,
                    name: "coverage-notes".into(),
                },
            ],
        };
        insta::assert_snapshot!(
            serde_json::to_string_pretty(&manifest).unwrap(),
            @r###"
        {
          "exit_code": 0,
          "files": [
            {
              "role": "object",
              "name": "object"
            },
            {
              "role": "coverage-notes",
              "name": "coverage-notes"
            }
          ]
        }
        "###
        );
    }

    #[test]
    fn test_stats_counters() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let base = tmp.path().join("cache");
        {
            let store = LocalStore::new(&base, u64::MAX)?;
            store.record_miss()?;
            store.record_hit()?;
            store.record_hit()?;
        }
        // counters survive across store instances
        let store = LocalStore::new(&base, u64::MAX)?;
        let stats = store.stats()?;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);

        store.zero_stats()?;
        let stats = store.stats()?;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        Ok(())
    }
}
