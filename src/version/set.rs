//! The version set: the authoritative record of which tables exist, the
//! file-number allocator, and the manifest log that persists edits.
//!
//! The CURRENT file names the live manifest; replaying that manifest's
//! version edits reconstructs the current [`Version`]. `log_and_apply` is
//! the single choke point for structural changes: it encodes an edit,
//! makes it durable in the manifest, atomically repoints CURRENT when a
//! fresh manifest was started, and only then installs the new version.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::filenames::{make_filename, FileType};
use crate::record;
use crate::version::edit::{BulkVersionEdit, VersionEdit};
use crate::version::Version;

/// Atomically points CURRENT at the given manifest: the name is written to
/// a temp file, synced, then renamed over CURRENT.
fn set_current_file(dirname: &Path, manifest_file_number: u64) -> Result<()> {
    let manifest_name = make_filename(Path::new(""), FileType::Manifest, manifest_file_number);
    let tmp_path = make_filename(dirname, FileType::Temp, manifest_file_number);
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(manifest_name.to_string_lossy().as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, make_filename(dirname, FileType::Current, 0))?;
    Ok(())
}

pub struct VersionSet {
    dirname: PathBuf,
    comparator_name: &'static str,
    cmp: fn(&[u8], &[u8]) -> std::cmp::Ordering,
    num_levels: usize,

    /// Oldest first; the last entry is the published current version.
    versions: Vec<Arc<Version>>,

    pub log_number: u64,
    pub prev_log_number: u64,
    next_file_number: u64,
    pub manifest_file_number: u64,
    /// Last sequence number recovered from the manifest; the commit
    /// pipeline is seeded from this at open.
    pub last_sequence: u64,

    manifest: Option<record::Writer>,
}

impl VersionSet {
    /// Writes the initial manifest and CURRENT for a freshly created store.
    pub fn create_initial(dirname: &Path, opts: &Options) -> Result<()> {
        let manifest_file_number = 1;
        let path = make_filename(dirname, FileType::Manifest, manifest_file_number);
        let result = (|| -> Result<()> {
            let mut writer = record::Writer::new(File::create(&path)?)?;
            let edit = VersionEdit {
                comparator_name: Some(opts.comparator.name.to_string()),
                next_file_number: Some(2),
                ..Default::default()
            };
            writer.add_record(&edit.encode())?;
            writer.sync()?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        set_current_file(dirname, manifest_file_number)
    }

    /// Loads the version set named by CURRENT.
    pub fn load(dirname: &Path, opts: &Options) -> Result<Self> {
        let mut vs = Self {
            dirname: dirname.to_path_buf(),
            comparator_name: opts.comparator.name,
            cmp: opts.comparator.compare,
            num_levels: opts.num_levels,
            versions: Vec::new(),
            log_number: 0,
            prev_log_number: 0,
            // For historical reasons, file numbering starts at 2.
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            manifest: None,
        };

        let current_path = make_filename(dirname, FileType::Current, 0);
        let current = fs::read(&current_path)
            .map_err(|e| Error::Corruption(format!("could not read CURRENT: {e}")))?;
        if current.is_empty() {
            return Err(Error::Corruption("CURRENT file is empty".to_string()));
        }
        if current.len() > 4096 {
            return Err(Error::Corruption("CURRENT file is too large".to_string()));
        }
        if current[current.len() - 1] != b'\n' {
            return Err(Error::Corruption(
                "CURRENT file is not newline-terminated".to_string(),
            ));
        }
        let manifest_name = std::str::from_utf8(&current[..current.len() - 1])
            .map_err(|_| Error::Corruption("CURRENT file is not utf-8".to_string()))?;

        let manifest_path = dirname.join(manifest_name);
        let manifest_file = File::open(&manifest_path).map_err(|e| {
            Error::Corruption(format!("could not open manifest {manifest_name}: {e}"))
        })?;

        let mut bve = BulkVersionEdit::default();
        let mut reader = record::Reader::new(manifest_file);
        while let Some(data) = reader.read_record()? {
            let edit = VersionEdit::decode(&data)?;
            if let Some(name) = &edit.comparator_name {
                if name != vs.comparator_name {
                    return Err(Error::Corruption(format!(
                        "comparator mismatch: manifest has {name:?}, options have {:?}",
                        vs.comparator_name
                    )));
                }
            }
            bve.accumulate(&edit);
            if let Some(n) = edit.log_number {
                vs.log_number = n;
            }
            if let Some(n) = edit.prev_log_number {
                vs.prev_log_number = n;
            }
            if let Some(n) = edit.next_file_number {
                vs.next_file_number = n;
            }
            if let Some(n) = edit.last_sequence {
                vs.last_sequence = n;
            }
        }

        if vs.log_number == 0 && vs.next_file_number != 2 {
            // A used store always names its WAL; only a freshly created
            // one (file numbering untouched) may omit it.
            return Err(Error::Corruption(format!(
                "incomplete manifest {manifest_name}"
            )));
        }
        vs.mark_file_num_used(vs.log_number);
        vs.mark_file_num_used(vs.prev_log_number);
        vs.manifest_file_number = vs.next_file_num();

        let version = bve.apply(None, vs.num_levels, vs.cmp)?;
        vs.install(version);
        Ok(vs)
    }

    /// The published current version.
    pub fn current(&self) -> &Arc<Version> {
        self.versions.last().expect("version set has no versions")
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Installs a freshly built version as current. The new version takes
    /// the current-reference; the superseded version drops its own.
    fn install(&mut self, version: Version) {
        debug_assert_eq!(version.refs(), 0, "installed version must be unreferenced");
        version.ref_();
        if let Some(prev) = self.versions.last() {
            prev.unref();
        }
        self.versions.push(Arc::new(version));
    }

    /// Ensures `next_file_number` allocates strictly above `file_num`.
    pub fn mark_file_num_used(&mut self, file_num: u64) {
        if self.next_file_number <= file_num {
            self.next_file_number = file_num + 1;
        }
    }

    /// Allocates a fresh file number; never reused.
    pub fn next_file_num(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Persists `edit` to the manifest and installs the resulting version.
    /// Called with the DB lock held. CURRENT is only rewritten after the
    /// manifest record is durable, so a crash replays either the old or the
    /// new manifest, never a half-installed one.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit, last_sequence: u64) -> Result<()> {
        if let Some(log_number) = edit.log_number {
            if log_number < self.log_number || self.next_file_number <= log_number {
                return Err(Error::Invariant(format!(
                    "version edit log number {log_number} outside [{}, {})",
                    self.log_number, self.next_file_number
                )));
            }
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(last_sequence);

        let new_version = {
            let mut bve = BulkVersionEdit::default();
            bve.accumulate(edit);
            bve.apply(Some(self.current()), self.num_levels, self.cmp)?
        };

        if self.manifest.is_none() {
            self.create_manifest()?;
        }
        let manifest = self.manifest.as_mut().expect("manifest writer exists");
        manifest.add_record(&edit.encode())?;
        manifest.flush()?;
        manifest.sync()?;
        // Only after the record is durable may CURRENT name this manifest.
        set_current_file(&self.dirname, self.manifest_file_number)?;

        self.install(new_version);
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        if let Some(n) = edit.prev_log_number {
            self.prev_log_number = n;
        }
        Ok(())
    }

    /// Starts a new manifest seeded with a snapshot of the current version.
    /// A partially written file is removed on error.
    fn create_manifest(&mut self) -> Result<()> {
        let path = make_filename(&self.dirname, FileType::Manifest, self.manifest_file_number);
        let result = (|| -> Result<record::Writer> {
            let mut writer = record::Writer::new(File::create(&path)?)?;
            let mut snapshot = VersionEdit {
                comparator_name: Some(self.comparator_name.to_string()),
                ..Default::default()
            };
            for (level, files) in self.current().files.iter().enumerate() {
                for file in files {
                    snapshot.new_files.push((level, Arc::clone(file)));
                }
            }
            writer.add_record(&snapshot.encode())?;
            Ok(writer)
        })();
        match result {
            Ok(writer) => {
                self.manifest = Some(writer);
                tracing::info!(
                    manifest = self.manifest_file_number,
                    "started new manifest"
                );
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// File numbers referenced by any version still in the list.
    pub fn live_file_nums(&self) -> HashSet<u64> {
        let mut live = HashSet::new();
        for version in &self.versions {
            live.extend(version.file_nums());
        }
        live
    }

    /// Unlinks versions nobody references anymore. The current version is
    /// always retained.
    pub fn purge_obsolete_versions(&mut self) {
        let len = self.versions.len();
        if len <= 1 {
            return;
        }
        let current = len - 1;
        let mut idx = 0;
        self.versions.retain(|v| {
            let keep = idx == current || v.refs() > 0;
            idx += 1;
            keep
        });
    }

    /// Number of versions still linked (tests and GC accounting).
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{InternalKey, InternalKeyKind};
    use crate::tmpfs::TempDir;
    use crate::version::FileMetadata;

    fn test_opts(dir: &Path) -> Options {
        Options::new(dir)
    }

    fn meta(file_num: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetadata> {
        Arc::new(FileMetadata {
            file_num,
            size: 1024,
            smallest: InternalKey::new(smallest.to_vec(), 9, InternalKeyKind::Set),
            largest: InternalKey::new(largest.to_vec(), 1, InternalKeyKind::Set),
        })
    }

    #[test]
    fn test_create_then_load_fresh() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts(dir.path());
        VersionSet::create_initial(dir.path(), &opts).expect("create failed");

        let vs = VersionSet::load(dir.path(), &opts).expect("load failed");
        assert_eq!(vs.log_number, 0);
        assert_eq!(vs.last_sequence, 0);
        // The initial manifest consumed file number 1; loading allocated
        // the next manifest's number.
        assert_eq!(vs.manifest_file_number, 2);
        assert!(vs.current().file_nums().next().is_none());
    }

    #[test]
    fn test_log_and_apply_persists_files() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts(dir.path());
        VersionSet::create_initial(dir.path(), &opts).expect("create failed");

        {
            let mut vs = VersionSet::load(dir.path(), &opts).expect("load failed");
            let log_num = vs.next_file_num();
            let mut edit = VersionEdit {
                log_number: Some(log_num),
                ..Default::default()
            };
            edit.new_files.push((0, meta(9, b"a", b"m")));
            vs.mark_file_num_used(9);
            vs.log_and_apply(&mut edit, 17).expect("log_and_apply failed");
            assert_eq!(vs.log_number, log_num);
        }

        let vs = VersionSet::load(dir.path(), &opts).expect("reload failed");
        assert_eq!(vs.last_sequence, 17);
        let nums: Vec<_> = vs.current().file_nums().collect();
        assert_eq!(nums, vec![9]);
        // File numbers stay strictly increasing across restarts.
        assert!(vs.next_file_number > 9);
    }

    #[test]
    fn test_log_and_apply_rejects_stale_log_number() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts(dir.path());
        VersionSet::create_initial(dir.path(), &opts).expect("create failed");
        let mut vs = VersionSet::load(dir.path(), &opts).expect("load failed");

        let log_num = vs.next_file_num();
        let mut edit = VersionEdit {
            log_number: Some(log_num),
            ..Default::default()
        };
        vs.log_and_apply(&mut edit, 0).expect("first apply");

        // A log number below the installed one violates the invariant.
        let mut stale = VersionEdit {
            log_number: Some(log_num - 1),
            ..Default::default()
        };
        assert!(matches!(
            vs.log_and_apply(&mut stale, 0),
            Err(Error::Invariant(_))
        ));

        // So does one that was never allocated.
        let mut unallocated = VersionEdit {
            log_number: Some(1_000_000),
            ..Default::default()
        };
        assert!(matches!(
            vs.log_and_apply(&mut unallocated, 0),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_load_rejects_malformed_current() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts(dir.path());

        assert!(matches!(
            VersionSet::load(dir.path(), &opts),
            Err(Error::Corruption(_))
        ));

        fs::write(dir.path().join("CURRENT"), b"MANIFEST-000001").unwrap();
        assert!(matches!(
            VersionSet::load(dir.path(), &opts),
            Err(Error::Corruption(_))
        ));

        fs::write(dir.path().join("CURRENT"), b"MANIFEST-000404\n").unwrap();
        assert!(matches!(
            VersionSet::load(dir.path(), &opts),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_load_rejects_comparator_mismatch() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts(dir.path());
        VersionSet::create_initial(dir.path(), &opts).expect("create failed");

        fn reversed(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
            b.cmp(a)
        }
        let other = Options::new(dir.path()).comparator(crate::config::Comparator {
            name: "emberdb.ReverseComparator",
            compare: reversed,
        });
        assert!(matches!(
            VersionSet::load(dir.path(), &other),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_version_refcount_lifecycle() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts(dir.path());
        VersionSet::create_initial(dir.path(), &opts).expect("create failed");
        let mut vs = VersionSet::load(dir.path(), &opts).expect("load failed");

        // A reader takes a reference on the current version.
        let reader_version = Arc::clone(vs.current());
        reader_version.ref_();

        let mut edit = VersionEdit::default();
        edit.new_files.push((0, meta(8, b"a", b"b")));
        vs.mark_file_num_used(8);
        vs.log_and_apply(&mut edit, 1).expect("apply failed");
        assert_eq!(vs.version_count(), 2);

        // The old version is pinned by the reader, so purging keeps it.
        vs.purge_obsolete_versions();
        assert_eq!(vs.version_count(), 2);

        // Reader done: the old version unlinks.
        reader_version.unref();
        vs.purge_obsolete_versions();
        assert_eq!(vs.version_count(), 1);
        assert_eq!(vs.current().refs(), 1);
    }

    #[test]
    fn test_live_file_nums_spans_versions() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts(dir.path());
        VersionSet::create_initial(dir.path(), &opts).expect("create failed");
        let mut vs = VersionSet::load(dir.path(), &opts).expect("load failed");

        let old = Arc::clone(vs.current());
        old.ref_();

        let mut edit = VersionEdit::default();
        edit.new_files.push((0, meta(8, b"a", b"b")));
        vs.mark_file_num_used(8);
        vs.log_and_apply(&mut edit, 1).expect("apply failed");

        let mut edit = VersionEdit::default();
        edit.deleted_files.insert((0, 8));
        edit.new_files.push((1, meta(9, b"a", b"b")));
        vs.mark_file_num_used(9);
        vs.log_and_apply(&mut edit, 2).expect("apply failed");

        // File 8 is gone from current but still live through the middle
        // version in the list.
        let live = vs.live_file_nums();
        assert!(live.contains(&8));
        assert!(live.contains(&9));
    }
}
