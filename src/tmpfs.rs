//! Scratch directories and files for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn unique_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    format!("{}_{}", nanos, NEXT_ID.fetch_add(1, Ordering::SeqCst))
}

pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let base = std::env::temp_dir().join("emberdb_tests");
        fs::create_dir_all(&base)?;

        let path = base.join(format!("dir_{}_{}", std::process::id(), unique_suffix()));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir(&path)?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

pub struct NamedTempFile {
    path: PathBuf,
}

impl NamedTempFile {
    pub fn new() -> std::io::Result<Self> {
        let base = std::env::temp_dir().join("emberdb_tests");
        fs::create_dir_all(&base)?;

        let path = base.join(format!("file_{}_{}", std::process::id(), unique_suffix()));
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
