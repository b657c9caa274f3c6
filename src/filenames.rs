//! On-disk file naming.
//!
//! A store directory contains:
//!
//! - `CURRENT`       names the live manifest, newline-terminated
//! - `MANIFEST-<n>`  framed log of version edits
//! - `<n>.log`       write-ahead log
//! - `<n>.sst`       sorted table
//! - `<n>.tmp`       scratch file, atomically renamed into place
//! - `LOCK`          exclusive-open lock file

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Current,
    Lock,
    Manifest,
    Log,
    Table,
    Temp,
}

/// Builds the path for a file of the given type. `num` is ignored for
/// CURRENT and LOCK.
pub fn make_filename(dir: &Path, ftype: FileType, num: u64) -> PathBuf {
    match ftype {
        FileType::Current => dir.join("CURRENT"),
        FileType::Lock => dir.join("LOCK"),
        FileType::Manifest => dir.join(format!("MANIFEST-{num:06}")),
        FileType::Log => dir.join(format!("{num:06}.log")),
        FileType::Table => dir.join(format!("{num:06}.sst")),
        FileType::Temp => dir.join(format!("{num:06}.tmp")),
    }
}

/// Parses a file name back into its type and number. Returns None for
/// foreign files, which the garbage collector leaves alone.
pub fn parse_filename(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        _ => {}
    }
    if let Some(num) = name.strip_prefix("MANIFEST-") {
        return num.parse().ok().map(|n| (FileType::Manifest, n));
    }
    if let Some(num) = name.strip_suffix(".log") {
        return num.parse().ok().map(|n| (FileType::Log, n));
    }
    if let Some(num) = name.strip_suffix(".sst") {
        return num.parse().ok().map(|n| (FileType::Table, n));
    }
    if let Some(num) = name.strip_suffix(".tmp") {
        return num.parse().ok().map(|n| (FileType::Temp, n));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let dir = Path::new("/db");
        for (ftype, num) in [
            (FileType::Manifest, 3),
            (FileType::Log, 12),
            (FileType::Table, 7),
            (FileType::Temp, 9),
        ] {
            let path = make_filename(dir, ftype, num);
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(parse_filename(name), Some((ftype, num)));
        }
        assert_eq!(parse_filename("CURRENT"), Some((FileType::Current, 0)));
        assert_eq!(parse_filename("LOCK"), Some((FileType::Lock, 0)));
    }

    #[test]
    fn test_foreign_files_ignored() {
        assert_eq!(parse_filename("foo.txt"), None);
        assert_eq!(parse_filename("MANIFEST-abc"), None);
        assert_eq!(parse_filename(".log"), None);
    }
}
