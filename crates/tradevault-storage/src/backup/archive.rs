//! File-level helpers for backup artifacts: gzip, copy, naming.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

pub(crate) const COMPRESSED_SUFFIX: &str = "db.gz";
pub(crate) const PLAIN_SUFFIX: &str = "db";

/// Backup id derived from the creation time, e.g. `backup_20240314_093015_042`.
pub(crate) fn backup_id(at: DateTime<Utc>) -> String {
    at.format("backup_%Y%m%d_%H%M%S_%3f").to_string()
}

pub(crate) fn backup_file_name(id: &str, compressed: bool) -> String {
    let suffix = if compressed { COMPRESSED_SUFFIX } else { PLAIN_SUFFIX };
    format!("{id}.{suffix}")
}

/// Gzip `src` into a new file at `dst`. Returns the compressed size.
pub(crate) fn compress_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dst)?), Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(fs::metadata(dst)?.len())
}

pub(crate) fn decompress_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(File::create(dst)?);
    let written = io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(written)
}

/// Write the uncompressed store held in `backup` to `dst`.
pub(crate) fn materialize(backup: &Path, compressed: bool, dst: &Path) -> io::Result<u64> {
    if compressed {
        decompress_file(backup, dst)
    } else {
        let copied = fs::copy(backup, dst)?;
        File::open(dst)?.sync_all()?;
        Ok(copied)
    }
}

/// SQLite side files that belong to `db`.
pub(crate) fn side_files(db: &Path) -> [PathBuf; 2] {
    [with_suffix(db, "-wal"), with_suffix(db, "-shm")]
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Scratch file removed on drop unless kept.
pub(crate) struct ScratchFile {
    path: PathBuf,
    keep: bool,
}

impl ScratchFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = remove_if_exists(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove scratch file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_backup_id_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 14, 9, 30, 15).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(backup_id(at), "backup_20240314_093015_042");
        assert_eq!(backup_file_name("b", true), "b.db.gz");
        assert_eq!(backup_file_name("b", false), "b.db");
    }

    #[test]
    fn test_gzip_round_trip() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.db");
        let gz = dir.path().join("src.db.gz");
        let out = dir.path().join("out.db");
        let payload = b"inventory ".repeat(1000);
        fs::write(&src, &payload).unwrap();

        let compressed = compress_file(&src, &gz).unwrap();
        assert!(compressed < payload.len() as u64);
        assert_eq!(materialize(&gz, true, &out).unwrap(), payload.len() as u64);
        assert_eq!(fs::read(&out).unwrap(), payload);
    }

    #[test]
    fn test_scratch_file_cleanup() {
        let dir = tempdir().unwrap();
        let removed = dir.path().join("a.tmp");
        let kept = dir.path().join("b.tmp");
        fs::write(&removed, b"x").unwrap();
        fs::write(&kept, b"y").unwrap();

        drop(ScratchFile::new(removed.clone()));
        let kept_path = ScratchFile::new(kept.clone()).keep();

        assert!(!removed.exists());
        assert!(kept_path.exists());
        assert_eq!(with_suffix(&kept, "-wal").file_name().unwrap(), "b.tmp-wal");
    }
}
