//! Resume log and repair file
//!
//! Both files share one line format, `sha_hex:path`. The resume log is
//! appended to as files complete; the repair file is written in one go by
//! verification and later replayed as if it were a resume log.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tessera_crypto::ShaHash;

use crate::error::Result;

/// One `sha_hex:path` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeEntry {
    /// Lowercase hex digest, empty for files that were missing
    pub sha: String,
    /// Path relative to the install root
    pub path: String,
}

impl ResumeEntry {
    /// Parse a line; `None` for blank or malformed lines
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (sha, path) = line.split_once(':')?;
        if path.is_empty() {
            return None;
        }
        Some(Self {
            sha: sha.trim().to_ascii_lowercase(),
            path: path.to_string(),
        })
    }

    /// Whether the recorded digest equals `hash`
    pub fn matches(&self, hash: &ShaHash) -> bool {
        self.sha == hash.to_hex()
    }
}

/// Read every well-formed entry of a resume log or repair file
pub fn read_entries(path: &Path) -> Result<Vec<ResumeEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        if let Some(entry) = ResumeEntry::parse(&line?) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Write a complete repair file
pub fn write_repair_file<I, S, P>(path: &Path, entries: I) -> Result<()>
where
    I: IntoIterator<Item = (S, P)>,
    S: AsRef<str>,
    P: AsRef<str>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::io::BufWriter::new(File::create(path)?);
    for (sha, file) in entries {
        writeln!(out, "{}:{}", sha.as_ref(), file.as_ref())?;
    }
    out.flush()?;
    Ok(())
}

/// Append-only resume log
#[derive(Debug)]
pub struct ResumeLog {
    path: PathBuf,
    file: File,
}

impl ResumeLog {
    /// Open for appending, creating the file and its directory
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Record a completed file
    pub fn append(&mut self, sha: &ShaHash, file: &str) -> Result<()> {
        let line = format!("{}:{file}\n", sha.to_hex());
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// Log location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_lines() {
        let entry = ResumeEntry::parse("ABCD:dir/file:with:colons\n").unwrap();
        assert_eq!(entry.sha, "abcd");
        assert_eq!(entry.path, "dir/file:with:colons");
        assert_eq!(
            ResumeEntry::parse(":missing/file").unwrap().sha,
            String::new()
        );
        assert!(ResumeEntry::parse("").is_none());
        assert!(ResumeEntry::parse("no separator").is_none());
        assert!(ResumeEntry::parse("abcd:").is_none());
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tmp/app_1.resume");
        let hash = ShaHash::from_data(b"content");

        {
            let mut log = ResumeLog::open(&path).unwrap();
            log.append(&hash, "a.bin").unwrap();
        }
        {
            let mut log = ResumeLog::open(&path).unwrap();
            log.append(&hash, "b/c.bin").unwrap();
        }

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].matches(&hash));
        assert_eq!(entries[1].path, "b/c.bin");
    }

    #[test]
    fn test_repair_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.repair");
        write_repair_file(&path, [("00ff", "a"), ("", "b")]).unwrap();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries[0].sha, "00ff");
        assert_eq!(entries[1].sha, "");
        assert_eq!(entries[1].path, "b");
    }
}
