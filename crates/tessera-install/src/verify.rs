//! On-disk verification
//!
//! [`Verifier`] lazily hashes installed files against expected digests,
//! yielding one [`VerifyEntry`] per file. Files are streamed in 1 MiB reads.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Read size while hashing
pub const READ_CHUNK: usize = 1024 * 1024;

/// Digest used for comparison
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// Manifest file hashes
    #[default]
    Sha1,
    /// File list version 2 digests
    Sha256,
}

/// Outcome for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyResult {
    /// Digest equals the expected one
    Match,
    /// File exists with different content
    Mismatch,
    /// File does not exist
    Missing,
    /// File exists but could not be read
    OtherError,
}

/// One verified file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEntry {
    /// Outcome
    pub result: VerifyResult,
    /// Path relative to the install root
    pub path: String,
    /// Lowercase hex digest, empty when the file could not be read
    pub actual: String,
}

/// Iterator over verification results
pub struct Verifier {
    root: PathBuf,
    files: std::vec::IntoIter<(String, String)>,
    algorithm: HashAlgorithm,
}

impl Verifier {
    /// Verify `(path, expected_hex)` pairs below `root`
    pub fn new(
        root: impl Into<PathBuf>,
        files: Vec<(String, String)>,
        algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            root: root.into(),
            files: files.into_iter(),
            algorithm,
        }
    }

    fn check(&self, path: String, expected: &str) -> VerifyEntry {
        match hash_file(&self.root.join(&path), self.algorithm) {
            Ok(actual) => VerifyEntry {
                result: if actual.eq_ignore_ascii_case(expected) {
                    VerifyResult::Match
                } else {
                    VerifyResult::Mismatch
                },
                path,
                actual,
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => VerifyEntry {
                result: VerifyResult::Missing,
                path,
                actual: String::new(),
            },
            Err(e) => {
                tracing::warn!("Could not verify {path}: {e}");
                VerifyEntry {
                    result: VerifyResult::OtherError,
                    path,
                    actual: String::new(),
                }
            }
        }
    }
}

impl Iterator for Verifier {
    type Item = VerifyEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let (path, expected) = self.files.next()?;
        Some(self.check(path, &expected))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.files.size_hint()
    }
}

impl ExactSizeIterator for Verifier {}

/// Hex digest of a file
pub fn hash_file(path: &std::path::Path, algorithm: HashAlgorithm) -> io::Result<String> {
    let file = File::open(path)?;
    match algorithm {
        HashAlgorithm::Sha1 => stream::<Sha1>(file),
        HashAlgorithm::Sha256 => stream::<Sha256>(file),
    }
}

fn stream<D: Digest>(mut file: File) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
