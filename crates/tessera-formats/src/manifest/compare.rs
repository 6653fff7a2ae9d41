//! File-level comparison of two manifests

use std::collections::HashSet;

use super::Manifest;

/// Four disjoint filename sets describing how a build changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestComparison {
    /// In the new manifest only
    pub added: HashSet<String>,
    /// In the old manifest only
    pub removed: HashSet<String>,
    /// In both, with different SHA-1
    pub changed: HashSet<String>,
    /// In both, with identical SHA-1
    pub unchanged: HashSet<String>,
}

impl ManifestComparison {
    /// Compare `new` against an optional `old`
    ///
    /// Without an old manifest every file counts as added.
    pub fn create(new: &Manifest, old: Option<&Manifest>) -> Self {
        let mut comparison = Self::default();

        let Some(old) = old else {
            comparison.added = new
                .file_manifest_list
                .elements()
                .iter()
                .map(|f| f.filename.clone())
                .collect();
            return comparison;
        };

        for file in new.file_manifest_list.elements() {
            match old.file(&file.filename) {
                None => {
                    comparison.added.insert(file.filename.clone());
                }
                Some(old_file) if old_file.sha_hash == file.sha_hash => {
                    comparison.unchanged.insert(file.filename.clone());
                }
                Some(_) => {
                    comparison.changed.insert(file.filename.clone());
                }
            }
        }

        for file in old.file_manifest_list.elements() {
            if new.file(&file.filename).is_none() {
                comparison.removed.insert(file.filename.clone());
            }
        }

        comparison
    }

    /// Total number of files across all sets
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len() + self.unchanged.len()
    }

    /// Whether all sets are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::manifest_with_files;

    #[test]
    fn test_without_old_everything_added() {
        let new = manifest_with_files(&[("a", 1), ("b", 2)]);
        let cmp = ManifestComparison::create(&new, None);
        assert_eq!(cmp.added.len(), 2);
        assert!(cmp.removed.is_empty() && cmp.changed.is_empty() && cmp.unchanged.is_empty());
    }

    #[test]
    fn test_four_sets() {
        let old = manifest_with_files(&[("keep", 1), ("edit", 2), ("gone", 3)]);
        let new = manifest_with_files(&[("keep", 1), ("edit", 9), ("fresh", 4)]);
        let cmp = ManifestComparison::create(&new, Some(&old));
        assert!(cmp.unchanged.contains("keep"));
        assert!(cmp.changed.contains("edit"));
        assert!(cmp.removed.contains("gone"));
        assert!(cmp.added.contains("fresh"));
        assert_eq!(cmp.len(), 4);
    }
}
