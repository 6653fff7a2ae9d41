//! Delta manifest overlay

use std::collections::HashSet;

use super::Manifest;

impl Manifest {
    /// Overlay a delta manifest onto this one
    ///
    /// Files present in both take the delta's entry, files only in the delta
    /// are appended, and chunks from the delta that are not already listed
    /// are appended. Lookup indices are rebuilt afterwards.
    pub fn apply_delta(&mut self, delta: &Self) {
        let mut replaced: HashSet<&str> = HashSet::new();

        for index in 0..self.file_manifest_list.len() {
            let name = &self.file_manifest_list.elements()[index].filename;
            if let Some(delta_file) = delta.file(name) {
                replaced.insert(delta_file.filename.as_str());
                self.file_manifest_list.replace(index, delta_file.clone());
            }
        }

        for delta_file in delta.file_manifest_list.elements() {
            if !replaced.contains(delta_file.filename.as_str()) {
                self.file_manifest_list.push(delta_file.clone());
            }
        }

        for chunk in delta.chunk_data_list.elements() {
            if !self.chunk_data_list.contains(&chunk.guid) {
                self.chunk_data_list.push(chunk.clone());
            }
        }

        self.file_manifest_list.invalidate();
        self.chunk_data_list.invalidate();
    }
}
