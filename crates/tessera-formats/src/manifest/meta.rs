//! Manifest metadata section

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use binrw::io::{Read, Seek, Write};
use binrw::{BinReaderExt, BinWrite};
use sha1::{Digest, Sha1};

use super::codec::{
    check_section, read_fstring, read_fstring_list, write_fstring, write_fstring_list,
    write_section,
};
use super::error::Result;

/// Build metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMeta {
    /// Layout version of this section (0, 1 or 2)
    pub data_version: u8,
    /// Manifest feature level
    pub feature_level: u32,
    /// Whether the manifest describes file data (as opposed to chunk data)
    pub is_file_data: bool,
    /// Numeric application id
    pub app_id: u32,
    /// Application name
    pub app_name: String,
    /// Build version string
    pub build_version: String,
    /// Executable to launch, relative to the install root
    pub launch_exe: String,
    /// Command line passed to the executable
    pub launch_command: String,
    /// Prerequisite identifiers
    pub prereq_ids: Vec<String>,
    /// Prerequisite display name
    pub prereq_name: String,
    /// Prerequisite installer path
    pub prereq_path: String,
    /// Prerequisite installer arguments
    pub prereq_args: String,
    /// Stored build id (data version >= 1)
    pub build_id: Option<String>,
    /// Uninstall action path (data version >= 2)
    pub uninstall_action_path: String,
    /// Uninstall action arguments (data version >= 2)
    pub uninstall_action_args: String,
}

impl Default for ManifestMeta {
    fn default() -> Self {
        Self {
            data_version: 0,
            feature_level: super::DEFAULT_FEATURE_LEVEL,
            is_file_data: false,
            app_id: 0,
            app_name: String::new(),
            build_version: String::new(),
            launch_exe: String::new(),
            launch_command: String::new(),
            prereq_ids: Vec::new(),
            prereq_name: String::new(),
            prereq_path: String::new(),
            prereq_args: String::new(),
            build_id: None,
            uninstall_action_path: String::new(),
            uninstall_action_args: String::new(),
        }
    }
}

impl ManifestMeta {
    /// Build id: the stored one, or one derived from the other fields
    pub fn build_id(&self) -> String {
        self.build_id.clone().unwrap_or_else(|| self.derive_build_id())
    }

    /// Derive a build id as `base64url(SHA1(app_id | app_name | build_version | launch_exe | launch_command))`
    pub fn derive_build_id(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.app_id.to_le_bytes());
        hasher.update(self.app_name.as_bytes());
        hasher.update(self.build_version.as_bytes());
        hasher.update(self.launch_exe.as_bytes());
        hasher.update(self.launch_command.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    pub(crate) fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let start = reader.stream_position()?;
        let size: u32 = reader.read_le()?;

        let data_version: u8 = reader.read_le()?;
        let feature_level: u32 = reader.read_le()?;
        let is_file_data = reader.read_le::<u8>()? != 0;
        let app_id: u32 = reader.read_le()?;
        let app_name = read_fstring(reader)?;
        let build_version = read_fstring(reader)?;
        let launch_exe = read_fstring(reader)?;
        let launch_command = read_fstring(reader)?;
        let prereq_ids = read_fstring_list(reader)?;
        let prereq_name = read_fstring(reader)?;
        let prereq_path = read_fstring(reader)?;
        let prereq_args = read_fstring(reader)?;

        let build_id = if data_version >= 1 {
            Some(read_fstring(reader)?)
        } else {
            None
        };

        let (uninstall_action_path, uninstall_action_args) = if data_version >= 2 {
            (read_fstring(reader)?, read_fstring(reader)?)
        } else {
            (String::new(), String::new())
        };

        check_section(reader, "meta", start, size)?;

        Ok(Self {
            data_version,
            feature_level,
            is_file_data,
            app_id,
            app_name,
            build_version,
            launch_exe,
            launch_command,
            prereq_ids,
            prereq_name,
            prereq_path,
            prereq_args,
            build_id,
            uninstall_action_path,
            uninstall_action_args,
        })
    }

    pub(crate) fn write_to<W: Write + Seek>(&self, writer: &mut W) -> Result<()> {
        write_section(writer, |w| {
            self.data_version.write_le(w)?;
            self.feature_level.write_le(w)?;
            u8::from(self.is_file_data).write_le(w)?;
            self.app_id.write_le(w)?;
            write_fstring(w, &self.app_name)?;
            write_fstring(w, &self.build_version)?;
            write_fstring(w, &self.launch_exe)?;
            write_fstring(w, &self.launch_command)?;
            write_fstring_list(w, &self.prereq_ids)?;
            write_fstring(w, &self.prereq_name)?;
            write_fstring(w, &self.prereq_path)?;
            write_fstring(w, &self.prereq_args)?;

            if self.data_version >= 1 {
                write_fstring(w, &self.build_id())?;
            }
            if self.data_version >= 2 {
                write_fstring(w, &self.uninstall_action_path)?;
                write_fstring(w, &self.uninstall_action_args)?;
            }
            Ok(())
        })
    }
}
