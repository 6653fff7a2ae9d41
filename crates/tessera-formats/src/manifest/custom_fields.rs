//! Custom fields section (string to string map)

use binrw::io::{Read, Seek, Write};
use binrw::{BinReaderExt, BinWrite};
use std::collections::BTreeMap;

use super::codec::{check_section, read_fstring, write_fstring, write_section};
use super::error::{ManifestError, Result};

/// Free-form key/value pairs attached to a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomFields {
    /// Section layout version
    pub version: u8,
    /// Field values by key
    pub fields: BTreeMap<String, String>,
}

impl CustomFields {
    /// Value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Set a value, returning the previous one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.fields.insert(key.into(), value.into())
    }

    pub(crate) fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let start = reader.stream_position()?;
        let size: u32 = reader.read_le()?;
        let version: u8 = reader.read_le()?;
        let count: u32 = reader.read_le()?;

        let keys = (0..count)
            .map(|_| read_fstring(reader))
            .collect::<Result<Vec<_>>>()?;
        let values = (0..count)
            .map(|_| read_fstring(reader))
            .collect::<Result<Vec<_>>>()?;

        check_section(reader, "custom fields", start, size)?;

        let fields: BTreeMap<String, String> = keys.into_iter().zip(values).collect();
        if fields.len() != count as usize {
            return Err(ManifestError::Corrupt(
                "duplicate custom field keys".to_string(),
            ));
        }

        Ok(Self { version, fields })
    }

    pub(crate) fn write_to<W: Write + Seek>(&self, writer: &mut W) -> Result<()> {
        write_section(writer, |w| {
            self.version.write_le(w)?;
            (self.fields.len() as u32).write_le(w)?;
            for key in self.fields.keys() {
                write_fstring(w, key)?;
            }
            for value in self.fields.values() {
                write_fstring(w, value)?;
            }
            Ok(())
        })
    }
}
