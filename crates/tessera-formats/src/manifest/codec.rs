//! Shared helpers for the binary manifest sections
//!
//! Strings use a signed 32-bit length prefix: positive lengths are ASCII
//! with a trailing NUL, negative lengths are UTF-16LE code units with a
//! trailing `00 00`, and zero is the empty string.

use binrw::io::{Read, Seek, SeekFrom, Write};
use binrw::{BinReaderExt, BinWrite};

use super::error::{ManifestError, Result};

/// Longest string accepted by the reader, in bytes
const MAX_STRING_BYTES: usize = 16 * 1024 * 1024;

/// Read a length-prefixed string
pub fn read_fstring<R: Read + Seek>(reader: &mut R) -> Result<String> {
    let length: i32 = reader.read_le()?;
    if length.unsigned_abs() as usize * 2 > MAX_STRING_BYTES {
        return Err(ManifestError::Corrupt(format!(
            "string length {length} out of range"
        )));
    }

    if length < 0 {
        let units = length.unsigned_abs() as usize;
        let mut raw = vec![0u8; units * 2];
        reader.read_exact(&mut raw)?;
        let code_units: Vec<u16> = raw[..(units - 1) * 2]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&code_units).map_err(|e| ManifestError::InvalidString(e.to_string()))
    } else if length > 0 {
        let mut raw = vec![0u8; length as usize];
        reader.read_exact(&mut raw)?;
        raw.pop();
        if !raw.is_ascii() {
            return Err(ManifestError::InvalidString(
                "non-ASCII bytes in narrow string".to_string(),
            ));
        }
        String::from_utf8(raw).map_err(|e| ManifestError::InvalidString(e.to_string()))
    } else {
        Ok(String::new())
    }
}

/// Write a length-prefixed string, choosing UTF-16 only when needed
pub fn write_fstring<W: Write + Seek>(writer: &mut W, value: &str) -> Result<()> {
    if value.is_empty() {
        0i32.write_le(writer)?;
    } else if value.is_ascii() {
        (value.len() as i32 + 1).write_le(writer)?;
        writer.write_all(value.as_bytes())?;
        writer.write_all(&[0])?;
    } else {
        let units: Vec<u16> = value.encode_utf16().collect();
        (-(units.len() as i32 + 1)).write_le(writer)?;
        for unit in units {
            unit.write_le(writer)?;
        }
        writer.write_all(&[0, 0])?;
    }
    Ok(())
}

/// Read a `u32` count-prefixed list of strings
pub fn read_fstring_list<R: Read + Seek>(reader: &mut R) -> Result<Vec<String>> {
    let count: u32 = reader.read_le()?;
    (0..count).map(|_| read_fstring(reader)).collect()
}

/// Write a `u32` count-prefixed list of strings
pub fn write_fstring_list<W: Write + Seek>(writer: &mut W, values: &[String]) -> Result<()> {
    (values.len() as u32).write_le(writer)?;
    for value in values {
        write_fstring(writer, value)?;
    }
    Ok(())
}

/// Check that a section starting at `start` consumed exactly `declared` bytes
pub fn check_section<R: Seek>(
    reader: &mut R,
    section: &'static str,
    start: u64,
    declared: u32,
) -> Result<()> {
    let read = reader.stream_position()? - start;
    if read != u64::from(declared) {
        return Err(ManifestError::SectionSizeMismatch {
            section,
            declared,
            read,
        });
    }
    Ok(())
}

/// Write a section behind a `u32` size placeholder, then patch the size
///
/// The size covers the section including its own size field.
pub fn write_section<W, F>(writer: &mut W, body: F) -> Result<()>
where
    W: Write + Seek,
    F: FnOnce(&mut W) -> Result<()>,
{
    let start = writer.stream_position()?;
    0u32.write_le(writer)?;
    body(writer)?;
    let end = writer.stream_position()?;

    let size = u32::try_from(end - start)
        .map_err(|_| ManifestError::Corrupt("section larger than 4 GiB".to_string()))?;
    writer.seek(SeekFrom::Start(start))?;
    size.write_le(writer)?;
    writer.seek(SeekFrom::Start(end))?;
    Ok(())
}
