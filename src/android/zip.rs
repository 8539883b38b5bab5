//! APK entry classification and the deterministic archive writer.

use crate::error::{InjectError, Result};
use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::io::Write;

/// Archive path of the compiled manifest.
pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
const LOCAL_HEADER_LEN: u64 = 30;
/// General purpose bit 11: the entry name is UTF-8.
const FLAG_UTF8_NAME: u16 = 0x0800;

// 1980-01-01 00:00:00, the earliest DOS timestamp.
const DOS_TIME: u16 = 0;
const DOS_DATE: u16 = 0x0021;

const STORED_ALIGNMENT: u32 = 4;
const NATIVE_LIBRARY_ALIGNMENT: u32 = 16 * 1024;

/// What an archive entry is, judged from its name alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Prior JAR signature material under `META-INF/`.
    Signature,
    /// `classes.dex` / `classesN.dex`; carries the numeric suffix (bare name = 1).
    CompiledCode(u32),
    /// A file below `lib/<abi>/`.
    NativeLibrary { abi: String },
    Manifest,
    Directory,
    Ordinary,
}

pub fn classify_entry_name(name: &str) -> EntryKind {
    if name.ends_with('/') {
        return EntryKind::Directory;
    }
    if name == MANIFEST_ENTRY {
        return EntryKind::Manifest;
    }
    if is_signature_entry(name) {
        return EntryKind::Signature;
    }
    if let Some(index) = code_unit_index(name) {
        return EntryKind::CompiledCode(index);
    }
    if let Some(abi) = native_library_abi(name) {
        return EntryKind::NativeLibrary {
            abi: abi.to_string(),
        };
    }
    EntryKind::Ordinary
}

fn is_signature_entry(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    let Some(rest) = upper.strip_prefix("META-INF/") else {
        return false;
    };
    if rest == "MANIFEST.MF" {
        return true;
    }
    [".RSA", ".DSA", ".EC", ".SF"]
        .iter()
        .any(|ext| rest.len() > ext.len() && rest.ends_with(ext))
}

/// Numeric suffix of a root-level code unit name, `classes.dex` being 1.
pub fn code_unit_index(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    let digits = lower.strip_prefix("classes")?.strip_suffix(".dex")?;
    if digits.is_empty() {
        return Some(1);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Archive name for the code unit with the given suffix.
pub fn code_unit_name(index: u32) -> String {
    if index <= 1 {
        "classes.dex".to_string()
    } else {
        format!("classes{index}.dex")
    }
}

fn native_library_abi(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("lib/")?;
    let (abi, file) = rest.split_once('/')?;
    if abi.is_empty() || file.is_empty() {
        return None;
    }
    Some(abi)
}

/// Whether the bytes start with one of the three ZIP record signatures
/// (local header, empty-archive EOCD, spanning marker).
pub fn is_probably_zip(bytes: &[u8]) -> bool {
    matches!(
        bytes,
        [b'P', b'K', 3, 4, ..] | [b'P', b'K', 5, 6, ..] | [b'P', b'K', 7, 8, ..]
    )
}

/// Compression applied to an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApkCompression {
    Stored,
    Deflated,
}

impl ApkCompression {
    fn method(self) -> u16 {
        match self {
            ApkCompression::Stored => 0,
            ApkCompression::Deflated => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPlan {
    pub compression: ApkCompression,
    pub alignment: Option<u32>,
}

/// The fixed encoding policy: entries the platform maps straight out of the
/// archive are stored and aligned, everything else is deflated.
pub fn plan_entry(name: &str) -> EntryPlan {
    let lower = name.to_ascii_lowercase();
    let stored = name == MANIFEST_ENTRY
        || lower.ends_with(".dex")
        || lower.ends_with(".so")
        || lower.ends_with(".arsc");
    if !stored {
        return EntryPlan {
            compression: ApkCompression::Deflated,
            alignment: None,
        };
    }
    let alignment = if lower.starts_with("lib/") && lower.ends_with(".so") {
        NATIVE_LIBRARY_ALIGNMENT
    } else {
        STORED_ALIGNMENT
    };
    EntryPlan {
        compression: ApkCompression::Stored,
        alignment: Some(alignment),
    }
}

struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    flags: u16,
    compression: ApkCompression,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
}

/// Streams entries into a ZIP container with no data descriptors, no
/// directory records and fixed timestamps, so equal input yields equal bytes.
pub struct ApkWriter<W: Write> {
    out: W,
    offset: u64,
    records: Vec<CentralDirectoryRecord>,
    names: BTreeSet<String>,
}

impl<W: Write> ApkWriter<W> {
    pub fn new(out: W) -> Self {
        ApkWriter {
            out,
            offset: 0,
            records: Vec::new(),
            names: BTreeSet::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Append one entry using the policy from [`plan_entry`].
    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<EntryPlan> {
        let plan = plan_entry(name);
        self.add_entry_with_plan(name, data, plan)?;
        Ok(plan)
    }

    pub fn add_entry_with_plan(&mut self, name: &str, data: &[u8], plan: EntryPlan) -> Result<()> {
        if !self.names.insert(name.to_string()) {
            return Err(InjectError::ArchiveFormat(format!(
                "duplicate entry '{name}' in output"
            )));
        }
        let name_bytes = name.as_bytes();
        let name_len = u16::try_from(name_bytes.len())
            .map_err(|_| InjectError::ArchiveFormat(format!("entry name too long: {name}")))?;
        let flags = if name.is_ascii() { 0 } else { FLAG_UTF8_NAME };

        let payload = match plan.compression {
            ApkCompression::Stored => data.to_vec(),
            ApkCompression::Deflated => deflate_bytes(data)?,
        };
        let mut crc = Crc32::new();
        crc.update(data);
        let crc32 = crc.finalize();

        let extra_len = plan
            .alignment
            .map_or(0, |align| alignment_padding(self.offset, name_bytes.len(), align));
        let local_header_offset = to_u32(self.offset, "local header offset")?;
        let compressed_size = to_u32(payload.len() as u64, "compressed size")?;
        let uncompressed_size = to_u32(data.len() as u64, "uncompressed size")?;

        let mut header = Vec::with_capacity(LOCAL_HEADER_LEN as usize + name_bytes.len());
        write_u32(&mut header, LOCAL_HEADER_SIGNATURE);
        write_u16(&mut header, 20); // version needed
        write_u16(&mut header, flags);
        write_u16(&mut header, plan.compression.method());
        write_u16(&mut header, DOS_TIME);
        write_u16(&mut header, DOS_DATE);
        write_u32(&mut header, crc32);
        write_u32(&mut header, compressed_size);
        write_u32(&mut header, uncompressed_size);
        write_u16(&mut header, name_len);
        write_u16(&mut header, extra_len);
        header.extend_from_slice(name_bytes);
        header.resize(header.len() + extra_len as usize, 0);

        self.write_raw(&header)?;
        self.write_raw(&payload)?;

        self.records.push(CentralDirectoryRecord {
            file_name: name_bytes.to_vec(),
            flags,
            compression: plan.compression,
            crc32,
            compressed_size,
            uncompressed_size,
            local_header_offset,
        });
        Ok(())
    }

    /// Write the central directory and end record, returning the sink.
    pub fn finish(mut self) -> Result<W> {
        let central_start = to_u32(self.offset, "central directory offset")?;
        let mut central = Vec::new();
        for record in &self.records {
            write_central_directory_entry(&mut central, record);
        }
        let central_size = to_u32(central.len() as u64, "central directory size")?;
        let count = u16::try_from(self.records.len())
            .map_err(|_| InjectError::ArchiveFormat("too many entries for ZIP32".to_string()))?;
        write_end_of_central_directory(&mut central, count, central_size, central_start);
        self.write_raw(&central)?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}

fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| InjectError::ArchiveFormat(format!("{what} exceeds ZIP32 limits")))
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, CENTRAL_HEADER_SIGNATURE);
    write_u16(buf, 0x031E); // made by: unix, 3.0
    write_u16(buf, 20);
    write_u16(buf, record.flags);
    write_u16(buf, record.compression.method());
    write_u16(buf, DOS_TIME);
    write_u16(buf, DOS_DATE);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0); // extra
    write_u16(buf, 0); // comment
    write_u16(buf, 0); // disk
    write_u16(buf, 0); // internal attrs
    write_u32(buf, 0o100644 << 16);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(
    buf: &mut Vec<u8>,
    entry_count: u16,
    central_size: u32,
    central_offset: u32,
) {
    write_u32(buf, END_OF_CENTRAL_DIRECTORY_SIGNATURE);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count);
    write_u16(buf, entry_count);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn alignment_padding(offset: u64, name_len: usize, alignment: u32) -> u16 {
    if alignment <= 1 {
        return 0;
    }
    let base = offset + LOCAL_HEADER_LEN + name_len as u64;
    let align = alignment as u64;
    ((align - (base % align)) % align) as u16
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_entries() {
        assert_eq!(classify_entry_name("META-INF/CERT.RSA"), EntryKind::Signature);
        assert_eq!(classify_entry_name("meta-inf/manifest.mf"), EntryKind::Signature);
        assert_eq!(classify_entry_name("META-INF/services/x"), EntryKind::Ordinary);
        assert_eq!(classify_entry_name("classes.dex"), EntryKind::CompiledCode(1));
        assert_eq!(classify_entry_name("classes12.dex"), EntryKind::CompiledCode(12));
        assert_eq!(classify_entry_name("classesX.dex"), EntryKind::Ordinary);
        assert_eq!(classify_entry_name("assets/classes2.dex"), EntryKind::Ordinary);
        assert_eq!(
            classify_entry_name("lib/armeabi-v7a/libfoo.so"),
            EntryKind::NativeLibrary {
                abi: "armeabi-v7a".to_string()
            }
        );
        assert_eq!(classify_entry_name("res/"), EntryKind::Directory);
        assert_eq!(classify_entry_name(MANIFEST_ENTRY), EntryKind::Manifest);
    }

    #[test]
    fn zip_magic_detection() {
        assert!(is_probably_zip(b"PK\x03\x04rest"));
        assert!(is_probably_zip(b"PK\x05\x06"));
        assert!(!is_probably_zip(b"PK\x03"));
        assert!(!is_probably_zip(b"{\"not\": \"zip\"}"));
    }

    #[test]
    fn padding_reaches_alignment() {
        let pad = alignment_padding(7, 11, 4);
        assert_eq!((7 + 30 + 11 + pad as u64) % 4, 0);
        let pad = alignment_padding(100, 20, NATIVE_LIBRARY_ALIGNMENT);
        assert_eq!((100 + 30 + 20 + pad as u64) % 16384, 0);
    }
}
