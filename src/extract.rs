//! Streaming the input archive into a scratch tree.

use crate::android::zip::{classify_entry_name, EntryKind, MANIFEST_ENTRY};
use crate::error::{InjectError, Result};
use crate::scratch::ScratchTree;
use log::{debug, info};
use std::collections::BTreeSet;
use std::io::{Read, Seek};
use zip::read::ZipArchive;

/// Everything the later stages need from the input archive.
#[derive(Debug)]
pub struct ExtractedArchive {
    pub scratch: ScratchTree,
    pub manifest: Vec<u8>,
    /// Numeric suffixes of the `classes*.dex` units found.
    pub code_units: BTreeSet<u32>,
    /// `lib/<abi>/` directories present in the input.
    pub native_abis: BTreeSet<String>,
    pub dropped_signatures: usize,
}

/// Extract every entry except prior signatures and the manifest into
/// `scratch`; the manifest is returned in memory.
///
/// Any entry name that would leave the scratch root aborts the whole
/// extraction with [`InjectError::UnsafePath`].
pub fn extract_archive<R: Read + Seek>(reader: R, scratch: ScratchTree) -> Result<ExtractedArchive> {
    let mut archive = ZipArchive::new(reader)?;
    let mut manifest = None;
    let mut code_units = BTreeSet::new();
    let mut native_abis = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut dropped_signatures = 0;

    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        let name = entry.name().to_string();
        if name.is_empty() {
            continue;
        }
        if !seen.insert(name.clone()) {
            return Err(InjectError::ArchiveFormat(format!(
                "duplicate entry '{name}'"
            )));
        }
        // Validate before classifying so no kind of entry can smuggle a path.
        scratch.resolve(name.trim_end_matches('/'))?;

        match classify_entry_name(&name) {
            EntryKind::Signature => {
                debug!("dropping prior signature {name}");
                dropped_signatures += 1;
            }
            EntryKind::Manifest => {
                manifest = Some(read_payload(&mut entry, &name)?);
            }
            EntryKind::Directory => {
                scratch.create_dir(name.trim_end_matches('/'))?;
            }
            kind => {
                match &kind {
                    EntryKind::CompiledCode(index) => {
                        code_units.insert(*index);
                    }
                    EntryKind::NativeLibrary { abi } => {
                        native_abis.insert(format!("lib/{abi}/"));
                    }
                    _ => {}
                }
                let data = read_payload(&mut entry, &name)?;
                scratch.write_file(&name, &data)?;
            }
        }
    }

    let manifest = manifest.ok_or_else(|| {
        InjectError::ArchiveFormat(format!("archive has no {MANIFEST_ENTRY}"))
    })?;
    info!(
        "extracted {} entries ({} code units, ABIs {:?}, {} signature files dropped)",
        seen.len(),
        code_units.len(),
        native_abis,
        dropped_signatures
    );
    Ok(ExtractedArchive {
        scratch,
        manifest,
        code_units,
        native_abis,
        dropped_signatures,
    })
}

/// Read a single entry out of an archive, `None` when it is absent.
pub fn read_entry<R: Read + Seek>(reader: R, name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = ZipArchive::new(reader)?;
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    read_payload(&mut entry, name).map(Some)
}

/// Inflate an entry. Decompression and CRC failures come out of the reader
/// as I/O errors but mean the archive is damaged.
fn read_payload(entry: &mut impl Read, name: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|err| InjectError::ArchiveFormat(format!("{name}: {err}")))?;
    Ok(data)
}
