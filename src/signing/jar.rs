//! JAR (v1) signing: `META-INF/MANIFEST.MF`, `<ALIAS>.SF` and `<ALIAS>.RSA`.

use super::{pkcs7, SigningError, SigningIdentity};
use crate::android::zip::{classify_entry_name, ApkWriter, EntryKind};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use zip::read::ZipArchive;

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";

const CREATED_BY: &str = "1.0 (Android)";
const MAX_LINE_BYTES: usize = 70;

/// The three generated files, ready to be appended to the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JarSignature {
    pub manifest: Vec<u8>,
    pub signature_file: Vec<u8>,
    pub signature_block: Vec<u8>,
}

/// Append a header line, wrapping at 70 bytes with single-space continuations.
fn push_line(out: &mut Vec<u8>, line: &str) {
    let bytes = line.as_bytes();
    let (first, mut rest) = bytes.split_at(bytes.len().min(MAX_LINE_BYTES));
    out.extend_from_slice(first);
    out.extend_from_slice(b"\r\n");
    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(rest.len().min(MAX_LINE_BYTES - 1));
        out.push(b' ');
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
        rest = tail;
    }
}

fn entry_section(name: &str, digest: &[u8]) -> Vec<u8> {
    let mut section = Vec::new();
    push_line(&mut section, &format!("Name: {name}"));
    push_line(&mut section, &format!("SHA-256-Digest: {}", STANDARD.encode(digest)));
    section.extend_from_slice(b"\r\n");
    section
}

/// Build the v1 files for `(entry name, SHA-256 of contents)` pairs.
pub fn build_signature(
    entries: &[(String, [u8; 32])],
    identity: &SigningIdentity,
) -> Result<JarSignature, SigningError> {
    let mut manifest = Vec::new();
    push_line(&mut manifest, "Manifest-Version: 1.0");
    push_line(&mut manifest, &format!("Created-By: {CREATED_BY}"));
    manifest.extend_from_slice(b"\r\n");

    let mut signature_file = Vec::new();
    push_line(&mut signature_file, "Signature-Version: 1.0");
    push_line(&mut signature_file, &format!("Created-By: {CREATED_BY}"));

    let mut per_entry = Vec::new();
    for (name, digest) in entries {
        let section = entry_section(name, digest);
        manifest.extend_from_slice(&section);
        per_entry.extend_from_slice(&entry_section(name, &Sha256::digest(&section)));
    }

    push_line(
        &mut signature_file,
        &format!("SHA-256-Digest-Manifest: {}", STANDARD.encode(Sha256::digest(&manifest))),
    );
    // Tells v2-aware verifiers to reject the archive if the block is stripped.
    push_line(&mut signature_file, "X-Android-APK-Signed: 2, 3");
    signature_file.extend_from_slice(b"\r\n");
    signature_file.extend_from_slice(&per_entry);

    let signature = identity.sign(&signature_file)?;
    let signature_block = pkcs7::signed_data(identity, &signature)?;
    Ok(JarSignature {
        manifest,
        signature_file,
        signature_block,
    })
}

/// Rewrite `unsigned` with the v1 files appended. Entry order, names and the
/// storage policy are preserved; stale signature files are dropped.
pub fn sign_jar(unsigned: &[u8], identity: &SigningIdentity) -> Result<Vec<u8>, SigningError> {
    let archive_err = |err: &dyn std::fmt::Display| SigningError::Archive(err.to_string());
    let mut archive = ZipArchive::new(Cursor::new(unsigned)).map_err(|e| archive_err(&e))?;
    let mut writer = ApkWriter::new(Vec::with_capacity(unsigned.len() + 8192));
    let mut digests = Vec::with_capacity(archive.len());

    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx).map_err(|e| archive_err(&e))?;
        let name = entry.name().to_string();
        if matches!(
            classify_entry_name(&name),
            EntryKind::Signature | EntryKind::Directory
        ) {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        writer.add_entry(&name, &data).map_err(|e| archive_err(&e))?;
        digests.push((name, Sha256::digest(&data).into()));
    }

    let signature = build_signature(&digests, identity)?;
    let base = format!("META-INF/{}", identity.jar_basename());
    for (name, data) in [
        (MANIFEST_NAME.to_string(), &signature.manifest),
        (format!("{base}.SF"), &signature.signature_file),
        (format!("{base}.RSA"), &signature.signature_block),
    ] {
        writer.add_entry(&name, data).map_err(|e| archive_err(&e))?;
    }
    debug!("v1 signature over {} entries", digests.len());
    writer.finish().map_err(|e| archive_err(&e))
}

/// Split a manifest or signature file into its `Name:`-keyed sections,
/// joining continuation lines. The main section is keyed by `""`.
pub fn parse_sections(text: &[u8]) -> Vec<(String, Vec<(String, String)>, Vec<u8>)> {
    let mut sections = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let end = rest
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(rest.len(), |offset| offset + 4);
        let (raw, tail) = rest.split_at(end);
        sections.push(parse_section(raw));
        rest = tail;
    }
    sections
}

fn parse_section(raw: &[u8]) -> (String, Vec<(String, String)>, Vec<u8>) {
    // Wrapping splits at byte offsets, so multi-byte characters may straddle
    // a continuation and lines are joined before decoding.
    let mut lines: Vec<Vec<u8>> = Vec::new();
    for line in raw.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        match (line.strip_prefix(b" "), lines.last_mut()) {
            (Some(continued), Some(previous)) => previous.extend_from_slice(continued),
            _ => lines.push(line.to_vec()),
        }
    }
    let attributes: Vec<(String, String)> = lines
        .iter()
        .filter_map(|line| {
            let text = String::from_utf8_lossy(line);
            text.split_once(": ")
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect();
    let name = attributes
        .iter()
        .find(|(key, _)| key == "Name")
        .map(|(_, value)| value.clone())
        .unwrap_or_default();
    (name, attributes, raw.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_lines_wrap_with_continuations() {
        let name = format!("assets/{}", "x".repeat(150));
        let mut out = Vec::new();
        push_line(&mut out, &format!("Name: {name}"));
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<_> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert!(lines.iter().all(|l| l.len() <= MAX_LINE_BYTES));
        assert!(lines[1..].iter().all(|l| l.starts_with(' ')));
        let joined: String = lines
            .iter()
            .enumerate()
            .map(|(i, l)| if i == 0 { *l } else { &l[1..] })
            .collect();
        assert_eq!(joined, format!("Name: {name}"));
    }

    #[test]
    fn sections_parse_back() {
        let identity = SigningIdentity::embedded().expect("identity");
        let long = format!("res/{}.xml", "y".repeat(90));
        let entries = vec![
            ("AndroidManifest.xml".to_string(), [1u8; 32]),
            (long.clone(), [2u8; 32]),
        ];
        let signature = build_signature(&entries, &identity).expect("sign");
        let sections = parse_sections(&signature.manifest);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].0, "");
        assert_eq!(sections[2].0, long);
        let digest = sections[2]
            .1
            .iter()
            .find(|(k, _)| k == "SHA-256-Digest")
            .map(|(_, v)| v.clone())
            .expect("digest attribute");
        assert_eq!(digest, STANDARD.encode([2u8; 32]));

        let sf = String::from_utf8(signature.signature_file).expect("utf8");
        assert!(sf.contains("X-Android-APK-Signed: 2, 3\r\n"));
    }

    #[test]
    fn wrapped_multibyte_names_parse_back() {
        let identity = SigningIdentity::embedded().expect("identity");
        let name = format!("assets/{}.txt", "\u{251c}\u{2510}".repeat(20));
        assert!(name.len() > 64);
        let entries = vec![(name.clone(), [3u8; 32])];
        let signature = build_signature(&entries, &identity).expect("sign");
        let sections = parse_sections(&signature.manifest);
        assert_eq!(sections[1].0, name);
        let sf_sections = parse_sections(&signature.signature_file);
        assert_eq!(sf_sections[1].0, name);
    }
}
