use super::fixtures::{apk, manifest_bytes, sample_apk, PACKAGE};
use crate::android::zip::code_unit_name;
use crate::error::InjectError;
use crate::extract::extract_archive;
use crate::scratch::ScratchTree;
use std::fs;
use std::io::{Cursor, Read};
use zip::read::ZipArchive;
use zip::CompressionMethod;

/// Payload offset of the first local header carrying `name`.
fn data_offset(archive: &[u8], name: &str) -> usize {
    let pos = archive
        .windows(name.len())
        .position(|w| w == name.as_bytes())
        .expect("local header");
    let extra = u16::from_le_bytes([archive[pos - 2], archive[pos - 1]]) as usize;
    pos + name.len() + extra
}

#[test]
fn extraction_classifies_and_drops_signatures() {
    let scratch = ScratchTree::create(None).expect("scratch");
    let extracted = extract_archive(Cursor::new(sample_apk()), scratch).expect("extract");

    assert_eq!(extracted.manifest, manifest_bytes(Some(PACKAGE), Some(21), true));
    assert_eq!(extracted.code_units.iter().copied().collect::<Vec<_>>(), vec![1]);
    assert!(extracted.native_abis.contains("lib/armeabi-v7a/"));
    assert_eq!(extracted.dropped_signatures, 3);
    assert_eq!(
        extracted.scratch.entry_names().expect("names"),
        vec![
            "classes.dex",
            "lib/armeabi-v7a/libfoo.so",
            "res/layout/main.xml",
            "resources.arsc",
        ]
    );
}

#[test]
fn traversal_entry_fails_without_writing_outside() {
    let outer = tempfile::tempdir().expect("tempdir");
    let base = outer.path().join("a").join("b");
    let manifest = manifest_bytes(Some(PACKAGE), None, true);
    let input = apk(&[
        ("AndroidManifest.xml", &manifest),
        ("assets/ok.txt", b"fine"),
        ("../../evil", b"payload"),
    ]);

    let scratch = ScratchTree::create(Some(&base)).expect("scratch");
    let root = scratch.root().to_path_buf();
    let err = extract_archive(Cursor::new(input), scratch).expect_err("must fail");
    assert!(matches!(err, InjectError::UnsafePath(name) if name == "../../evil"));

    assert!(!outer.path().join("evil").exists());
    assert!(!outer.path().join("a").join("evil").exists());
    assert!(!root.exists(), "scratch tree removed on failure");
    assert_eq!(fs::read_dir(&base).expect("base").count(), 0);
}

#[test]
fn absolute_entry_is_unsafe() {
    let manifest = manifest_bytes(Some(PACKAGE), None, true);
    let input = apk(&[("AndroidManifest.xml", &manifest), ("/tmp/evil", b"x")]);
    let scratch = ScratchTree::create(None).expect("scratch");
    assert!(matches!(
        extract_archive(Cursor::new(input), scratch),
        Err(InjectError::UnsafePath(_))
    ));
}

#[test]
fn missing_manifest_is_an_archive_error() {
    let input = apk(&[("classes.dex", b"dex\n035\0")]);
    let scratch = ScratchTree::create(None).expect("scratch");
    assert!(matches!(
        extract_archive(Cursor::new(input), scratch),
        Err(InjectError::ArchiveFormat(_))
    ));
}

#[test]
fn garbage_input_is_an_archive_error() {
    let scratch = ScratchTree::create(None).expect("scratch");
    assert!(matches!(
        extract_archive(Cursor::new(b"definitely not a zip file".to_vec()), scratch),
        Err(InjectError::ArchiveFormat(_))
    ));
}

#[test]
fn writer_stores_code_and_libraries_and_deflates_the_rest() {
    let dex = b"dex\n035\0".repeat(64);
    let library = vec![0x7f; 3000];
    let text = b"hello hello hello hello ".repeat(40);
    let bytes = apk(&[
        ("AndroidManifest.xml", &manifest_bytes(Some(PACKAGE), None, true)),
        ("classes2.dex", &dex),
        ("lib/arm64-v8a/libinject.so", &library),
        ("assets/readme.txt", &text),
    ]);

    let mut archive = ZipArchive::new(Cursor::new(bytes.clone())).expect("zip");
    assert_eq!(archive.by_index(0).expect("first").name(), "AndroidManifest.xml");
    for (name, expected, method) in [
        ("AndroidManifest.xml", None, CompressionMethod::Stored),
        ("classes2.dex", Some(&dex[..]), CompressionMethod::Stored),
        ("lib/arm64-v8a/libinject.so", Some(&library[..]), CompressionMethod::Stored),
        ("assets/readme.txt", Some(&text[..]), CompressionMethod::Deflated),
    ] {
        let mut entry = archive.by_name(name).expect(name);
        assert_eq!(entry.compression(), method, "{name}");
        let mut data = Vec::new();
        // Reading to the end checks the stored CRC-32.
        entry.read_to_end(&mut data).expect("crc matches");
        if let Some(expected) = expected {
            assert_eq!(data, expected);
        }
        if method == CompressionMethod::Stored {
            assert_eq!(entry.compressed_size(), entry.size());
            let alignment = if name.ends_with(".so") { 16 * 1024 } else { 4 };
            assert_eq!(data_offset(&bytes, name) % alignment, 0, "{name} alignment");
        }
    }
}

#[test]
fn writer_output_is_reproducible() {
    let entries: [(&str, &[u8]); 2] = [("assets/a.txt", b"aaaa"), ("classes.dex", b"dex")];
    assert_eq!(apk(&entries), apk(&entries));
}

#[test]
fn code_unit_names() {
    assert_eq!(code_unit_name(1), "classes.dex");
    assert_eq!(code_unit_name(7), "classes7.dex");
}

#[test]
fn corrupt_entry_payload_is_an_archive_error() {
    let manifest = manifest_bytes(Some(PACKAGE), None, true);
    let mut input = apk(&[
        ("AndroidManifest.xml", &manifest),
        ("classes.dex", b"dex\n035\0payload"),
    ]);
    let at = input
        .windows(7)
        .position(|w| w == b"payload")
        .expect("stored payload");
    input[at] ^= 0x20;

    let scratch = ScratchTree::create(None).expect("scratch");
    let root = scratch.root().to_path_buf();
    let err = extract_archive(Cursor::new(input), scratch).expect_err("crc mismatch");
    assert!(matches!(err, InjectError::ArchiveFormat(reason) if reason.starts_with("classes.dex")));
    assert!(!root.exists());
}

#[test]
fn writer_marks_non_ascii_names_as_utf8() {
    let name = "assets/\u{00e9}t\u{00e9}/\u{251c}\u{2510}.txt";
    let bytes = apk(&[("assets/plain.txt", b"plain"), (name, b"accented")]);

    let mut archive = ZipArchive::new(Cursor::new(bytes)).expect("zip");
    assert_eq!(archive.by_index(1).expect("second").name(), name);
    let mut data = Vec::new();
    archive
        .by_name(name)
        .expect("lookup by utf-8 name")
        .read_to_end(&mut data)
        .expect("read");
    assert_eq!(data, b"accented");
}
