//! Synthesized inputs: compiled manifests, APKs and injection payloads.

use crate::android::attr;
use crate::android::binary_xml::{ManifestDocument, ValueType, XmlAttribute, XmlElement};
use crate::android::zip::ApkWriter;
use crate::inject::InjectionAssets;
use std::fs;
use std::path::Path;

pub const PACKAGE: &str = "com.example.app";
pub const PAYLOAD_DEX: &[u8] = b"dex\n035\0injected payload";

/// A manifest with `package`, `<uses-sdk minSdkVersion>` and an
/// `<application>` holding one activity.
pub fn manifest_document(package: Option<&str>, min_sdk: Option<i32>, application: bool) -> ManifestDocument {
    let mut document = ManifestDocument::new();
    let root = document.root_mut();
    if let Some(package) = package {
        let mut attribute = XmlAttribute::new(None, "package", None);
        attribute.set_string(package);
        root.attributes.push(attribute);
    }
    if let Some(sdk) = min_sdk {
        let mut uses_sdk = XmlElement::new("uses-sdk");
        uses_sdk
            .android_attribute_mut("minSdkVersion", attr::MIN_SDK_VERSION)
            .set_int_with_type(sdk, ValueType::IntDec)
            .expect("integer tag");
        root.append_child(uses_sdk);
    }
    if application {
        let mut app = XmlElement::new("application");
        app.android_attribute_mut("label", attr::LABEL).set_string("Example");
        let mut main = XmlElement::new("activity");
        main.android_attribute_mut("name", attr::NAME)
            .set_string(format!("{}.MainActivity", package.unwrap_or("app")));
        main.android_attribute_mut("exported", attr::EXPORTED).set_bool(true);
        app.append_child(main);
        root.append_child(app);
    }
    document
}

pub fn manifest_bytes(package: Option<&str>, min_sdk: Option<i32>, application: bool) -> Vec<u8> {
    manifest_document(package, min_sdk, application)
        .encode()
        .expect("encode fixture manifest")
}

/// Hand-assembled manifest with a UTF-8 string pool, as older aapt emits:
/// `<manifest package=..><uses-sdk android:minSdkVersion="<text>"/><application/></manifest>`
/// with the min SDK stored as a string value.
pub fn utf8_manifest(package: &str, min_sdk_text: &str) -> Vec<u8> {
    const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";
    let strings = [
        "minSdkVersion", // 0, mapped
        "android",
        ANDROID_NS,
        "manifest",
        "package",
        package, // 5
        "uses-sdk",
        "application",
        min_sdk_text, // 8
    ];

    let mut pool_data = Vec::new();
    let mut offsets = Vec::new();
    for text in strings {
        offsets.push(pool_data.len() as u32);
        pool_data.push(text.chars().count() as u8);
        pool_data.push(text.len() as u8);
        pool_data.extend_from_slice(text.as_bytes());
        pool_data.push(0);
    }
    while pool_data.len() % 4 != 0 {
        pool_data.push(0);
    }
    let mut pool = Vec::new();
    push_u16(&mut pool, 0x0001);
    push_u16(&mut pool, 28);
    push_u32(&mut pool, (28 + offsets.len() * 4 + pool_data.len()) as u32);
    push_u32(&mut pool, strings.len() as u32);
    push_u32(&mut pool, 0);
    push_u32(&mut pool, 0x100); // UTF-8
    push_u32(&mut pool, (28 + offsets.len() * 4) as u32);
    push_u32(&mut pool, 0);
    for offset in offsets {
        push_u32(&mut pool, offset);
    }
    pool.extend_from_slice(&pool_data);

    let mut resource_map = Vec::new();
    push_u16(&mut resource_map, 0x0180);
    push_u16(&mut resource_map, 8);
    push_u32(&mut resource_map, 12);
    push_u32(&mut resource_map, attr::MIN_SDK_VERSION);

    let mut body = Vec::new();
    node(&mut body, 0x0100, &[1, 2]);
    start_element(&mut body, 3, &[(u32::MAX, 4, 5)]);
    start_element(&mut body, 6, &[(2, 0, 8)]);
    node(&mut body, 0x0103, &[u32::MAX, 6]);
    start_element(&mut body, 7, &[]);
    node(&mut body, 0x0103, &[u32::MAX, 7]);
    node(&mut body, 0x0103, &[u32::MAX, 3]);
    node(&mut body, 0x0101, &[1, 2]);

    let mut document = Vec::new();
    push_u16(&mut document, 0x0003);
    push_u16(&mut document, 8);
    push_u32(&mut document, (8 + pool.len() + resource_map.len() + body.len()) as u32);
    document.extend_from_slice(&pool);
    document.extend_from_slice(&resource_map);
    document.extend_from_slice(&body);
    document
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Node chunk with the standard 16-byte header and `words` as its body.
fn node(buf: &mut Vec<u8>, chunk_type: u16, words: &[u32]) {
    push_u16(buf, chunk_type);
    push_u16(buf, 16);
    push_u32(buf, (16 + words.len() * 4) as u32);
    push_u32(buf, 1); // line
    push_u32(buf, u32::MAX); // comment
    for word in words {
        push_u32(buf, *word);
    }
}

/// Start-element chunk; attributes are `(namespace, name, string value)`
/// pool indices.
fn start_element(buf: &mut Vec<u8>, name: u32, attributes: &[(u32, u32, u32)]) {
    push_u16(buf, 0x0102);
    push_u16(buf, 16);
    push_u32(buf, (16 + 20 + attributes.len() * 20) as u32);
    push_u32(buf, 1);
    push_u32(buf, u32::MAX);
    push_u32(buf, u32::MAX);
    push_u32(buf, name);
    push_u16(buf, 20);
    push_u16(buf, 20);
    push_u16(buf, attributes.len() as u16);
    push_u16(buf, 0);
    push_u16(buf, 0);
    push_u16(buf, 0);
    for (namespace, name, value) in attributes {
        push_u32(buf, *namespace);
        push_u32(buf, *name);
        push_u32(buf, *value);
        push_u16(buf, 8);
        buf.push(0);
        buf.push(0x03);
        push_u32(buf, *value);
    }
}

/// An archive written in the given order with the standard entry policy.
pub fn apk(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ApkWriter::new(Vec::new());
    for (name, data) in entries {
        writer.add_entry(name, data).expect("fixture entry");
    }
    writer.finish().expect("fixture archive")
}

/// A plausible input APK for `com.example.app` with minSdk 21.
pub fn sample_apk() -> Vec<u8> {
    let manifest = manifest_bytes(Some(PACKAGE), Some(21), true);
    apk(&[
        ("AndroidManifest.xml", &manifest),
        ("classes.dex", b"dex\n035\0original"),
        ("resources.arsc", &[0x02, 0x00, 0x0c, 0x00]),
        ("res/layout/main.xml", &[b'x'; 600]),
        ("lib/armeabi-v7a/libfoo.so", b"\x7fELF32"),
        ("META-INF/CERT.SF", b"Signature-Version: 1.0\r\n"),
        ("META-INF/CERT.RSA", b"old signature"),
        ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\n"),
    ])
}

/// Code unit, config and native-library directory under `dir`.
pub fn payload(dir: &Path) -> InjectionAssets {
    let code_unit = dir.join("payload.dex");
    fs::write(&code_unit, PAYLOAD_DEX).expect("write payload");
    let config = dir.join("cloner.json");
    fs::write(&config, br#"{"clone_name": "Work", "hide_notifications": true}"#).expect("write config");
    let native_lib_dir = dir.join("libs");
    fs::create_dir_all(&native_lib_dir).expect("lib dir");
    fs::write(native_lib_dir.join("libinject.so"), b"\x7fELF64 inject").expect("write lib");
    fs::write(native_lib_dir.join("README.txt"), b"not a library").expect("write readme");
    InjectionAssets {
        code_unit,
        config,
        native_lib_dir,
        bundled_data: None,
    }
}
