//! Post-signing verification against the identity the archive was signed with.

use super::block::{
    content_digest, locate_sections, parse_signers, read_block_pairs, SignerRecord,
    RSA_PKCS1V15_SHA2_256, V2_BLOCK_ID, V3_BLOCK_ID,
};
use super::jar::{parse_sections, MANIFEST_NAME};
use super::{pkcs7, SigningError, SigningIdentity};
use crate::android::zip::{classify_entry_name, EntryKind};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use thiserror::Error;
use zip::read::ZipArchive;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("no APK Signing Block")]
    MissingBlock,

    #[error("no v{0} signer in the signing block")]
    MissingScheme(u8),

    #[error("v{scheme}: {reason}")]
    Scheme { scheme: u8, reason: String },

    #[error("v1: {0}")]
    Jar(String),

    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// Which schemes checked out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub v1: bool,
    pub v2: bool,
    pub v3: bool,
}

impl VerificationReport {
    pub fn all(&self) -> bool {
        self.v1 && self.v2 && self.v3
    }
}

/// Check all three schemes; the first failure is returned.
pub fn verify_apk(apk: &[u8], identity: &SigningIdentity) -> Result<VerificationReport, VerifyError> {
    let pairs = read_block_pairs(apk)?.ok_or(VerifyError::MissingBlock)?;
    let digest = content_digest(apk, &locate_sections(apk)?);

    for (scheme, id) in [(2u8, V2_BLOCK_ID), (3u8, V3_BLOCK_ID)] {
        let (_, value) = pairs
            .iter()
            .find(|(pair_id, _)| *pair_id == id)
            .ok_or(VerifyError::MissingScheme(scheme))?;
        let signers = parse_signers(value, scheme == 3)?;
        if signers.is_empty() {
            return Err(VerifyError::MissingScheme(scheme));
        }
        for signer in &signers {
            check_signer(scheme, signer, &digest, identity)?;
        }
        debug!("v{scheme} signature verified");
    }

    verify_jar(apk, identity)?;
    Ok(VerificationReport {
        v1: true,
        v2: true,
        v3: true,
    })
}

fn check_signer(
    scheme: u8,
    signer: &SignerRecord,
    digest: &[u8; 32],
    identity: &SigningIdentity,
) -> Result<(), VerifyError> {
    let fail = |reason: &str| VerifyError::Scheme {
        scheme,
        reason: reason.to_string(),
    };
    if signer.public_key != identity.public_key_der() {
        return Err(fail("public key is not the signing identity's"));
    }
    if signer.signatures.is_empty() {
        return Err(fail("no signatures"));
    }
    for (algorithm, signature) in &signer.signatures {
        if *algorithm != RSA_PKCS1V15_SHA2_256 {
            return Err(fail(&format!("unsupported signature algorithm 0x{algorithm:x}")));
        }
        if !identity.verify(&signer.signed_data, signature) {
            return Err(fail("signature does not verify"));
        }
    }

    let signed = signer.decode_signed_data()?;
    if signed.digests.is_empty() {
        return Err(fail("no digests"));
    }
    for (algorithm, signed_digest) in &signed.digests {
        if *algorithm != RSA_PKCS1V15_SHA2_256 {
            return Err(fail(&format!("unsupported digest algorithm 0x{algorithm:x}")));
        }
        if signed_digest.as_slice() != digest {
            return Err(fail("computed content digest does not match the signed one"));
        }
    }
    if signed.certificates.first().map(Vec::as_slice) != Some(identity.certificate_der()) {
        return Err(fail("certificate is not the signing identity's"));
    }
    if signed.sdk_range != signer.sdk_range {
        return Err(fail("SDK range differs between signer and signed data"));
    }
    Ok(())
}

fn digest_attribute(attributes: &[(String, String)], key: &str) -> Option<String> {
    attributes
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.clone())
}

/// Check `MANIFEST.MF` against entry contents, the `.SF` against the
/// manifest, and the `.RSA` against a freshly produced block.
fn verify_jar(apk: &[u8], identity: &SigningIdentity) -> Result<(), VerifyError> {
    let jar = |reason: String| VerifyError::Jar(reason);
    let mut archive =
        ZipArchive::new(Cursor::new(apk)).map_err(|err| jar(err.to_string()))?;
    let base = format!("META-INF/{}", identity.jar_basename());
    let sf_name = format!("{base}.SF");
    let rsa_name = format!("{base}.RSA");

    let mut contents = BTreeMap::new();
    let mut entry_digests = BTreeMap::new();
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx).map_err(|err| jar(err.to_string()))?;
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|err| jar(format!("{name}: {err}")))?;
        if classify_entry_name(&name) == EntryKind::Signature {
            contents.insert(name, data);
        } else {
            entry_digests.insert(name, STANDARD.encode(Sha256::digest(&data)));
        }
    }
    let read = |name: &str| {
        contents
            .get(name)
            .ok_or_else(|| jar(format!("{name} missing")))
    };
    let manifest = read(MANIFEST_NAME)?;
    let signature_file = read(&sf_name)?;
    let signature_block = read(&rsa_name)?;

    let sections = parse_sections(manifest);
    let mut covered = 0;
    for (name, attributes, _) in sections.iter().filter(|(name, _, _)| !name.is_empty()) {
        let expected = entry_digests
            .get(name)
            .ok_or_else(|| jar(format!("manifest names missing entry {name}")))?;
        if digest_attribute(attributes, "SHA-256-Digest").as_ref() != Some(expected) {
            return Err(jar(format!("digest mismatch for {name}")));
        }
        covered += 1;
    }
    if covered != entry_digests.len() {
        return Err(jar(format!(
            "manifest covers {covered} of {} entries",
            entry_digests.len()
        )));
    }

    let sf_sections = parse_sections(signature_file);
    let main = sf_sections
        .first()
        .ok_or_else(|| jar("empty signature file".to_string()))?;
    let manifest_digest = STANDARD.encode(Sha256::digest(manifest));
    if digest_attribute(&main.1, "SHA-256-Digest-Manifest").as_ref() != Some(&manifest_digest) {
        return Err(jar("whole-manifest digest mismatch".to_string()));
    }
    let manifest_sections: BTreeMap<_, _> = sections
        .iter()
        .map(|(name, _, raw)| (name.as_str(), raw))
        .collect();
    for (name, attributes, _) in sf_sections.iter().skip(1) {
        let raw = manifest_sections
            .get(name.as_str())
            .ok_or_else(|| jar(format!("signature file names unknown section {name}")))?;
        let expected = STANDARD.encode(Sha256::digest(raw));
        if digest_attribute(attributes, "SHA-256-Digest").as_ref() != Some(&expected) {
            return Err(jar(format!("section digest mismatch for {name}")));
        }
    }

    // PKCS#1 v1.5 is deterministic, so the block must match byte for byte.
    let signature = identity.sign(signature_file)?;
    if pkcs7::signed_data(identity, &signature)? != *signature_block {
        return Err(jar(format!("{rsa_name} does not match the signature file")));
    }
    debug!("v1 signature verified over {covered} entries");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::android::zip::ApkWriter;
    use crate::signing::sign_apk;

    fn unsigned_archive() -> Vec<u8> {
        let mut writer = ApkWriter::new(Vec::new());
        writer.add_entry("AndroidManifest.xml", b"\x03\x00\x08\x00").expect("entry");
        writer.add_entry("classes.dex", b"dex\n035\0").expect("entry");
        writer.add_entry("res/raw/notes.txt", &[b'n'; 4000]).expect("entry");
        writer.finish().expect("finish")
    }

    #[test]
    fn freshly_signed_archive_verifies() {
        let identity = SigningIdentity::embedded().expect("identity");
        let signed = sign_apk(&unsigned_archive(), &identity).expect("sign");
        let report = verify_apk(&signed, &identity).expect("verify");
        assert!(report.all());
    }

    #[test]
    fn long_multibyte_entry_names_verify() {
        let identity = SigningIdentity::embedded().expect("identity");
        let name = format!("assets/{}.txt", "\u{251c}\u{2510}".repeat(20));
        let mut writer = ApkWriter::new(Vec::new());
        writer.add_entry("AndroidManifest.xml", b"\x03\x00\x08\x00").expect("entry");
        writer.add_entry(&name, b"notes").expect("entry");
        let unsigned = writer.finish().expect("finish");

        let signed = sign_apk(&unsigned, &identity).expect("sign");
        let report = verify_apk(&signed, &identity).expect("verify");
        assert!(report.all());

        let mut archive = ZipArchive::new(Cursor::new(signed.as_slice())).expect("zip");
        assert!(archive.by_name(&name).is_ok());
    }

    #[test]
    fn unsigned_archive_has_no_block() {
        let identity = SigningIdentity::embedded().expect("identity");
        assert!(matches!(
            verify_apk(&unsigned_archive(), &identity),
            Err(VerifyError::MissingBlock)
        ));
    }

    #[test]
    fn tampered_entry_breaks_the_content_digest() {
        let identity = SigningIdentity::embedded().expect("identity");
        let mut signed = sign_apk(&unsigned_archive(), &identity).expect("sign");
        // The stored classes.dex payload sits in the entry region.
        let at = signed
            .windows(8)
            .position(|w| w == b"dex\n035\0")
            .expect("payload");
        signed[at] ^= 0xff;
        assert!(matches!(
            verify_apk(&signed, &identity),
            Err(VerifyError::Scheme { scheme: 2, .. })
        ));
    }
}
