//! APK Signing Block with v2 and v3 signers.

use super::{SigningError, SigningIdentity};
use log::debug;
use sha2::{Digest, Sha256};

pub const MAGIC: &[u8; 16] = b"APK Sig Block 42";
pub const V2_BLOCK_ID: u32 = 0x7109_871a;
pub const V3_BLOCK_ID: u32 = 0xf053_68c0;
pub const VERITY_PADDING_BLOCK_ID: u32 = 0x4272_6577;
pub const RSA_PKCS1V15_SHA2_256: u32 = 0x0103;

/// v2 attribute announcing which newer scheme also signed the archive.
pub const STRIPPING_PROTECTION_ATTR_ID: u32 = 0xbeef_f00d;
const V3_SCHEME_ID: u32 = 3;

/// v3 signer SDK range: Android 9 and up.
pub const V3_MIN_SDK: u32 = 28;
pub const V3_MAX_SDK: u32 = 0x7fff_ffff;

const CHUNK_SIZE: usize = 1024 * 1024;
const PAGE_SIZE: usize = 4096;
const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const EOCD_MIN_LEN: usize = 22;
const EOCD_CD_OFFSET: usize = 16;
const EOCD_CD_SIZE: usize = 12;
/// Trailing `u64` size followed by the magic.
const BLOCK_FOOTER_LEN: usize = 8 + 16;

fn malformed(reason: impl Into<String>) -> SigningError {
    SigningError::Archive(reason.into())
}

/// Offsets of the regions covered by the content digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZipSections {
    /// Start of the signing block, or of the central directory if unsigned.
    pub signing_block_start: usize,
    pub central_directory_start: usize,
    pub eocd_start: usize,
}

impl ZipSections {
    pub fn has_signing_block(&self) -> bool {
        self.signing_block_start < self.central_directory_start
    }
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Scan backwards for the end-of-central-directory record whose comment
/// length reaches exactly the end of the file.
fn find_eocd(apk: &[u8]) -> Option<usize> {
    if apk.len() < EOCD_MIN_LEN {
        return None;
    }
    let lowest = apk.len().saturating_sub(EOCD_MIN_LEN + u16::MAX as usize);
    (lowest..=apk.len() - EOCD_MIN_LEN).rev().find(|&pos| {
        read_u32(apk, pos) == Some(EOCD_SIGNATURE)
            && apk
                .get(pos + 20..pos + 22)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
                == Some(apk.len() - pos - EOCD_MIN_LEN)
    })
}

pub fn locate_sections(apk: &[u8]) -> Result<ZipSections, SigningError> {
    let eocd_start = find_eocd(apk).ok_or_else(|| malformed("end of central directory not found"))?;
    let cd_start = read_u32(apk, eocd_start + EOCD_CD_OFFSET)
        .ok_or_else(|| malformed("truncated end of central directory"))? as usize;
    let cd_size = read_u32(apk, eocd_start + EOCD_CD_SIZE)
        .ok_or_else(|| malformed("truncated end of central directory"))? as usize;
    if cd_start.checked_add(cd_size) != Some(eocd_start) {
        return Err(malformed(format!(
            "central directory {cd_start}+{cd_size} does not end at {eocd_start}"
        )));
    }

    let mut signing_block_start = cd_start;
    if cd_start >= BLOCK_FOOTER_LEN && apk[cd_start - 16..cd_start] == MAGIC[..] {
        let size = read_u64(apk, cd_start - BLOCK_FOOTER_LEN)
            .ok_or_else(|| malformed("truncated signing block"))? as usize;
        signing_block_start = cd_start
            .checked_sub(size)
            .and_then(|v| v.checked_sub(8))
            .ok_or_else(|| malformed("signing block size out of range"))?;
        if read_u64(apk, signing_block_start) != Some(size as u64) {
            return Err(malformed("signing block sizes disagree"));
        }
    }
    Ok(ZipSections {
        signing_block_start,
        central_directory_start: cd_start,
        eocd_start,
    })
}

/// Chunked SHA-256 over entries, central directory and EOCD, with the
/// EOCD's central directory offset pointing at the signing block.
pub fn content_digest(apk: &[u8], sections: &ZipSections) -> [u8; 32] {
    let mut eocd = apk[sections.eocd_start..].to_vec();
    eocd[EOCD_CD_OFFSET..EOCD_CD_OFFSET + 4]
        .copy_from_slice(&(sections.signing_block_start as u32).to_le_bytes());

    let regions: [&[u8]; 3] = [
        &apk[..sections.signing_block_start],
        &apk[sections.central_directory_start..sections.eocd_start],
        &eocd,
    ];
    let mut chunks = Vec::new();
    for region in regions {
        for chunk in region.chunks(CHUNK_SIZE) {
            let mut hasher = Sha256::new();
            hasher.update([0xa5]);
            hasher.update((chunk.len() as u32).to_le_bytes());
            hasher.update(chunk);
            chunks.push(<[u8; 32]>::from(hasher.finalize()));
        }
    }

    let mut hasher = Sha256::new();
    hasher.update([0x5a]);
    hasher.update((chunks.len() as u32).to_le_bytes());
    for chunk in &chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

fn push_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

/// Length-prefixed sequence of length-prefixed items.
fn sequence<'a>(items: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    for item in items {
        push_prefixed(&mut body, item);
    }
    body
}

fn id_value(id: u32, value: &[u8]) -> Vec<u8> {
    let mut out = id.to_le_bytes().to_vec();
    push_prefixed(&mut out, value);
    out
}

fn encode_signed_data(
    digest: &[u8; 32],
    identity: &SigningIdentity,
    sdk_range: Option<(u32, u32)>,
    attributes: &[(u32, Vec<u8>)],
) -> Vec<u8> {
    let digests = id_value(RSA_PKCS1V15_SHA2_256, digest);
    let attributes: Vec<Vec<u8>> = attributes
        .iter()
        .map(|(id, value)| [&id.to_le_bytes()[..], value].concat())
        .collect();

    let mut out = Vec::new();
    push_prefixed(&mut out, &sequence([digests.as_slice()]));
    push_prefixed(&mut out, &sequence([identity.certificate_der()]));
    if let Some((min, max)) = sdk_range {
        out.extend_from_slice(&min.to_le_bytes());
        out.extend_from_slice(&max.to_le_bytes());
    }
    push_prefixed(&mut out, &sequence(attributes.iter().map(Vec::as_slice)));
    out
}

fn encode_signer(
    digest: &[u8; 32],
    identity: &SigningIdentity,
    sdk_range: Option<(u32, u32)>,
    attributes: &[(u32, Vec<u8>)],
) -> Result<Vec<u8>, SigningError> {
    let signed_data = encode_signed_data(digest, identity, sdk_range, attributes);
    let signature = id_value(RSA_PKCS1V15_SHA2_256, &identity.sign(&signed_data)?);

    let mut signer = Vec::new();
    push_prefixed(&mut signer, &signed_data);
    if let Some((min, max)) = sdk_range {
        signer.extend_from_slice(&min.to_le_bytes());
        signer.extend_from_slice(&max.to_le_bytes());
    }
    push_prefixed(&mut signer, &sequence([signature.as_slice()]));
    push_prefixed(&mut signer, identity.public_key_der());

    let mut value = Vec::new();
    push_prefixed(&mut value, &sequence([signer.as_slice()]));
    Ok(value)
}

/// Serialize `(id, value)` pairs into a signing block padded to a multiple
/// of 4096 bytes.
pub fn encode_block(mut pairs: Vec<(u32, Vec<u8>)>) -> Vec<u8> {
    let pair_len = |value: &[u8]| 8 + 4 + value.len();
    let unpadded = 8 + pairs.iter().map(|(_, v)| pair_len(v)).sum::<usize>() + BLOCK_FOOTER_LEN;
    if unpadded % PAGE_SIZE != 0 {
        let mut padding = PAGE_SIZE - unpadded % PAGE_SIZE;
        if padding < pair_len(&[]) {
            padding += PAGE_SIZE;
        }
        pairs.push((VERITY_PADDING_BLOCK_ID, vec![0; padding - pair_len(&[])]));
    }

    let total = 8 + pairs.iter().map(|(_, v)| pair_len(v)).sum::<usize>() + BLOCK_FOOTER_LEN;
    let size = (total - 8) as u64;
    let mut block = Vec::with_capacity(total);
    block.extend_from_slice(&size.to_le_bytes());
    for (id, value) in &pairs {
        block.extend_from_slice(&((4 + value.len()) as u64).to_le_bytes());
        block.extend_from_slice(&id.to_le_bytes());
        block.extend_from_slice(value);
    }
    block.extend_from_slice(&size.to_le_bytes());
    block.extend_from_slice(MAGIC);
    debug_assert_eq!(block.len() % PAGE_SIZE, 0);
    block
}

/// Splice a fresh v2 + v3 signing block in front of the central directory.
/// Any existing block is replaced.
pub fn sign_v2_v3(apk: &[u8], identity: &SigningIdentity) -> Result<Vec<u8>, SigningError> {
    let sections = locate_sections(apk)?;
    let digest = content_digest(apk, &sections);

    let v2 = encode_signer(
        &digest,
        identity,
        None,
        &[(STRIPPING_PROTECTION_ATTR_ID, V3_SCHEME_ID.to_le_bytes().to_vec())],
    )?;
    let v3 = encode_signer(&digest, identity, Some((V3_MIN_SDK, V3_MAX_SDK)), &[])?;
    let block = encode_block(vec![(V2_BLOCK_ID, v2), (V3_BLOCK_ID, v3)]);

    let head = &apk[..sections.signing_block_start];
    let central_directory = &apk[sections.central_directory_start..sections.eocd_start];
    let new_cd_start = u32::try_from(head.len() + block.len())
        .map_err(|_| malformed("archive too large for a 32-bit central directory offset"))?;

    let mut out = Vec::with_capacity(head.len() + block.len() + apk.len() - sections.signing_block_start);
    out.extend_from_slice(head);
    out.extend_from_slice(&block);
    out.extend_from_slice(central_directory);
    let eocd_start = out.len();
    out.extend_from_slice(&apk[sections.eocd_start..]);
    out[eocd_start + EOCD_CD_OFFSET..eocd_start + EOCD_CD_OFFSET + 4]
        .copy_from_slice(&new_cd_start.to_le_bytes());

    debug!(
        "signing block of {} bytes at offset {}",
        block.len(),
        sections.signing_block_start
    );
    Ok(out)
}

/// Cursor over the little-endian, length-prefixed block structures.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SigningError> {
        if len > self.data.len() {
            return Err(malformed(format!(
                "need {len} bytes, {} left in signing block",
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, SigningError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, SigningError> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Ok(lo | (hi << 32))
    }

    fn prefixed(&mut self) -> Result<&'a [u8], SigningError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn items(&mut self) -> Result<Vec<&'a [u8]>, SigningError> {
        let mut inner = Reader::new(self.prefixed()?);
        let mut items = Vec::new();
        while !inner.is_empty() {
            items.push(inner.prefixed()?);
        }
        Ok(items)
    }
}

/// The `(id, value)` pairs of the archive's signing block, if it has one.
pub fn read_block_pairs(apk: &[u8]) -> Result<Option<Vec<(u32, Vec<u8>)>>, SigningError> {
    let sections = locate_sections(apk)?;
    if !sections.has_signing_block() {
        return Ok(None);
    }
    let body = &apk[sections.signing_block_start + 8..sections.central_directory_start - BLOCK_FOOTER_LEN];
    let mut reader = Reader::new(body);
    let mut pairs = Vec::new();
    while !reader.is_empty() {
        let len = reader.u64()? as usize;
        let mut pair = Reader::new(reader.take(len)?);
        let id = pair.u32()?;
        pairs.push((id, pair.data.to_vec()));
    }
    Ok(Some(pairs))
}

/// One signer decoded from a v2 or v3 block value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerRecord {
    pub signed_data: Vec<u8>,
    pub sdk_range: Option<(u32, u32)>,
    pub signatures: Vec<(u32, Vec<u8>)>,
    pub public_key: Vec<u8>,
}

/// Decoded `signed data` of a signer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignedDataRecord {
    pub digests: Vec<(u32, Vec<u8>)>,
    pub certificates: Vec<Vec<u8>>,
    pub sdk_range: Option<(u32, u32)>,
    pub attributes: Vec<(u32, Vec<u8>)>,
}

fn id_values(items: Vec<&[u8]>) -> Result<Vec<(u32, Vec<u8>)>, SigningError> {
    items
        .into_iter()
        .map(|item| {
            let mut reader = Reader::new(item);
            Ok((reader.u32()?, reader.prefixed()?.to_vec()))
        })
        .collect()
}

/// Decode the signers of a block value. `with_sdk_range` is true for v3.
pub fn parse_signers(value: &[u8], with_sdk_range: bool) -> Result<Vec<SignerRecord>, SigningError> {
    let mut outer = Reader::new(value);
    let mut signers = Vec::new();
    for raw in outer.items()? {
        let mut reader = Reader::new(raw);
        let signed_data = reader.prefixed()?.to_vec();
        let sdk_range = if with_sdk_range {
            Some((reader.u32()?, reader.u32()?))
        } else {
            None
        };
        let signatures = id_values(reader.items()?)?;
        let public_key = reader.prefixed()?.to_vec();
        signers.push(SignerRecord {
            signed_data,
            sdk_range,
            signatures,
            public_key,
        });
    }
    Ok(signers)
}

impl SignerRecord {
    pub fn decode_signed_data(&self) -> Result<SignedDataRecord, SigningError> {
        let mut reader = Reader::new(&self.signed_data);
        let digests = id_values(reader.items()?)?;
        let certificates = reader.items()?.into_iter().map(<[u8]>::to_vec).collect();
        let sdk_range = match self.sdk_range {
            Some(_) => Some((reader.u32()?, reader.u32()?)),
            None => None,
        };
        let attributes = reader
            .items()?
            .into_iter()
            .map(|item| {
                let mut attr = Reader::new(item);
                Ok((attr.u32()?, attr.data.to_vec()))
            })
            .collect::<Result<_, SigningError>>()?;
        Ok(SignedDataRecord {
            digests,
            certificates,
            sdk_range,
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An empty archive: just an EOCD with no entries.
    fn empty_zip() -> Vec<u8> {
        let mut eocd = EOCD_SIGNATURE.to_le_bytes().to_vec();
        eocd.extend_from_slice(&[0u8; 18]);
        eocd
    }

    #[test]
    fn padding_lands_on_page_boundary() {
        for filler in [0usize, 10, 4000, 4050, 4060, 4070, 9000] {
            let block = encode_block(vec![(V2_BLOCK_ID, vec![7; filler])]);
            assert_eq!(block.len() % PAGE_SIZE, 0, "filler {filler}");
            assert_eq!(&block[block.len() - 16..], MAGIC);
        }
    }

    #[test]
    fn signing_an_empty_archive_round_trips_the_pairs() {
        let identity = SigningIdentity::embedded().expect("identity");
        let signed = sign_v2_v3(&empty_zip(), &identity).expect("sign");
        let sections = locate_sections(&signed).expect("sections");
        assert_eq!(sections.signing_block_start, 0);
        assert!(sections.has_signing_block());

        let pairs = read_block_pairs(&signed).expect("pairs").expect("block");
        let ids: Vec<u32> = pairs.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids[..2], [V2_BLOCK_ID, V3_BLOCK_ID]);

        let v3 = parse_signers(&pairs[1].1, true).expect("v3 signers");
        assert_eq!(v3.len(), 1);
        assert_eq!(v3[0].sdk_range, Some((V3_MIN_SDK, V3_MAX_SDK)));
        let data = v3[0].decode_signed_data().expect("signed data");
        assert_eq!(data.digests[0].1, content_digest(&signed, &sections));
        assert_eq!(data.certificates, vec![identity.certificate_der().to_vec()]);

        let v2 = parse_signers(&pairs[0].1, false).expect("v2 signers");
        let data = v2[0].decode_signed_data().expect("signed data");
        assert_eq!(
            data.attributes,
            vec![(STRIPPING_PROTECTION_ATTR_ID, 3u32.to_le_bytes().to_vec())]
        );
    }

    #[test]
    fn resigning_replaces_the_block() {
        let identity = SigningIdentity::embedded().expect("identity");
        let once = sign_v2_v3(&empty_zip(), &identity).expect("sign");
        let twice = sign_v2_v3(&once, &identity).expect("resign");
        assert_eq!(once, twice);
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(locate_sections(b"PK\x03\x04").is_err());
    }
}
