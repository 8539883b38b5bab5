//! Just enough DER to emit a detached PKCS#7 `SignedData` for a JAR
//! signature block (RFC 2315 section 9).

use super::{SigningError, SigningIdentity};
use x509_cert::der::Encode;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_CONTEXT_0: u8 = 0xA0;

/// 1.2.840.113549.1.7.2
const OID_SIGNED_DATA: &[u8] = &[
    0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02,
];
/// 1.2.840.113549.1.7.1
const OID_DATA: &[u8] = &[
    0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01,
];
/// 2.16.840.1.101.3.4.2.1
const OID_SHA256: &[u8] = &[
    0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
];
/// 1.2.840.113549.1.1.1
const OID_RSA_ENCRYPTION: &[u8] = &[
    0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01,
];

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

fn constructed(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
    tlv(tag, &parts.concat())
}

fn algorithm(oid: &[u8]) -> Vec<u8> {
    constructed(TAG_SEQUENCE, &[oid, &tlv(TAG_NULL, &[])])
}

/// `ContentInfo { signedData }` with the certificate embedded and one
/// SignerInfo carrying `signature` (RSA over the SHA-256 of the `.SF` file).
pub fn signed_data(identity: &SigningIdentity, signature: &[u8]) -> Result<Vec<u8>, SigningError> {
    let tbs = &identity.certificate().tbs_certificate;
    let issuer = tbs.issuer.to_der()?;
    let serial = tbs.serial_number.to_der()?;
    let version = tlv(TAG_INTEGER, &[1]);
    let sha256 = algorithm(OID_SHA256);

    let signer_info = constructed(
        TAG_SEQUENCE,
        &[
            &version,
            &constructed(TAG_SEQUENCE, &[&issuer, &serial]),
            &sha256,
            &algorithm(OID_RSA_ENCRYPTION),
            &tlv(TAG_OCTET_STRING, signature),
        ],
    );

    let signed = constructed(
        TAG_SEQUENCE,
        &[
            &version,
            &constructed(TAG_SET, &[&sha256]),
            &constructed(TAG_SEQUENCE, &[OID_DATA]),
            &tlv(TAG_CONTEXT_0, identity.certificate_der()),
            &constructed(TAG_SET, &[&signer_info]),
        ],
    );

    Ok(constructed(
        TAG_SEQUENCE,
        &[OID_SIGNED_DATA, &tlv(TAG_CONTEXT_0, &signed)],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_form_lengths() {
        assert_eq!(tlv(0x04, &[0u8; 5])[..2], [0x04, 0x05]);
        assert_eq!(tlv(0x04, &[0u8; 200])[..3], [0x04, 0x81, 200]);
        assert_eq!(tlv(0x04, &[0u8; 300])[..4], [0x04, 0x82, 0x01, 0x2C]);
    }

    #[test]
    fn signed_data_is_one_sequence() {
        let identity = SigningIdentity::embedded().expect("identity");
        let block = signed_data(&identity, &[0xAB; 256]).expect("pkcs7");
        assert_eq!(block[0], TAG_SEQUENCE);
        assert_eq!(&block[4..4 + OID_SIGNED_DATA.len()], OID_SIGNED_DATA);
        assert!(block
            .windows(identity.certificate_der().len())
            .any(|w| w == identity.certificate_der()));
    }
}
