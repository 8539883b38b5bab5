//! v1 + v2 + v3 APK signing with one fixed identity.
//!
//! The unsigned archive is rebuilt with JAR signature files appended (v1),
//! then an APK Signing Block carrying v2 and v3 signers is spliced in front of
//! its central directory.
//! <https://source.android.com/docs/security/features/apksigning>

use thiserror::Error;

pub mod block;
pub mod identity;
pub mod jar;
mod pkcs7;
#[cfg(feature = "verify")]
pub mod verify;

pub use identity::SigningIdentity;

/// Errors raised while producing a signature.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing identity unusable: {0}")]
    Identity(String),

    #[error("archive cannot be signed: {0}")]
    Archive(String),

    #[error("RSA signature failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("DER encoding failed: {0}")]
    Der(#[from] x509_cert::der::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sign an unsigned archive with all three schemes.
pub fn sign_apk(unsigned: &[u8], identity: &SigningIdentity) -> Result<Vec<u8>, SigningError> {
    let with_jar = jar::sign_jar(unsigned, identity)?;
    block::sign_v2_v3(&with_jar, identity)
}
