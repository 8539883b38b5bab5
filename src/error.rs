use crate::android::binary_xml::BinaryXmlError;
use crate::signing::SigningError;
use std::io;
use thiserror::Error;

/// Result alias used throughout the pipeline.
pub type Result<T> = std::result::Result<T, InjectError>;

/// Every failure the repackaging pipeline can surface.
///
/// `ConfigRead` and `BundleRejected` are recovered inside the injector and only
/// ever logged; the remaining variants abort the run.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("invalid input archive: {0}")]
    ArchiveFormat(String),

    #[error("archive entry escapes the scratch directory: {0}")]
    UnsafePath(String),

    #[error("cannot decode AndroidManifest.xml: {0}")]
    Decode(String),

    #[error("cannot encode AndroidManifest.xml: {0}")]
    Encode(String),

    #[error("manifest root has no package attribute")]
    MissingPackage,

    #[error("manifest has no <application> element")]
    MissingApplication,

    #[error("cannot read configuration: {0}")]
    ConfigRead(String),

    /// A component-name table override that does not parse. Unlike a broken
    /// clone configuration this is an operator error and is never recovered.
    #[error("invalid injection table: {0}")]
    Table(String),

    #[error("bundled data rejected: {0}")]
    BundleRejected(String),

    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<zip::result::ZipError> for InjectError {
    fn from(value: zip::result::ZipError) -> Self {
        InjectError::ArchiveFormat(value.to_string())
    }
}

impl From<BinaryXmlError> for InjectError {
    fn from(value: BinaryXmlError) -> Self {
        match value {
            BinaryXmlError::Encode(msg) => InjectError::Encode(msg),
            other => InjectError::Decode(other.to_string()),
        }
    }
}

impl From<tempfile::PersistError> for InjectError {
    fn from(value: tempfile::PersistError) -> Self {
        InjectError::Io(value.error)
    }
}
