//! The end-to-end repackaging run: extract, patch, inject, re-archive, sign.

use crate::android::binary_xml::ManifestDocument;
use crate::android::manifest_patch::{ManifestPatcher, PatchReport};
use crate::android::zip::{ApkWriter, MANIFEST_ENTRY};
use crate::config::{ClonerConfig, InjectionTable, PipelineOptions};
use crate::error::Result;
use crate::extract::{extract_archive, read_entry, ExtractedArchive};
use crate::inject::{InjectionAssets, InjectionSummary, Injector};
use crate::scratch::ScratchTree;
use crate::signing::{sign_apk, SigningIdentity};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tempfile::NamedTempFile;

/// Outcome of one successful run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub package: String,
    /// Present for injection runs, absent for config re-packs.
    pub patch: Option<PatchReport>,
    pub injection: Option<InjectionSummary>,
    /// Number of entries in the unsigned archive.
    pub entries: usize,
    /// `None` when verification was not attempted.
    pub verified: Option<bool>,
    pub output_len: u64,
}

/// One configured repackaging pipeline. Runs share nothing but the
/// read-only table and identity.
#[derive(Clone, Copy, Debug)]
pub struct Pipeline<'a> {
    table: &'a InjectionTable,
    identity: Option<&'a SigningIdentity>,
    options: &'a PipelineOptions,
}

static DEFAULT_OPTIONS: Lazy<PipelineOptions> = Lazy::new(PipelineOptions::default);

impl Default for Pipeline<'static> {
    fn default() -> Self {
        Pipeline::new(InjectionTable::standard(), &DEFAULT_OPTIONS)
    }
}

impl<'a> Pipeline<'a> {
    pub fn new(table: &'a InjectionTable, options: &'a PipelineOptions) -> Self {
        Pipeline {
            table,
            identity: None,
            options,
        }
    }

    /// Sign with `identity` instead of the embedded one.
    pub fn with_identity(mut self, identity: &'a SigningIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn table(&self) -> &InjectionTable {
        self.table
    }

    /// Clone `input` into `output`. Nothing is written to `output` unless
    /// every stage succeeded.
    pub fn run<R: Read, W: Write>(
        &self,
        input: R,
        mut output: W,
        assets: &InjectionAssets,
    ) -> Result<RunSummary> {
        let extracted = self.extract(input)?;
        let ExtractedArchive {
            scratch,
            manifest,
            code_units,
            ..
        } = extracted;

        let (manifest, patch) = ManifestPatcher::new(self.table).patch_bytes(&manifest)?;
        let injection = Injector::new(self.table, self.options.bundle_limit).inject(
            &scratch,
            &code_units,
            assets,
        )?;
        let (unsigned, entries) = assemble_archive(&manifest, &scratch)?;
        close_scratch(scratch);

        let (signed, verified) = self.sign(&unsigned)?;
        output.write_all(&signed)?;
        output.flush()?;
        info!(
            "cloned {} into {} bytes ({entries} entries, new code unit {})",
            patch.package,
            signed.len(),
            injection.code_unit
        );
        Ok(RunSummary {
            package: patch.package.clone(),
            patch: Some(patch),
            injection: Some(injection),
            entries,
            verified,
            output_len: signed.len() as u64,
        })
    }

    /// Re-pack an already cloned archive with a new configuration asset and
    /// sign it again. The manifest is carried over untouched.
    pub fn update_config<R: Read, W: Write>(
        &self,
        input: R,
        mut output: W,
        config: &Path,
    ) -> Result<RunSummary> {
        let ExtractedArchive {
            scratch, manifest, ..
        } = self.extract(input)?;
        let package = ManifestDocument::decode(&manifest)?
            .package_name()
            .unwrap_or_default()
            .to_string();

        let config = ClonerConfig::load_or_empty(config);
        Injector::new(self.table, self.options.bundle_limit).stage_config(&scratch, &config)?;
        let (unsigned, entries) = assemble_archive(&manifest, &scratch)?;
        close_scratch(scratch);

        let (signed, verified) = self.sign(&unsigned)?;
        output.write_all(&signed)?;
        output.flush()?;
        info!("updated configuration of {package} ({} keys)", config.values.len());
        Ok(RunSummary {
            package,
            patch: None,
            injection: None,
            entries,
            verified,
            output_len: signed.len() as u64,
        })
    }

    /// [`Pipeline::run`] between files. The output is staged beside
    /// `output` and only renamed into place on success.
    pub fn run_files(&self, input: &Path, output: &Path, assets: &InjectionAssets) -> Result<RunSummary> {
        let source = File::open(input)?;
        write_atomically(output, |staged| self.run(source, staged, assets))
    }

    pub fn update_config_files(&self, input: &Path, output: &Path, config: &Path) -> Result<RunSummary> {
        let source = File::open(input)?;
        write_atomically(output, |staged| self.update_config(source, staged, config))
    }

    /// Spool `input` and extract it into a fresh scratch tree.
    fn extract<R: Read>(&self, mut input: R) -> Result<ExtractedArchive> {
        let mut spool = tempfile::tempfile()?;
        let spooled = io::copy(&mut input, &mut spool)?;
        spool.seek(SeekFrom::Start(0))?;
        debug!("spooled {spooled} input bytes");
        let scratch = ScratchTree::create(self.options.scratch_root.as_deref())?;
        extract_archive(spool, scratch)
    }

    fn sign(&self, unsigned: &[u8]) -> Result<(Vec<u8>, Option<bool>)> {
        let embedded;
        let identity = match self.identity {
            Some(identity) => identity,
            None => {
                embedded = SigningIdentity::embedded()?;
                &embedded
            }
        };
        let signed = sign_apk(unsigned, identity)?;
        let verified = if self.options.verify {
            verify_signed(&signed, identity)
        } else {
            None
        };
        Ok((signed, verified))
    }
}

impl Pipeline<'static> {
    /// Run [`Pipeline::run_files`] on its own named thread.
    pub fn spawn(
        self,
        input: PathBuf,
        output: PathBuf,
        assets: InjectionAssets,
    ) -> io::Result<JoinHandle<Result<RunSummary>>> {
        thread::Builder::new()
            .name("apkinject-run".to_string())
            .spawn(move || self.run_files(&input, &output, &assets))
    }
}

#[cfg(feature = "verify")]
fn verify_signed(signed: &[u8], identity: &SigningIdentity) -> Option<bool> {
    match crate::signing::verify::verify_apk(signed, identity) {
        Ok(report) => {
            debug!("verified {report:?}");
            Some(report.all())
        }
        Err(err) => {
            warn!("signed archive failed verification: {err}");
            Some(false)
        }
    }
}

#[cfg(not(feature = "verify"))]
fn verify_signed(_signed: &[u8], _identity: &SigningIdentity) -> Option<bool> {
    None
}

fn close_scratch(scratch: ScratchTree) {
    let root = scratch.root().to_path_buf();
    if let Err(err) = scratch.close() {
        warn!("cannot remove scratch tree {}: {err}", root.display());
    }
}

/// Write through a temp file in `output`'s directory and persist it only if
/// `produce` succeeds; on failure the temp file is removed on drop.
fn write_atomically<T>(
    output: &Path,
    produce: impl FnOnce(&mut NamedTempFile) -> Result<T>,
) -> Result<T> {
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir)?;
    let value = produce(&mut staged)?;
    staged.as_file().sync_all()?;
    staged.persist(output)?;
    Ok(value)
}

/// Manifest first, then every scratch file in sorted order.
pub fn assemble_archive(manifest: &[u8], scratch: &ScratchTree) -> Result<(Vec<u8>, usize)> {
    let mut writer = ApkWriter::new(Vec::new());
    writer.add_entry(MANIFEST_ENTRY, manifest)?;
    let mut entries = 1;
    for name in scratch.entry_names()? {
        if name == MANIFEST_ENTRY {
            continue;
        }
        let data = scratch.read_file(&name)?;
        let plan = writer.add_entry(&name, &data)?;
        debug!("{name}: {:?}", plan.compression);
        entries += 1;
    }
    Ok((writer.finish()?, entries))
}

/// Clone `input` into `output` with the standard table and options.
pub fn inject_and_sign(input: &Path, output: &Path, assets: &InjectionAssets) -> Result<RunSummary> {
    Pipeline::default().run_files(input, output, assets)
}

/// Replace the configuration asset of a cloned archive and re-sign it.
pub fn update_config_and_sign(input: &Path, output: &Path, config: &Path) -> Result<RunSummary> {
    Pipeline::default().update_config_files(input, output, config)
}

/// The parsed configuration embedded in a cloned archive; `None` when the
/// asset is absent or is not valid JSON.
pub fn read_embedded_config(archive: &Path) -> Result<Option<Value>> {
    let asset = &InjectionTable::standard().config_asset;
    let Some(bytes) = read_entry(File::open(archive)?, asset)? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            warn!("{asset} in {} is not JSON: {err}", archive.display());
            Ok(None)
        }
    }
}
