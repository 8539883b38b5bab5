//! Staging the injected code unit, assets and native libraries.

use crate::android::zip::{code_unit_name, is_probably_zip};
use crate::config::{ClonerConfig, InjectionTable};
use crate::error::{InjectError, Result};
use crate::scratch::ScratchTree;
use log::{info, warn};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Free-slot computation for an additional `classes*.dex`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DexAllocation {
    existing: BTreeSet<u32>,
}

impl DexAllocation {
    pub fn new(existing: impl IntoIterator<Item = u32>) -> Self {
        DexAllocation {
            existing: existing.into_iter().collect(),
        }
    }

    /// `max + 1`, or 1 (the bare `classes.dex`) when there are no units.
    /// When `max` is already `u32::MAX` the lowest unused index is taken.
    pub fn next_index(&self) -> u32 {
        match self.existing.iter().next_back() {
            None => 1,
            Some(max) => max
                .checked_add(1)
                .or_else(|| (1..=u32::MAX).find(|index| !self.existing.contains(index)))
                .unwrap_or(1),
        }
    }

    pub fn next_name(&self) -> String {
        code_unit_name(self.next_index())
    }

    /// Pick a name that collides with nothing already in the scratch tree,
    /// wrapping around to the low indices once `u32::MAX` is passed.
    pub fn allocate(&self, scratch: &ScratchTree) -> Result<String> {
        let start = self.next_index();
        (start..=u32::MAX)
            .chain(1..start)
            .filter(|index| !self.existing.contains(index))
            .map(code_unit_name)
            .find(|name| !scratch.contains(name))
            .ok_or_else(|| InjectError::ArchiveFormat("no free classes*.dex name left".to_string()))
    }
}

/// Caller-supplied files to inject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectionAssets {
    pub code_unit: PathBuf,
    pub config: PathBuf,
    pub native_lib_dir: PathBuf,
    pub bundled_data: Option<PathBuf>,
}

/// What actually went into the scratch tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InjectionSummary {
    pub code_unit: String,
    pub config_parsed: bool,
    pub bundle_embedded: bool,
    pub native_libraries: Vec<String>,
}

pub struct Injector<'a> {
    table: &'a InjectionTable,
    bundle_limit: u64,
}

impl<'a> Injector<'a> {
    pub fn new(table: &'a InjectionTable, bundle_limit: u64) -> Self {
        Injector {
            table,
            bundle_limit,
        }
    }

    pub fn inject(
        &self,
        scratch: &ScratchTree,
        code_units: &BTreeSet<u32>,
        assets: &InjectionAssets,
    ) -> Result<InjectionSummary> {
        let code_unit = DexAllocation::new(code_units.iter().copied()).allocate(scratch)?;
        scratch.copy_into(&code_unit, &assets.code_unit)?;

        let (config, config_parsed) = match ClonerConfig::load(&assets.config) {
            Ok(config) => (config, true),
            Err(err) => {
                warn!("{err}; continuing with an empty configuration");
                (ClonerConfig::empty(), false)
            }
        };
        self.stage_config(scratch, &config)?;

        let bundle_embedded = match &assets.bundled_data {
            Some(path) => match self.check_bundle(path) {
                Ok(()) => {
                    scratch.copy_into(&self.table.bundle_asset, path)?;
                    true
                }
                Err(err) => {
                    warn!("{err}; skipping bundled data");
                    false
                }
            },
            None => false,
        };

        let native_libraries = self.stage_native_libraries(scratch, &assets.native_lib_dir)?;

        info!(
            "staged {code_unit}, {} native libraries{}",
            native_libraries.len(),
            if bundle_embedded { ", bundled data" } else { "" }
        );
        Ok(InjectionSummary {
            code_unit,
            config_parsed,
            bundle_embedded,
            native_libraries,
        })
    }

    pub fn stage_config(&self, scratch: &ScratchTree, config: &ClonerConfig) -> Result<()> {
        scratch.create_dir("assets")?;
        scratch.write_file(&self.table.config_asset, &config.asset_bytes)
    }

    /// Accept a bundled-data file only if it starts with a ZIP signature and
    /// fits under the size ceiling.
    pub fn check_bundle(&self, path: &Path) -> Result<()> {
        let reject = |reason: String| InjectError::BundleRejected(format!("{}: {reason}", path.display()));
        let metadata = fs::metadata(path).map_err(|err| reject(err.to_string()))?;
        if !metadata.is_file() {
            return Err(reject("not a regular file".to_string()));
        }
        if metadata.len() > self.bundle_limit {
            return Err(reject(format!(
                "{} bytes exceeds the {} byte limit",
                metadata.len(),
                self.bundle_limit
            )));
        }
        let mut magic = [0u8; 4];
        let mut file = File::open(path).map_err(|err| reject(err.to_string()))?;
        let read = file.read(&mut magic).map_err(|err| reject(err.to_string()))?;
        if !is_probably_zip(&magic[..read]) {
            return Err(reject("not a ZIP archive".to_string()));
        }
        Ok(())
    }

    /// Copy every `*.so` in `source` into the single target ABI directory.
    fn stage_native_libraries(&self, scratch: &ScratchTree, source: &Path) -> Result<Vec<String>> {
        let target = self.table.native_dir();
        scratch.create_dir(&target)?;
        let entries = match fs::read_dir(source) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("native library dir {}: {err}", source.display());
                return Ok(Vec::new());
            }
        };
        let mut libraries = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(".so") {
                libraries.insert((file_name.to_string(), entry.path()));
            }
        }
        let mut staged = Vec::with_capacity(libraries.len());
        for (file_name, path) in libraries {
            let name = format!("{target}/{file_name}");
            scratch.copy_into(&name, &path)?;
            staged.push(name);
        }
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_slot_follows_max() {
        assert_eq!(DexAllocation::new([]).next_name(), "classes.dex");
        assert_eq!(DexAllocation::new([1]).next_name(), "classes2.dex");
        assert_eq!(DexAllocation::new([1, 2, 3]).next_name(), "classes4.dex");
        assert_eq!(DexAllocation::new([1, 5]).next_name(), "classes6.dex");
    }

    #[test]
    fn allocation_skips_names_present_on_disk() {
        let scratch = ScratchTree::create(None).expect("scratch");
        scratch.write_file("classes2.dex", b"x").expect("write");
        scratch.write_file("classes3.dex", b"x").expect("write");
        assert_eq!(DexAllocation::new([1]).allocate(&scratch).expect("free name"), "classes4.dex");
    }

    #[test]
    fn allocation_past_the_largest_index_wraps_to_a_free_slot() {
        assert_eq!(DexAllocation::new([1, u32::MAX]).next_name(), "classes2.dex");
        assert_eq!(DexAllocation::new([u32::MAX]).next_name(), "classes.dex");

        let scratch = ScratchTree::create(None).expect("scratch");
        scratch.write_file("classes2.dex", b"x").expect("write");
        let name = DexAllocation::new([1, u32::MAX]).allocate(&scratch).expect("free name");
        assert_eq!(name, "classes3.dex");
    }
}
