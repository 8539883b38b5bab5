//! Per-run working directory mirroring final archive paths.

use crate::error::{InjectError, Result};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

/// A uniquely named temporary directory owned by exactly one pipeline run.
///
/// Dropping the tree deletes it, whatever state the run ended in.
#[derive(Debug)]
pub struct ScratchTree {
    dir: TempDir,
}

impl ScratchTree {
    /// Create a fresh tree under `base`, or under the system temp dir.
    pub fn create(base: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("apk_");
        let dir = match base {
            Some(base) => {
                fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        debug!("scratch tree at {}", dir.path().display());
        Ok(ScratchTree { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Map an archive entry name to a path strictly inside the tree.
    ///
    /// Parent components, absolute names, drive prefixes and backslashes are
    /// all refused with [`InjectError::UnsafePath`].
    pub fn resolve(&self, entry_name: &str) -> Result<PathBuf> {
        let unsafe_path = || InjectError::UnsafePath(entry_name.to_string());
        if entry_name.contains('\\') || entry_name.contains('\0') {
            return Err(unsafe_path());
        }
        let mut relative = PathBuf::new();
        for (idx, component) in Path::new(entry_name).components().enumerate() {
            match component {
                Component::Normal(part) => {
                    if idx == 0 && part.to_string_lossy().contains(':') {
                        return Err(unsafe_path());
                    }
                    relative.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(unsafe_path());
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(unsafe_path());
        }
        let resolved = self.root().join(&relative);
        if !resolved.starts_with(self.root()) {
            return Err(unsafe_path());
        }
        Ok(resolved)
    }

    pub fn contains(&self, entry_name: &str) -> bool {
        self.resolve(entry_name)
            .map(|path| path.symlink_metadata().is_ok())
            .unwrap_or(false)
    }

    pub fn create_dir(&self, entry_name: &str) -> Result<PathBuf> {
        let path = self.resolve(entry_name)?;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Create (or truncate) a file and every missing parent directory.
    pub fn create_file(&self, entry_name: &str) -> Result<File> {
        let path = self.resolve(entry_name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(&path)?)
    }

    pub fn write_file(&self, entry_name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(entry_name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn copy_into(&self, entry_name: &str, source: &Path) -> Result<u64> {
        let mut input = File::open(source)?;
        let mut output = self.create_file(entry_name)?;
        Ok(io::copy(&mut input, &mut output)?)
    }

    pub fn read_file(&self, entry_name: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        File::open(self.resolve(entry_name)?)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Every regular file in the tree as a `/`-separated entry name, sorted.
    ///
    /// Symbolic links are never followed or emitted.
    pub fn entry_names(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        let mut pending = vec![self.root().to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                let path = entry.path();
                if file_type.is_symlink() {
                    warn!("skipping symbolic link {}", path.display());
                } else if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    names.insert(self.entry_name(&path)?);
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn entry_name(&self, path: &Path) -> Result<String> {
        let relative = path
            .strip_prefix(self.root())
            .map_err(|_| InjectError::UnsafePath(path.display().to_string()))?;
        let mut parts = Vec::new();
        for component in relative.components() {
            let part = component.as_os_str().to_str().ok_or_else(|| {
                InjectError::ArchiveFormat(format!("non UTF-8 path {}", path.display()))
            })?;
            parts.push(part);
        }
        Ok(parts.join("/"))
    }

    /// Delete the tree now and report failures, instead of on drop.
    pub fn close(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_escapes() {
        let scratch = ScratchTree::create(None).expect("scratch");
        for name in [
            "../../evil",
            "a/../../evil",
            "/etc/passwd",
            "..\\evil",
            "C:/windows/evil",
            "",
            "./",
        ] {
            assert!(
                matches!(scratch.resolve(name), Err(InjectError::UnsafePath(_))),
                "{name:?} should be rejected"
            );
        }
        let ok = scratch.resolve("./res/layout/main.xml").expect("plain path");
        assert!(ok.starts_with(scratch.root()));
    }

    #[test]
    fn entry_names_are_sorted_and_slash_separated() {
        let scratch = ScratchTree::create(None).expect("scratch");
        scratch.write_file("res/b.xml", b"b").expect("write");
        scratch.write_file("assets/a.txt", b"a").expect("write");
        scratch.write_file("classes.dex", b"dex").expect("write");
        scratch.create_dir("lib/arm64-v8a").expect("empty dir");
        assert_eq!(
            scratch.entry_names().expect("walk"),
            vec!["assets/a.txt", "classes.dex", "res/b.xml"]
        );
    }

    #[test]
    fn drop_removes_tree() {
        let scratch = ScratchTree::create(None).expect("scratch");
        let root = scratch.root().to_path_buf();
        scratch.write_file("x/y", b"1").expect("write");
        drop(scratch);
        assert!(!root.exists());
    }
}
