//! # apkinject
//!
//! Repackage an Android APK: patch its compiled `AndroidManifest.xml` with
//! extra components, add a code unit, assets and native libraries, rebuild
//! the archive deterministically and sign it with v1, v2 and v3 schemes.
//!
//! ```no_run
//!  use apkinject::inject::InjectionAssets;
//!  use apkinject::pipeline::inject_and_sign;
//!  use std::path::{Path, PathBuf};
//!
//!  let assets = InjectionAssets {
//!      code_unit: PathBuf::from("payload/classes.dex"),
//!      config: PathBuf::from("payload/cloner.json"),
//!      native_lib_dir: PathBuf::from("payload/lib"),
//!      bundled_data: None,
//!  };
//!  let summary = inject_and_sign(Path::new("app.apk"), Path::new("clone.apk"), &assets).unwrap();
//!  println!("{} -> {} bytes", summary.package, summary.output_len);
//! ```

pub mod android;
pub mod config;
pub mod error;
pub mod extract;
pub mod inject;
pub mod pipeline;
pub mod scratch;
pub mod signing;
#[cfg(test)]
mod tests;

pub use error::{InjectError, Result};
pub use pipeline::{inject_and_sign, read_embedded_config, update_config_and_sign, Pipeline, RunSummary};
