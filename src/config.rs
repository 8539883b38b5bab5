//! Fixed names injected into every clone, plus per-run options.

use crate::error::{InjectError, Result};
use log::warn;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Largest bundled-data archive accepted into `assets/` (100 MiB).
pub const DEFAULT_BUNDLE_LIMIT: u64 = 100 * 1024 * 1024;

/// A component registered in `<application>` by the patcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverSpec {
    pub name: String,
    pub exported: bool,
    /// Permission a sender must hold; `None` leaves the attribute out.
    #[serde(default)]
    pub permission: Option<String>,
    pub actions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySpec {
    pub name: String,
    pub exported: bool,
    pub theme: u32,
}

/// Every name and identifier the patcher and injector write into a clone.
///
/// One read-only instance is shared by all runs; see [`InjectionTable::standard`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionTable {
    pub permissions: Vec<String>,
    pub provider_name: String,
    /// Appended to `<package>.` to form the provider authority.
    pub provider_authority_suffix: String,
    pub ipc_permission: String,
    pub export_receiver: ReceiverSpec,
    pub control_receiver: ReceiverSpec,
    pub placeholder_activity: ActivitySpec,
    /// Lowest `minSdkVersion` for which the provider gets `initOrder`.
    pub init_order_min_sdk: i32,
    pub config_asset: String,
    pub bundle_asset: String,
    pub native_abi: String,
}

const CLONER_PREFIX: &str = "com.applisto.appcloner";
const IPC_PERMISSION: &str = "com.applisto.appcloner.permission.REPLICA_IPC";

/// `@android:style/Theme.NoTitleBar.Fullscreen`
pub const THEME_NO_TITLE_BAR_FULLSCREEN: u32 = 0x0103_000a;

impl Default for InjectionTable {
    fn default() -> Self {
        let action = |name: &str| format!("{CLONER_PREFIX}.{name}");
        InjectionTable {
            permissions: vec![
                "android.permission.READ_EXTERNAL_STORAGE".to_string(),
                "android.permission.WRITE_EXTERNAL_STORAGE".to_string(),
            ],
            provider_name: format!("{CLONER_PREFIX}.DefaultProvider"),
            provider_authority_suffix: format!("{CLONER_PREFIX}.DefaultProvider"),
            ipc_permission: IPC_PERMISSION.to_string(),
            export_receiver: ReceiverSpec {
                name: format!("{CLONER_PREFIX}.DataExportReceiver"),
                exported: true,
                permission: Some(IPC_PERMISSION.to_string()),
                actions: vec![action("ACTION_EXPORT_DATA")],
            },
            control_receiver: ReceiverSpec {
                name: format!("{CLONER_PREFIX}.CameraControlReceiver"),
                exported: false,
                permission: None,
                actions: [
                    "ACTION_ROTATE_CLOCKWISE",
                    "ACTION_ROTATE_COUNTERCLOCKWISE",
                    "ACTION_FLIP_HORIZONTALLY",
                    "ACTION_ZOOM_IN",
                    "ACTION_ZOOM_OUT",
                ]
                .iter()
                .map(|name| action(name))
                .collect(),
            },
            placeholder_activity: ActivitySpec {
                name: format!("{CLONER_PREFIX}.FakeCameraActivity"),
                exported: true,
                theme: THEME_NO_TITLE_BAR_FULLSCREEN,
            },
            init_order_min_sdk: 24,
            config_asset: "assets/cloner.json".to_string(),
            bundle_asset: "assets/app_data_export.zip".to_string(),
            native_abi: "arm64-v8a".to_string(),
        }
    }
}

static STANDARD_TABLE: Lazy<InjectionTable> = Lazy::new(InjectionTable::default);

impl InjectionTable {
    /// The process-wide default table.
    pub fn standard() -> &'static InjectionTable {
        &STANDARD_TABLE
    }

    /// Parse a table from JSON; absent keys fall back to the defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| InjectError::Table(err.to_string()))
    }

    pub fn provider_authority(&self, package: &str) -> String {
        format!("{package}.{}", self.provider_authority_suffix)
    }

    pub fn native_dir(&self) -> String {
        format!("lib/{}", self.native_abi)
    }
}

/// Knobs for one pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Where scratch trees are created; `None` uses the system temp dir.
    pub scratch_root: Option<PathBuf>,
    pub bundle_limit: u64,
    /// Run post-signing verification (needs the `verify` feature).
    pub verify: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            scratch_root: None,
            bundle_limit: DEFAULT_BUNDLE_LIMIT,
            verify: cfg!(feature = "verify"),
        }
    }
}

/// The user's clone configuration as it will be embedded into the archive.
#[derive(Clone, Debug, PartialEq)]
pub struct ClonerConfig {
    pub values: Map<String, Value>,
    /// Bytes written to the config asset: the file verbatim if it parsed, `{}` otherwise.
    pub asset_bytes: Vec<u8>,
}

impl ClonerConfig {
    pub fn empty() -> Self {
        ClonerConfig {
            values: Map::new(),
            asset_bytes: b"{}".to_vec(),
        }
    }

    /// Read a configuration file, degrading to an empty object on any failure.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!("{err}; continuing with an empty configuration");
                Self::empty()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|err| InjectError::ConfigRead(format!("{}: {err}", path.display())))?;
        Self::from_bytes(bytes)
            .map_err(|err| InjectError::ConfigRead(format!("{}: {err}", path.display())))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> std::result::Result<Self, String> {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(values)) => Ok(ClonerConfig {
                values,
                asset_bytes: bytes,
            }),
            Ok(_) => Err("top-level JSON value is not an object".to_string()),
            Err(err) => Err(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_authority() {
        let table = InjectionTable::standard();
        assert_eq!(
            table.provider_authority("com.example.app"),
            "com.example.app.com.applisto.appcloner.DefaultProvider"
        );
        assert_eq!(table.control_receiver.actions.len(), 5);
        assert!(table.control_receiver.permission.is_none());
        assert_eq!(table.native_dir(), "lib/arm64-v8a");
    }

    #[test]
    fn partial_table_json_keeps_defaults() {
        let table = InjectionTable::from_json(r#"{"native_abi": "x86_64"}"#).expect("parse");
        assert_eq!(table.native_abi, "x86_64");
        assert_eq!(table.provider_name, InjectionTable::standard().provider_name);
    }

    #[test]
    fn malformed_table_is_a_table_error() {
        for text in [r#"{"native_abi": 7}"#, "{not json", r#""lib/x86""#] {
            assert!(
                matches!(InjectionTable::from_json(text), Err(InjectError::Table(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn non_object_config_is_rejected() {
        assert!(ClonerConfig::from_bytes(b"[1, 2]".to_vec()).is_err());
        assert!(ClonerConfig::from_bytes(b"not json".to_vec()).is_err());
        let config = ClonerConfig::from_bytes(br#"{"a": true}"#.to_vec()).expect("object");
        assert_eq!(config.values.get("a"), Some(&Value::Bool(true)));
    }
}
