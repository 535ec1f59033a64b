use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Overrides `data_dir` when set.
pub const STORE_DIR_ENV: &str = "NEVERLIGHT_MAIL_STORE_DIR";

fn default_display_count() -> u32 {
    25
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Per-account store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub account_uuid: String,
    /// Directory holding the database and attachment directory. Defaults to
    /// the XDG data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Visible limit given to newly created folders.
    #[serde(default = "default_display_count")]
    pub display_count: u32,
    /// Keep every header instead of the fixed allow-list.
    #[serde(default)]
    pub save_all_headers: bool,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl StoreConfig {
    pub fn new(account_uuid: impl Into<String>) -> Self {
        StoreConfig {
            account_uuid: account_uuid.into(),
            data_dir: None,
            display_count: default_display_count(),
            save_all_headers: false,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    /// A config with a freshly generated account id.
    pub fn new_account() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Resolve where the store lives: env var, then config, then XDG data dir.
    pub fn layout(&self) -> StorageLayout {
        let base = std::env::var_os(STORE_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| self.data_dir.clone())
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("neverlight-mail")
            });
        StorageLayout::new(&base, &self.account_uuid)
    }

    /// Load the store config. Returns `Ok(None)` when no file exists yet.
    pub fn load() -> Result<Option<Self>> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data =
            fs::read_to_string(path).map_err(|e| Error::Config(format!("read config: {e}")))?;
        let cfg = serde_json::from_str::<StoreConfig>(&data)
            .map_err(|e| Error::Config(format!("parse config: {e}")))?;
        log::debug!("Store config loaded from {}", path.display());
        Ok(Some(cfg))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("create config dir: {e}")))?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serialize config: {e}")))?;
        fs::write(path, data).map_err(|e| Error::Config(format!("write config: {e}")))
    }
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("neverlight-mail")
        .join("store.json")
}

/// Physical location of one account's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub account_uuid: String,
    pub database: PathBuf,
    pub attachments: PathBuf,
}

impl StorageLayout {
    pub fn new(base: &Path, account_uuid: &str) -> Self {
        StorageLayout {
            account_uuid: account_uuid.to_string(),
            database: base.join(format!("{account_uuid}.db")),
            attachments: base.join(format!("{account_uuid}.db_att")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{"account_uuid":"abc"}"#).expect("parse minimal config");
        assert_eq!(cfg.display_count, 25);
        assert!(!cfg.save_all_headers);
        assert_eq!(cfg.busy_timeout_ms, 5000);
        assert_eq!(cfg.data_dir, None);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.json");
        let cfg = StoreConfig::new("acct").with_data_dir(dir.path());
        cfg.save_to(&path).expect("save config");

        let loaded = StoreConfig::load_from(&path)
            .expect("load config")
            .expect("config present");
        assert_eq!(loaded, cfg);
        assert!(StoreConfig::load_from(&dir.path().join("absent.json"))
            .expect("absent is not an error")
            .is_none());
    }

    #[test]
    fn layout_is_named_after_account() {
        let layout = StorageLayout::new(Path::new("/data"), "acct");
        assert_eq!(layout.database, PathBuf::from("/data/acct.db"));
        assert_eq!(layout.attachments, PathBuf::from("/data/acct.db_att"));
    }
}
