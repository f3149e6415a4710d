use crate::app_dirs::AppDirs;
use crate::error::{Error, Result};
use crate::mastery::{IntervalTable, DEFAULT_INTERVALS_MINUTES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BLEND_UNIT_SHARE: f64 = 0.7;
pub const DEFAULT_WORD_COUNT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Progress database; `None` resolves to the per-user state directory
    pub database_path: Option<PathBuf>,
    /// JSON word catalog; `None` uses the bundled sample textbook
    pub catalog_path: Option<PathBuf>,
    pub review_intervals_minutes: Vec<u64>,
    pub blend_unit_share: f64,
    pub default_word_count: usize,
    /// Limit selection to words the learner has answered wrong before
    pub wrong_words_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            catalog_path: None,
            review_intervals_minutes: DEFAULT_INTERVALS_MINUTES.to_vec(),
            blend_unit_share: DEFAULT_BLEND_UNIT_SHARE,
            default_word_count: DEFAULT_WORD_COUNT,
            wrong_words_only: false,
        }
    }
}

impl Config {
    pub fn interval_table(&self) -> Result<IntervalTable> {
        IntervalTable::from_minutes(&self.review_intervals_minutes)
    }

    pub fn validate(&self) -> Result<()> {
        self.interval_table()?;
        if !(0.0..=1.0).contains(&self.blend_unit_share) {
            return Err(Error::InvalidConfig(format!(
                "blend_unit_share must be within 0..=1, got {}",
                self.blend_unit_share
            )));
        }
        if self.default_word_count == 0 {
            return Err(Error::InvalidConfig(
                "default_word_count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .or_else(AppDirs::db_path)
            .unwrap_or_else(|| PathBuf::from("tingxie_progress.db"))
    }
}

pub trait ConfigStore {
    fn load(&self) -> Config;
    fn save(&self, cfg: &Config) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            path: AppDirs::config_path(),
        }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Config {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<Config>(&bytes) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), %err, "ignoring unreadable config");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    fn save(&self, cfg: &Config) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = FileConfigStore::with_path(&path);
        let cfg = Config::default();
        store.save(&cfg).unwrap();
        let loaded = store.load();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn save_and_load_custom_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let store = FileConfigStore::with_path(&path);
        let cfg = Config {
            database_path: Some(dir.path().join("progress.db")),
            catalog_path: None,
            review_intervals_minutes: vec![1, 10, 60],
            blend_unit_share: 0.5,
            default_word_count: 20,
            wrong_words_only: true,
        };
        store.save(&cfg).unwrap();
        let loaded = store.load();
        assert_eq!(cfg, loaded);
        assert_eq!(loaded.interval_table().unwrap().max_stage(), 3);
    }

    #[test]
    fn missing_or_broken_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(FileConfigStore::with_path(&path).load(), Config::default());

        fs::write(&path, b"{ not json").unwrap();
        assert_eq!(FileConfigStore::with_path(&path).load(), Config::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, br#"{"default_word_count": 5}"#).unwrap();
        let cfg = FileConfigStore::with_path(&path).load();
        assert_eq!(cfg.default_word_count, 5);
        assert_eq!(cfg.blend_unit_share, DEFAULT_BLEND_UNIT_SHARE);
        assert!(!cfg.wrong_words_only);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(Config::default().validate().is_ok());

        let cfg = Config {
            blend_unit_share: 1.5,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            review_intervals_minutes: vec![],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            review_intervals_minutes: vec![5, 10_000_000_000_000],
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }
}
